//! Session registry indexed by connection id and logical client id.
//!
//! Owned exclusively by the broker's state thread; every mutation goes
//! through that single serialized path.

use std::collections::HashMap;

use thiserror::Error;

use crate::protocol::Role;

use super::session::{ConnId, Session};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("client id already registered: {0}")]
    DuplicateId(String),

    #[error("client id must not be empty")]
    EmptyId,
}

#[derive(Default)]
pub struct Registry {
    by_conn: HashMap<ConnId, Session>,
    by_id: HashMap<String, ConnId>,
    registrations: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_id(&self, client_id: &str) -> bool {
        self.by_id.contains_key(client_id)
    }

    /// Insert a session, stamping its registration order.
    pub fn insert(&mut self, mut session: Session) -> Result<(), RegisterError> {
        if session.client_id.is_empty() {
            return Err(RegisterError::EmptyId);
        }
        if self.by_id.contains_key(&session.client_id) {
            return Err(RegisterError::DuplicateId(session.client_id.clone()));
        }
        session.registered_at = self.registrations;
        self.registrations += 1;
        self.by_id.insert(session.client_id.clone(), session.conn);
        self.by_conn.insert(session.conn, session);
        Ok(())
    }

    pub fn remove_conn(&mut self, conn: ConnId) -> Option<Session> {
        let session = self.by_conn.remove(&conn)?;
        self.by_id.remove(&session.client_id);
        Some(session)
    }

    pub fn get(&self, client_id: &str) -> Option<&Session> {
        self.by_id.get(client_id).and_then(|conn| self.by_conn.get(conn))
    }

    pub fn get_conn(&self, conn: ConnId) -> Option<&Session> {
        self.by_conn.get(&conn)
    }

    pub fn touch(&mut self, conn: ConnId) {
        if let Some(session) = self.by_conn.get_mut(&conn) {
            session.touch();
        }
    }

    pub fn with_role(&self, role: Role) -> impl Iterator<Item = &Session> {
        self.by_conn.values().filter(move |s| s.role == role)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.by_conn.values()
    }

    pub fn len(&self) -> usize {
        self.by_conn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_conn.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(conn: ConnId, id: &str, role: Role) -> Session {
        let (tx, _rx) = crossbeam::channel::unbounded();
        Session::new(conn, id.to_string(), role, tx, None)
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut registry = Registry::new();
        registry.insert(session(1, "cli-1", Role::Consumer)).unwrap();
        let err = registry
            .insert(session(2, "cli-1", Role::Consumer))
            .unwrap_err();
        assert_eq!(err, RegisterError::DuplicateId("cli-1".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_id_is_rejected() {
        let mut registry = Registry::new();
        let err = registry.insert(session(1, "", Role::Producer)).unwrap_err();
        assert_eq!(err, RegisterError::EmptyId);
    }

    #[test]
    fn registration_order_is_monotonic() {
        let mut registry = Registry::new();
        registry.insert(session(1, "a", Role::Consumer)).unwrap();
        registry.insert(session(2, "b", Role::Consumer)).unwrap();
        let a = registry.get("a").unwrap().registered_at;
        let b = registry.get("b").unwrap().registered_at;
        assert!(a < b);
    }

    #[test]
    fn remove_clears_both_indexes() {
        let mut registry = Registry::new();
        registry.insert(session(1, "a", Role::Producer)).unwrap();
        let removed = registry.remove_conn(1).unwrap();
        assert_eq!(removed.client_id, "a");
        assert!(registry.get("a").is_none());
        assert!(registry.get_conn(1).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn role_filter() {
        let mut registry = Registry::new();
        registry.insert(session(1, "p1", Role::Producer)).unwrap();
        registry.insert(session(2, "c1", Role::Consumer)).unwrap();
        registry.insert(session(3, "c2", Role::Consumer)).unwrap();
        assert_eq!(registry.with_role(Role::Consumer).count(), 2);
        assert_eq!(registry.with_role(Role::Producer).count(), 1);
    }
}
