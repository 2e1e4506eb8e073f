//! Pending-reply table: request id → one-shot completion slot.
//!
//! Each slot is a bounded(1) channel. Slots are created when a caller
//! awaits a reply, and removed on resolution, cancellation, or the
//! connection-loss sweep. Resolving an unknown id is a late duplicate
//! and is silently ignored.

use std::collections::HashMap;
use std::sync::Mutex;

use crossbeam::channel::{Receiver, Sender, bounded};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq)]
pub enum ReplyOutcome {
    Answered(Value),
    /// The broker reported a routing failure for this request.
    Rejected(String),
    ConnectionLost,
}

#[derive(Default, Debug)]
pub struct PendingReplies {
    slots: Mutex<HashMap<String, Sender<ReplyOutcome>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the one-shot slot for a request id. A second
    /// registration for the same id replaces the first; the abandoned
    /// waiter observes a closed channel.
    pub fn register(&self, request_id: &str) -> Receiver<ReplyOutcome> {
        let (tx, rx) = bounded(1);
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(request_id.to_string(), tx);
        }
        rx
    }

    /// Resolve a slot. Returns false for unknown ids.
    pub fn resolve(&self, request_id: &str, outcome: ReplyOutcome) -> bool {
        let Ok(mut slots) = self.slots.lock() else {
            return false;
        };
        match slots.remove(request_id) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, request_id: &str) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.remove(request_id);
        }
    }

    /// Reject every outstanding slot at once (connection loss).
    pub fn fail_all(&self, outcome: ReplyOutcome) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        for (_, tx) in slots.drain() {
            let _ = tx.send(outcome.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_wakes_the_waiter() {
        let pending = PendingReplies::new();
        let rx = pending.register("q1");
        assert!(pending.resolve("q1", ReplyOutcome::Answered(json!("yes"))));
        assert_eq!(rx.recv().unwrap(), ReplyOutcome::Answered(json!("yes")));
        assert!(pending.is_empty());
    }

    #[test]
    fn unknown_id_is_ignored() {
        let pending = PendingReplies::new();
        assert!(!pending.resolve("ghost", ReplyOutcome::ConnectionLost));
    }

    #[test]
    fn cancel_removes_the_slot() {
        let pending = PendingReplies::new();
        let rx = pending.register("q1");
        pending.cancel("q1");
        assert!(!pending.resolve("q1", ReplyOutcome::Answered(Value::Null)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fail_all_rejects_every_slot() {
        let pending = PendingReplies::new();
        let rx1 = pending.register("q1");
        let rx2 = pending.register("q2");
        pending.fail_all(ReplyOutcome::ConnectionLost);
        assert_eq!(rx1.recv().unwrap(), ReplyOutcome::ConnectionLost);
        assert_eq!(rx2.recv().unwrap(), ReplyOutcome::ConnectionLost);
        assert!(pending.is_empty());
    }
}
