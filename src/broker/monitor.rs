//! Stale-session detection.
//!
//! Clients heartbeat every interval; the monitor sweeps once per
//! interval and declares sessions stale when `last_seen` lags by more
//! than the client timeout. The sweep itself never blocks the routing
//! path: it only collects connection ids, and the state loop tears
//! them down through the ordinary "session gone" path.

use std::time::{Duration, Instant};

use super::registry::Registry;
use super::session::ConnId;

pub struct Monitor {
    interval: Duration,
    timeout: Duration,
    next_sweep: Instant,
}

impl Monitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            next_sweep: Instant::now() + interval,
        }
    }

    pub fn next_deadline(&self) -> Instant {
        self.next_sweep
    }

    pub fn due(&self, now: Instant) -> bool {
        now >= self.next_sweep
    }

    /// Collect stale connections and schedule the next sweep.
    pub fn sweep(&mut self, registry: &Registry, now: Instant) -> Vec<ConnId> {
        self.next_sweep = now + self.interval;
        registry
            .sessions()
            .filter(|session| now.duration_since(session.last_seen) > self.timeout)
            .map(|session| session.conn)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::session::Session;
    use crate::protocol::Role;

    fn registry_with_session(conn: ConnId) -> Registry {
        let mut registry = Registry::new();
        let (tx, _rx) = crossbeam::channel::unbounded();
        registry
            .insert(Session::new(conn, format!("c{conn}"), Role::Consumer, tx, None))
            .unwrap();
        registry
    }

    #[test]
    fn fresh_sessions_survive_the_sweep() {
        let registry = registry_with_session(1);
        let mut monitor = Monitor::new(Duration::from_secs(5), Duration::from_secs(15));
        assert!(monitor.sweep(&registry, Instant::now()).is_empty());
    }

    #[test]
    fn lagging_sessions_are_collected() {
        let registry = registry_with_session(1);
        let mut monitor = Monitor::new(Duration::from_secs(5), Duration::from_secs(15));
        let future = Instant::now() + Duration::from_secs(16);
        assert_eq!(monitor.sweep(&registry, future), vec![1]);
    }

    #[test]
    fn sweep_reschedules_the_deadline() {
        let registry = registry_with_session(1);
        let mut monitor = Monitor::new(Duration::from_secs(5), Duration::from_secs(15));
        let now = Instant::now();
        assert!(!monitor.due(now));
        let later = now + Duration::from_secs(6);
        assert!(monitor.due(later));
        monitor.sweep(&registry, later);
        assert_eq!(monitor.next_deadline(), later + Duration::from_secs(5));
    }
}
