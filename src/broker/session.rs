//! Per-connection session state.
//!
//! A session owns its transport exclusively; the registry holds a
//! lookup reference, not ownership. Outbound envelopes are encoded and
//! placed on the session's write queue; a writer thread drains the
//! queue so the routing path never performs I/O.

use std::net::TcpStream;
use std::time::Instant;

use crossbeam::channel::Sender;

use crate::protocol::{Envelope, Role, codec};

/// Connection identifier, assigned at accept time.
pub type ConnId = u64;

pub struct Session {
    pub conn: ConnId,
    pub client_id: String,
    pub role: Role,
    /// Registration order, used as the deterministic tie-break when
    /// selecting a consumer.
    pub registered_at: u64,
    pub last_seen: Instant,
    outbound: Sender<Vec<u8>>,
    stream: Option<TcpStream>,
}

impl Session {
    pub fn new(
        conn: ConnId,
        client_id: String,
        role: Role,
        outbound: Sender<Vec<u8>>,
        stream: Option<TcpStream>,
    ) -> Self {
        Self {
            conn,
            client_id,
            role,
            registered_at: 0,
            last_seen: Instant::now(),
            outbound,
            stream,
        }
    }

    /// Enqueue an envelope on the write queue. Never blocks; if the
    /// writer thread is gone the bytes are dropped, and teardown is
    /// observed through the reader path.
    pub fn send(&self, envelope: &Envelope) {
        match codec::encode(envelope) {
            Ok(bytes) => {
                let _ = self.outbound.send(bytes);
            }
            Err(err) => {
                tracing::warn!(client_id = %self.client_id, "failed to encode envelope: {err}");
            }
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Shut the transport down in both directions, unblocking the
    /// reader thread. All teardown paths collapse into the reader's
    /// "session gone" notification.
    pub fn force_close(&self) {
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Kind;
    use serde_json::json;

    #[test]
    fn send_enqueues_encoded_line() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let session = Session::new(1, "cli-1".to_string(), Role::Consumer, tx, None);

        let envelope = Envelope::new(Kind::Sync, "broker", Role::Consumer, json!({"status": "x"}));
        session.send(&envelope);

        let bytes = rx.try_recv().unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');
        let parsed: Envelope = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn send_to_closed_writer_is_silent() {
        let (tx, rx) = crossbeam::channel::unbounded::<Vec<u8>>();
        drop(rx);
        let session = Session::new(2, "cli-2".to_string(), Role::Consumer, tx, None);
        session.send(&Envelope::new(Kind::Heartbeat, "c", Role::Consumer, json!({})));
    }
}
