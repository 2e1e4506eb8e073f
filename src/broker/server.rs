//! Broker server: accept loop, connection threads, and the state loop.
//!
//! One accept loop; each connection gets a reader thread (parses
//! envelopes) and a writer thread (drains the session write queue).
//! All routing state lives on a single state thread fed over a
//! crossbeam channel, so registry/router/monitor mutations are
//! serialized without a lock. The state thread performs no I/O.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use thiserror::Error;

use crate::config::BrokerSettings;
use crate::protocol::codec::LineDecoder;
use crate::protocol::{
    ClarificationPayload, Envelope, ErrorPayload, Kind, ReplyPayload, Role, SyncPayload, YapPayload,
    codec,
};

use super::monitor::Monitor;
use super::registry::Registry;
use super::router::{Delivery, Router, RouterConfig, failure_response};
use super::session::{ConnId, Session};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for a broker to start listening")]
    StartTimeout,
}

pub(crate) enum ServerMsg {
    Connected {
        conn: ConnId,
        outbound: Sender<Vec<u8>>,
        stream: TcpStream,
    },
    Inbound {
        conn: ConnId,
        envelope: Envelope,
    },
    BadFrame {
        conn: ConnId,
        reason: String,
    },
    Disconnected {
        conn: ConnId,
    },
    Shutdown,
}

/// Handle to a running broker. Stopping joins the accept loop and the
/// state thread; connection threads exit as their sockets close.
pub struct BrokerHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    joins: Vec<JoinHandle<()>>,
}

impl BrokerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Shutdown flag shared with the accept loop; the supervisor wires
    /// signal handlers to it.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Request shutdown and wait for the broker threads to exit.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.join();
    }

    /// Wait for the broker threads to exit without requesting
    /// shutdown; use after wiring the shutdown flag to signals.
    pub fn join(self) {
        for join in self.joins {
            let _ = join.join();
        }
    }
}

/// Bind and start a broker. Returns once the listener is accepting.
pub fn start(settings: &BrokerSettings) -> Result<BrokerHandle, BrokerError> {
    let listener = TcpListener::bind(settings.listen_addr())?;
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let (msg_tx, msg_rx) = crossbeam::channel::unbounded();

    let state = BrokerState::new(settings);
    let state_join = std::thread::spawn(move || run_state_loop(state, msg_rx));

    let accept_shutdown = Arc::clone(&shutdown);
    let accept_join = std::thread::spawn(move || run_accept_loop(listener, msg_tx, accept_shutdown));

    tracing::info!(%addr, "broker listening");
    Ok(BrokerHandle {
        addr,
        shutdown,
        joins: vec![accept_join, state_join],
    })
}

/// Run a broker in the foreground until the shutdown flag trips
/// (standalone mode; the caller wires signals first via the flag).
pub fn run(settings: &BrokerSettings) -> Result<(), BrokerError> {
    let handle = start(settings)?;
    let flag = handle.shutdown_flag();
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, flag);
    handle.join();
    tracing::info!("broker stopped");
    Ok(())
}

fn run_accept_loop(listener: TcpListener, msg_tx: Sender<ServerMsg>, shutdown: Arc<AtomicBool>) {
    let conn_ids = AtomicU64::new(1);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                let conn = conn_ids.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(conn, %peer, "connection accepted");
                let msg_tx = msg_tx.clone();
                std::thread::spawn(move || {
                    let _ = stream.set_nonblocking(false);
                    handle_connection(conn, stream, msg_tx);
                });
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(err) => {
                tracing::error!("accept error: {err}");
            }
        }
    }

    let _ = msg_tx.send(ServerMsg::Shutdown);
}

/// Per-connection reader path. Spawns the writer thread, announces the
/// connection to the state thread, then parses inbound chunks until
/// the socket closes.
fn handle_connection(conn: ConnId, stream: TcpStream, msg_tx: Sender<ServerMsg>) {
    let _ = stream.set_nodelay(true);

    let writer_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(conn, "failed to clone stream: {err}");
            return;
        }
    };
    let state_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(conn, "failed to clone stream: {err}");
            return;
        }
    };

    let (out_tx, out_rx) = crossbeam::channel::unbounded::<Vec<u8>>();
    std::thread::spawn(move || run_writer_loop(writer_stream, out_rx));

    if msg_tx
        .send(ServerMsg::Connected {
            conn,
            outbound: out_tx,
            stream: state_stream,
        })
        .is_err()
    {
        return;
    }

    let mut reader = stream;
    let mut decoder = LineDecoder::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                for item in decoder.push(&chunk[..n]) {
                    let msg = match item {
                        Ok(envelope) => ServerMsg::Inbound { conn, envelope },
                        Err(err) => ServerMsg::BadFrame {
                            conn,
                            reason: err.to_string(),
                        },
                    };
                    if msg_tx.send(msg).is_err() {
                        return;
                    }
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }

    let _ = msg_tx.send(ServerMsg::Disconnected { conn });
}

fn run_writer_loop(mut stream: TcpStream, out_rx: Receiver<Vec<u8>>) {
    for bytes in out_rx {
        if stream.write_all(&bytes).is_err() {
            break;
        }
    }
}

struct PendingConn {
    outbound: Sender<Vec<u8>>,
    stream: TcpStream,
    connected_at: Instant,
}

struct BrokerState {
    registry: Registry,
    router: Router,
    monitor: Monitor,
    /// Connections accepted but not yet registered.
    pending: HashMap<ConnId, PendingConn>,
    client_timeout: Duration,
}

impl BrokerState {
    fn new(settings: &BrokerSettings) -> Self {
        Self {
            registry: Registry::new(),
            router: Router::new(RouterConfig {
                max_clarification_queue: settings.max_clarification_queue,
                yap_buffer_max: settings.yap_buffer_max,
                yap_buffer: settings.yap_buffer(),
            }),
            monitor: Monitor::new(settings.heartbeat_interval(), settings.client_timeout()),
            pending: HashMap::new(),
            client_timeout: settings.client_timeout(),
        }
    }

    fn next_deadline(&self) -> Instant {
        let monitor = self.monitor.next_deadline();
        match self.router.next_flush() {
            Some(flush) => monitor.min(flush),
            None => monitor,
        }
    }

    fn dispatch(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            if let Some(session) = self.registry.get(&delivery.target) {
                session.send(&delivery.envelope);
            }
        }
    }

    fn handle_envelope(&mut self, conn: ConnId, envelope: Envelope) {
        if self.registry.get_conn(conn).is_some() {
            self.registry.touch(conn);
            self.handle_registered(conn, envelope);
        } else if self.pending.contains_key(&conn) {
            self.handle_unregistered(conn, envelope);
        }
        // A message from a connection already torn down is dropped.
    }

    fn handle_registered(&mut self, conn: ConnId, envelope: Envelope) {
        let Some(session) = self.registry.get_conn(conn) else {
            return;
        };
        let (client_id, role) = (session.client_id.clone(), session.role);

        match (envelope.kind, role) {
            (Kind::Heartbeat, _) => {}

            (Kind::Register, _) => {
                self.send_error(conn, "already registered");
                self.session_gone(conn);
            }

            (Kind::Clarification, Role::Producer) => {
                match envelope.decode_data::<ClarificationPayload>() {
                    Ok(request) => {
                        let request_id = request.id.clone();
                        match self.router.route_clarification(&self.registry, request, &client_id) {
                            Ok(deliveries) => self.dispatch(deliveries),
                            Err(err) => {
                                tracing::debug!(%client_id, %request_id, "clarification rejected: {err}");
                                if let Some(session) = self.registry.get_conn(conn) {
                                    session.send(&failure_response(&request_id, &err));
                                }
                            }
                        }
                    }
                    Err(err) => self.send_error(conn, &format!("invalid clarification payload: {err}")),
                }
            }

            (Kind::Yap, Role::Producer) => match envelope.decode_data::<YapPayload>() {
                Ok(payload) => {
                    let timestamp = payload.timestamp;
                    self.router
                        .route_yap(&self.registry, envelope, timestamp, Instant::now());
                }
                Err(err) => self.send_error(conn, &format!("invalid yap payload: {err}")),
            },

            (Kind::Response, Role::Consumer) => match envelope.decode_data::<ReplyPayload>() {
                Ok(reply) => {
                    let deliveries = self.router.handle_reply(&self.registry, reply, &client_id);
                    self.dispatch(deliveries);
                }
                Err(err) => self.send_error(conn, &format!("invalid response payload: {err}")),
            },

            (kind, role) => {
                self.send_error(conn, &format!("unexpected {kind:?} envelope from {role} client"));
            }
        }
    }

    fn handle_unregistered(&mut self, conn: ConnId, envelope: Envelope) {
        if envelope.kind != Kind::Register {
            self.send_error(conn, "register required before any other message");
            self.close_pending(conn);
            return;
        }

        let client_id = envelope.client_id;
        let role = envelope.client_type;
        if client_id.is_empty() {
            self.send_error(conn, "client id must not be empty");
            self.close_pending(conn);
            return;
        }
        if self.registry.contains_id(&client_id) {
            self.send_error(conn, &format!("client id already registered: {client_id}"));
            self.close_pending(conn);
            return;
        }

        let Some(pending) = self.pending.remove(&conn) else {
            return;
        };
        let session = Session::new(conn, client_id.clone(), role, pending.outbound, Some(pending.stream));
        if let Err(err) = self.registry.insert(session) {
            tracing::error!(%client_id, "registration failed: {err}");
            return;
        }

        tracing::info!(%client_id, %role, "client registered");
        if let Some(session) = self.registry.get_conn(conn)
            && let Ok(ack) = Envelope::with_payload(
                Kind::Sync,
                crate::protocol::BROKER_CLIENT_ID,
                Role::Consumer,
                &SyncPayload::registered(),
            )
        {
            session.send(&ack);
        }

        if role == Role::Consumer {
            let deliveries = self.router.consumer_registered(&client_id);
            self.dispatch(deliveries);
        }
    }

    fn handle_bad_frame(&mut self, conn: ConnId, reason: String) {
        tracing::warn!(conn, "malformed frame: {reason}");
        // The connection stays open; malformed lines only earn an
        // error envelope.
        self.send_error(conn, &format!("parse error: {reason}"));
    }

    fn send_error(&self, conn: ConnId, reason: &str) {
        let Ok(envelope) = Envelope::with_payload(
            Kind::Error,
            crate::protocol::BROKER_CLIENT_ID,
            Role::Consumer,
            &ErrorPayload::new(reason),
        ) else {
            return;
        };
        if let Some(session) = self.registry.get_conn(conn) {
            session.send(&envelope);
        } else if let Some(pending) = self.pending.get(&conn)
            && let Ok(bytes) = codec::encode(&envelope)
        {
            let _ = pending.outbound.send(bytes);
        }
    }

    fn close_pending(&mut self, conn: ConnId) {
        if let Some(pending) = self.pending.remove(&conn) {
            // Give the writer a moment to drain, then drop the socket.
            let _ = pending.stream.shutdown(std::net::Shutdown::Read);
        }
    }

    /// Transport close, transport error, and monitor timeout all land
    /// here.
    fn session_gone(&mut self, conn: ConnId) {
        self.pending.remove(&conn);
        let Some(session) = self.registry.remove_conn(conn) else {
            return;
        };
        session.force_close();
        tracing::info!(client_id = %session.client_id, role = %session.role, "session gone");

        let deliveries = match session.role {
            Role::Consumer => self.router.consumer_gone(&self.registry, &session.client_id),
            Role::Producer => self.router.producer_gone(&session.client_id),
        };
        self.dispatch(deliveries);
    }

    fn on_tick(&mut self, now: Instant) {
        let deliveries = self.router.flush_due(now);
        self.dispatch(deliveries);

        if self.monitor.due(now) {
            for conn in self.monitor.sweep(&self.registry, now) {
                tracing::warn!(conn, "session stale; closing");
                self.session_gone(conn);
            }
            // Unregistered idlers age out on the same cutoff.
            let stale: Vec<ConnId> = self
                .pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.connected_at) > self.client_timeout)
                .map(|(conn, _)| *conn)
                .collect();
            for conn in stale {
                tracing::debug!(conn, "unregistered connection timed out");
                self.close_pending(conn);
            }
        }
    }

    fn close_all(&mut self) {
        let conns: Vec<ConnId> = self.registry.sessions().map(|s| s.conn).collect();
        for conn in conns {
            self.session_gone(conn);
        }
        let pending: Vec<ConnId> = self.pending.keys().copied().collect();
        for conn in pending {
            self.close_pending(conn);
        }
    }
}

fn run_state_loop(mut state: BrokerState, msg_rx: Receiver<ServerMsg>) {
    loop {
        let deadline = state.next_deadline();
        let wait = deadline.saturating_duration_since(Instant::now());
        let tick = crossbeam::channel::after(wait);

        crossbeam::select! {
            recv(msg_rx) -> msg => match msg {
                Ok(ServerMsg::Connected { conn, outbound, stream }) => {
                    state.pending.insert(conn, PendingConn {
                        outbound,
                        stream,
                        connected_at: Instant::now(),
                    });
                }
                Ok(ServerMsg::Inbound { conn, envelope }) => {
                    state.handle_envelope(conn, envelope);
                }
                Ok(ServerMsg::BadFrame { conn, reason }) => {
                    state.handle_bad_frame(conn, reason);
                }
                Ok(ServerMsg::Disconnected { conn }) => {
                    state.session_gone(conn);
                }
                Ok(ServerMsg::Shutdown) | Err(_) => {
                    state.close_all();
                    return;
                }
            },
            recv(tick) -> _ => {
                state.on_tick(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerSettings;
    use serde_json::json;

    fn test_settings() -> BrokerSettings {
        BrokerSettings {
            port: 0,
            ..BrokerSettings::default()
        }
    }

    fn state() -> BrokerState {
        BrokerState::new(&test_settings())
    }

    fn open_conn(state: &mut BrokerState, conn: ConnId) -> Receiver<Vec<u8>> {
        let (tx, rx) = crossbeam::channel::unbounded();
        // Tests drive the state machine directly; there is no real
        // socket behind the pending connection.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        state.pending.insert(
            conn,
            PendingConn {
                outbound: tx,
                stream,
                connected_at: Instant::now(),
            },
        );
        rx
    }

    fn register(state: &mut BrokerState, conn: ConnId, id: &str, role: Role) -> Receiver<Vec<u8>> {
        let rx = open_conn(state, conn);
        let envelope = Envelope::new(Kind::Register, id, role, json!({}));
        state.handle_envelope(conn, envelope);
        rx
    }

    fn recv_envelope(rx: &Receiver<Vec<u8>>) -> Envelope {
        let bytes = rx.try_recv().expect("expected an outbound envelope");
        serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap()
    }

    #[test]
    fn register_acks_with_exactly_one_sync() {
        let mut state = state();
        let rx = register(&mut state, 1, "cli-1", Role::Consumer);
        let ack = recv_envelope(&rx);
        assert_eq!(ack.kind, Kind::Sync);
        let payload: SyncPayload = ack.decode_data().unwrap();
        assert_eq!(payload.status, "registered");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn duplicate_registration_gets_error() {
        let mut state = state();
        let _first = register(&mut state, 1, "cli-1", Role::Consumer);
        let second = register(&mut state, 2, "cli-1", Role::Consumer);
        let err = recv_envelope(&second);
        assert_eq!(err.kind, Kind::Error);
        assert!(state.registry.get_conn(2).is_none());
    }

    #[test]
    fn non_register_first_envelope_is_rejected() {
        let mut state = state();
        let rx = open_conn(&mut state, 1);
        let envelope = Envelope::new(Kind::Heartbeat, "x", Role::Producer, json!({}));
        state.handle_envelope(1, envelope);
        let err = recv_envelope(&rx);
        assert_eq!(err.kind, Kind::Error);
        assert!(!state.pending.contains_key(&1));
    }

    #[test]
    fn clarification_without_consumer_synthesizes_failure() {
        let mut state = state();
        let producer = register(&mut state, 1, "p1", Role::Producer);
        let _ack = recv_envelope(&producer);

        let payload = ClarificationPayload::new("q1", "?", crate::protocol::Urgency::Low);
        let envelope =
            Envelope::with_payload(Kind::Clarification, "p1", Role::Producer, &payload).unwrap();
        state.handle_envelope(1, envelope);

        let response = recv_envelope(&producer);
        assert_eq!(response.kind, Kind::Response);
        let payload: crate::protocol::ResponsePayload = response.decode_data().unwrap();
        assert_eq!(payload.request_id, "q1");
        assert_eq!(
            payload.error.as_deref(),
            Some(super::super::router::NO_CONSUMER_ERROR)
        );
    }

    #[test]
    fn malformed_frame_keeps_connection_open() {
        let mut state = state();
        let rx = register(&mut state, 1, "p1", Role::Producer);
        let _ack = recv_envelope(&rx);

        state.handle_bad_frame(1, "bad json".to_string());
        let err = recv_envelope(&rx);
        assert_eq!(err.kind, Kind::Error);
        assert!(state.registry.get_conn(1).is_some());
    }

    #[test]
    fn end_to_end_clarify_between_fake_sessions() {
        let mut state = state();
        let producer = register(&mut state, 1, "p1", Role::Producer);
        let consumer = register(&mut state, 2, "c1", Role::Consumer);
        let _ = recv_envelope(&producer);
        let _ = recv_envelope(&consumer);

        let request = ClarificationPayload::new("q1", "a?", crate::protocol::Urgency::Low);
        let envelope =
            Envelope::with_payload(Kind::Clarification, "p1", Role::Producer, &request).unwrap();
        state.handle_envelope(1, envelope);

        let delivered = recv_envelope(&consumer);
        assert_eq!(delivered.kind, Kind::Clarification);
        assert_eq!(delivered.client_id, "p1");

        let reply = ReplyPayload::new("q1", json!("yes"));
        let envelope =
            Envelope::with_payload(Kind::Response, "c1", Role::Consumer, &reply).unwrap();
        state.handle_envelope(2, envelope);

        let response = recv_envelope(&producer);
        assert_eq!(response.kind, Kind::Response);
        let payload: crate::protocol::ResponsePayload = response.decode_data().unwrap();
        assert_eq!(payload.response, json!("yes"));
    }
}
