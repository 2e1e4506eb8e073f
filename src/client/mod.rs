//! Broker client used by producers and consumers.
//!
//! The client owns one background session thread. The thread connects,
//! registers, then multiplexes three sources: inbound envelopes from a
//! reader thread, send commands from the caller, and a heartbeat tick.
//! On disconnect it rejects every pending reply slot, emits
//! `Disconnected`, and reconnects with exponential backoff until the
//! attempt cap, after which it emits `ReconnectExhausted` and stops.

pub mod backoff;
pub mod pending;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::codec::LineDecoder;
use crate::protocol::{
    ClarificationPayload, DEFAULT_PORT, Envelope, ErrorPayload, Kind, ReplyPayload,
    ResponsePayload, Role, YapPayload, codec,
};

use backoff::Backoff;
use pending::{PendingReplies, ReplyOutcome};

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub role: Role,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub register_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl ClientConfig {
    pub fn new(client_id: &str, role: Role) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            client_id: client_id.to_string(),
            role,
            heartbeat_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
            register_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 10,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Apply the timing knobs from loaded configuration.
    pub fn with_settings(mut self, settings: &crate::config::ClientSettings) -> Self {
        self.heartbeat_interval = settings.heartbeat_interval();
        self.connect_timeout = settings.connect_timeout();
        self.register_timeout = settings.register_timeout();
        self.reconnect_delay = settings.reconnect_delay();
        self.max_reconnect_attempts = settings.max_reconnect_attempts;
        self
    }
}

/// Events delivered to the caller over the channel returned by
/// [`BrokerClient::connect`].
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Clarification {
        /// Originating producer.
        from: String,
        request: ClarificationPayload,
    },
    Yap {
        from: String,
        yap: YapPayload,
    },
    /// Registered (or re-registered after a reconnect).
    Sync,
    Disconnected,
    ReconnectExhausted,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(
        "no broker listening on {host}:{port}; start one with `bch broker` \
         or launch a producer that spawns it ({source})"
    )]
    ConnectionRefused {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("not connected to broker")]
    NotConnected,

    #[error("broker connection lost")]
    ConnectionLost,

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("timed out after {timeout_ms} ms waiting for a reply to {request_id}")]
    ResponseTimeout { request_id: String, timeout_ms: u64 },

    #[error("broker rejected request {request_id}: {reason}")]
    Rejected { request_id: String, reason: String },

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client is shut down")]
    Closed,
}

enum Command {
    Send {
        envelope: Envelope,
        respond: Sender<Result<(), ClientError>>,
    },
}

enum Inbound {
    Envelope(Envelope),
    Malformed(String),
    Closed,
}

struct SessionContext {
    config: ClientConfig,
    pending: Arc<PendingReplies>,
    shutdown: Arc<AtomicBool>,
    events: Sender<ClientEvent>,
    cmd_rx: Receiver<Command>,
}

impl SessionContext {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct BrokerClient {
    config: ClientConfig,
    cmd_tx: Option<Sender<Command>>,
    pending: Arc<PendingReplies>,
    shutdown: Arc<AtomicBool>,
    sequence: AtomicU64,
    join: Option<JoinHandle<()>>,
}

impl BrokerClient {
    /// Open the TCP connection, register, and resolve on the broker's
    /// `sync` acknowledgement. The returned receiver carries delivery
    /// and lifecycle events.
    pub fn connect(config: ClientConfig) -> Result<(Self, Receiver<ClientEvent>), ClientError> {
        let (cmd_tx, cmd_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let pending = Arc::new(PendingReplies::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let ctx = SessionContext {
            config: config.clone(),
            pending: Arc::clone(&pending),
            shutdown: Arc::clone(&shutdown),
            events: event_tx,
            cmd_rx,
        };

        let (first_tx, first_rx) = bounded(1);
        let join = std::thread::Builder::new()
            .name("broker-client".to_string())
            .spawn(move || run_session(ctx, first_tx))?;

        match first_rx.recv() {
            Ok(Ok(())) => Ok((
                Self {
                    config,
                    cmd_tx: Some(cmd_tx),
                    pending,
                    shutdown,
                    sequence: AtomicU64::new(1),
                    join: Some(join),
                },
                event_rx,
            )),
            Ok(Err(err)) => {
                let _ = join.join();
                Err(err)
            }
            Err(_) => Err(ClientError::Closed),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Send a clarification request (producers).
    pub fn send_clarification(&self, request: &ClarificationPayload) -> Result<(), ClientError> {
        self.send_payload(Kind::Clarification, request)
    }

    /// Send a yap notification (producers).
    pub fn send_yap(&self, yap: &YapPayload) -> Result<(), ClientError> {
        self.send_payload(Kind::Yap, yap)
    }

    /// Send a reply to the active clarification (consumers).
    pub fn send_response(&self, reply: &ReplyPayload) -> Result<(), ClientError> {
        self.send_payload(Kind::Response, reply)
    }

    /// Register a one-shot slot and wait for the correlated response.
    ///
    /// The request itself stays queued broker-side on timeout; a late
    /// reply is silently ignored.
    pub fn await_reply(&self, request_id: &str, timeout: Duration) -> Result<Value, ClientError> {
        let rx = self.pending.register(request_id);
        self.wait_for_reply(rx, request_id, timeout)
    }

    /// Send a clarification and wait for the reply. The reply slot is
    /// registered before the bytes leave, so even an immediate
    /// response correlates.
    pub fn clarify(
        &self,
        request: &ClarificationPayload,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let rx = self.pending.register(&request.id);
        if let Err(err) = self.send_clarification(request) {
            self.pending.cancel(&request.id);
            return Err(err);
        }
        self.wait_for_reply(rx, &request.id, timeout)
    }

    fn wait_for_reply(
        &self,
        rx: Receiver<ReplyOutcome>,
        request_id: &str,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        match rx.recv_timeout(timeout) {
            Ok(ReplyOutcome::Answered(value)) => Ok(value),
            Ok(ReplyOutcome::Rejected(reason)) => Err(ClientError::Rejected {
                request_id: request_id.to_string(),
                reason,
            }),
            Ok(ReplyOutcome::ConnectionLost) => Err(ClientError::ConnectionLost),
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                self.pending.cancel(request_id);
                Err(ClientError::ResponseTimeout {
                    request_id: request_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                Err(ClientError::ConnectionLost)
            }
        }
    }

    fn send_payload<T: serde::Serialize>(&self, kind: Kind, payload: &T) -> Result<(), ClientError> {
        let mut envelope =
            Envelope::with_payload(kind, &self.config.client_id, self.config.role, payload)?;
        envelope.sequence = Some(self.sequence.fetch_add(1, Ordering::Relaxed));

        let cmd_tx = self.cmd_tx.as_ref().ok_or(ClientError::Closed)?;
        let (respond, result) = bounded(1);
        cmd_tx
            .send(Command::Send { envelope, respond })
            .map_err(|_| ClientError::Closed)?;
        result.recv().map_err(|_| ClientError::NotConnected)?
    }

    /// Stop the session thread and close the connection.
    pub fn close(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Dropping the command sender wakes the session loop.
        self.cmd_tx = None;
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.cmd_tx = None;
    }
}

fn run_session(ctx: SessionContext, first: Sender<Result<(), ClientError>>) {
    let mut first = Some(first);
    let mut backoff = Backoff::new(ctx.config.reconnect_delay, ctx.config.max_reconnect_attempts);

    loop {
        if ctx.is_shutdown() {
            break;
        }

        match connect_and_register(&ctx.config) {
            Ok((stream, decoder, leftovers)) => {
                backoff.reset();
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }
                ctx.emit(ClientEvent::Sync);
                run_connected(&ctx, stream, decoder, leftovers);
                // Reject pending waits before the backoff timer rearms
                // so callers observe the failure synchronously.
                ctx.pending.fail_all(ReplyOutcome::ConnectionLost);
                if ctx.is_shutdown() {
                    break;
                }
                ctx.emit(ClientEvent::Disconnected);
            }
            Err(err) => {
                // The initial connect reports straight to the caller
                // and does not retry.
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(err));
                    return;
                }
                tracing::warn!(
                    client_id = %ctx.config.client_id,
                    attempt = backoff.attempt(),
                    "reconnect failed: {err}"
                );
            }
        }

        match backoff.next_delay() {
            Some(delay) => {
                if drain_until(&ctx, delay) {
                    break;
                }
            }
            None => {
                tracing::warn!(client_id = %ctx.config.client_id, "reconnect attempts exhausted");
                ctx.emit(ClientEvent::ReconnectExhausted);
                break;
            }
        }
    }

    // Whatever is still queued can never be sent.
    while let Ok(Command::Send { respond, .. }) = ctx.cmd_rx.try_recv() {
        let _ = respond.send(Err(ClientError::Closed));
    }
}

/// Sleep out the backoff window while answering send attempts with
/// not-connected. Returns true when shutdown was requested.
fn drain_until(ctx: &SessionContext, delay: Duration) -> bool {
    let timer = crossbeam::channel::after(delay);
    loop {
        crossbeam::select! {
            recv(ctx.cmd_rx) -> cmd => match cmd {
                Ok(Command::Send { respond, .. }) => {
                    let _ = respond.send(Err(ClientError::NotConnected));
                }
                Err(_) => return true,
            },
            recv(timer) -> _ => return ctx.is_shutdown(),
        }
    }
}

type Registered = (TcpStream, LineDecoder, Vec<Envelope>);

fn connect_and_register(config: &ClientConfig) -> Result<Registered, ClientError> {
    let addr = resolve(config)?;
    let stream = TcpStream::connect_timeout(&addr, config.connect_timeout).map_err(|source| {
        ClientError::ConnectionRefused {
            host: config.host.clone(),
            port: config.port,
            source,
        }
    })?;
    stream.set_nodelay(true)?;

    let register = Envelope::new(
        Kind::Register,
        &config.client_id,
        config.role,
        serde_json::json!({}),
    );
    let mut writer = &stream;
    writer.write_all(&codec::encode(&register)?)?;

    stream.set_read_timeout(Some(config.register_timeout))?;
    let mut decoder = LineDecoder::new();
    let mut chunk = [0u8; 4096];
    let mut reader = &stream;

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => {
                return Err(ClientError::Registration(
                    "connection closed during registration".to_string(),
                ));
            }
            Ok(n) => n,
            Err(ref err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ClientError::Registration(
                    "timed out waiting for registration ack".to_string(),
                ));
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(ClientError::Io(err)),
        };

        let mut items = decoder.push(&chunk[..n]).into_iter();
        while let Some(item) = items.next() {
            let envelope = item.map_err(|err| ClientError::Registration(err.to_string()))?;
            match envelope.kind {
                Kind::Sync => {
                    stream.set_read_timeout(None)?;
                    let leftovers = items
                        .filter_map(|item| item.ok())
                        .collect();
                    return Ok((stream, decoder, leftovers));
                }
                Kind::Error => {
                    let reason = envelope
                        .decode_data::<ErrorPayload>()
                        .map(|p| p.error)
                        .unwrap_or_else(|_| "registration rejected".to_string());
                    return Err(ClientError::Registration(reason));
                }
                _ => {}
            }
        }
    }
}

fn resolve(config: &ClientConfig) -> Result<SocketAddr, ClientError> {
    (config.host.as_str(), config.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no address for {}:{}", config.host, config.port),
            ))
        })
}

fn run_connected(
    ctx: &SessionContext,
    stream: TcpStream,
    decoder: LineDecoder,
    leftovers: Vec<Envelope>,
) {
    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!("failed to clone stream: {err}");
            return;
        }
    };

    let (in_tx, in_rx) = unbounded();
    let reader = std::thread::spawn(move || run_reader_loop(reader_stream, decoder, in_tx));

    for envelope in leftovers {
        handle_inbound(ctx, envelope);
    }

    let mut writer = &stream;
    let heartbeat = crossbeam::channel::tick(ctx.config.heartbeat_interval);

    loop {
        crossbeam::select! {
            recv(in_rx) -> item => match item {
                Ok(Inbound::Envelope(envelope)) => handle_inbound(ctx, envelope),
                Ok(Inbound::Malformed(reason)) => {
                    tracing::warn!("malformed envelope from broker: {reason}");
                }
                Ok(Inbound::Closed) | Err(_) => break,
            },
            recv(ctx.cmd_rx) -> cmd => match cmd {
                Ok(Command::Send { envelope, respond }) => {
                    let result = codec::encode(&envelope)
                        .map_err(ClientError::Encode)
                        .and_then(|bytes| {
                            writer.write_all(&bytes).map_err(|_| ClientError::NotConnected)
                        });
                    let failed = result.is_err();
                    let _ = respond.send(result);
                    if failed {
                        break;
                    }
                }
                Err(_) => break,
            },
            recv(heartbeat) -> _ => {
                let envelope = Envelope::new(
                    Kind::Heartbeat,
                    &ctx.config.client_id,
                    ctx.config.role,
                    serde_json::json!({}),
                );
                match codec::encode(&envelope) {
                    Ok(bytes) => {
                        // A failed heartbeat write is the socket's
                        // error path telling us the session is gone.
                        if writer.write_all(&bytes).is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!("failed to encode heartbeat: {err}"),
                }
            }
        }

        if ctx.is_shutdown() {
            break;
        }
    }

    let _ = stream.shutdown(std::net::Shutdown::Both);
    let _ = reader.join();
}

fn run_reader_loop(mut stream: TcpStream, mut decoder: LineDecoder, in_tx: Sender<Inbound>) {
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                for item in decoder.push(&chunk[..n]) {
                    let msg = match item {
                        Ok(envelope) => Inbound::Envelope(envelope),
                        Err(err) => Inbound::Malformed(err.to_string()),
                    };
                    if in_tx.send(msg).is_err() {
                        return;
                    }
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    let _ = in_tx.send(Inbound::Closed);
}

fn handle_inbound(ctx: &SessionContext, envelope: Envelope) {
    match envelope.kind {
        Kind::Response => match envelope.decode_data::<ResponsePayload>() {
            Ok(payload) => {
                let outcome = match payload.error {
                    Some(reason) => ReplyOutcome::Rejected(reason),
                    None => ReplyOutcome::Answered(payload.response),
                };
                // An unmatched id is a reply whose wait already timed
                // out or was never ours.
                ctx.pending.resolve(&payload.request_id, outcome);
            }
            Err(err) => tracing::warn!("invalid response payload: {err}"),
        },
        Kind::Clarification => match envelope.decode_data::<ClarificationPayload>() {
            Ok(request) => ctx.emit(ClientEvent::Clarification {
                from: envelope.client_id,
                request,
            }),
            Err(err) => tracing::warn!("invalid clarification payload: {err}"),
        },
        Kind::Yap => match envelope.decode_data::<YapPayload>() {
            Ok(yap) => ctx.emit(ClientEvent::Yap {
                from: envelope.client_id,
                yap,
            }),
            Err(err) => tracing::warn!("invalid yap payload: {err}"),
        },
        Kind::Sync => ctx.emit(ClientEvent::Sync),
        Kind::Error => {
            let reason = envelope
                .decode_data::<ErrorPayload>()
                .map(|p| p.error)
                .unwrap_or_else(|_| "unknown".to_string());
            tracing::warn!("broker error: {reason}");
        }
        Kind::Heartbeat | Kind::Register => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_refused_names_port_and_remedy() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ClientConfig::new("agent-1", Role::Producer).with_port(port);
        let err = BrokerClient::connect(config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains(&port.to_string()), "{message}");
        assert!(message.contains("bch broker"), "{message}");
    }

    #[test]
    fn defaults_match_the_contract() {
        let config = ClientConfig::new("agent-1", Role::Producer);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_attempts, 10);
    }
}
