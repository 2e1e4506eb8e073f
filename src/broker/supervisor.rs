//! Acquire a broker: attach to a running one or own a fresh one.
//!
//! Producers call [`acquire`] at startup. A short TCP probe decides
//! whether a broker is already listening; if not, one is started
//! in-process and wired to SIGINT/SIGTERM. A process-local starting
//! flag keeps two threads from racing the spawn; across processes the
//! race is settled by the listen bind failing for the second bidder,
//! which then attaches.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::BrokerSettings;

use super::server::{self, BrokerError, BrokerHandle};

static STARTING: AtomicBool = AtomicBool::new(false);

const PROBE_TIMEOUT: Duration = Duration::from_millis(250);
const WAIT_FOR_PEER_START: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// A broker was already listening; the caller must not stop it.
    Attached,
    /// This process started the broker and stops it on shutdown.
    Owner,
}

pub struct BrokerAccess {
    ownership: Ownership,
    addr: SocketAddr,
    handle: Option<BrokerHandle>,
}

impl BrokerAccess {
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_owner(&self) -> bool {
        self.ownership == Ownership::Owner
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the broker if this access owns it; a no-op when attached.
    pub fn stop(self) {
        if let Some(handle) = self.handle {
            handle.stop();
        }
    }
}

/// Attach to the broker at the configured address, or start one.
pub fn acquire(settings: &BrokerSettings) -> Result<BrokerAccess, BrokerError> {
    let addr = resolve(settings)?;
    if probe(addr) {
        tracing::debug!(%addr, "attached to running broker");
        return Ok(BrokerAccess {
            ownership: Ownership::Attached,
            addr,
            handle: None,
        });
    }

    if STARTING.swap(true, Ordering::SeqCst) {
        // Another thread in this process is starting the broker; wait
        // for its listener instead of racing the bind.
        return wait_for_listener(addr).map(|()| BrokerAccess {
            ownership: Ownership::Attached,
            addr,
            handle: None,
        });
    }

    let result = start_owned(settings, addr);
    STARTING.store(false, Ordering::SeqCst);
    result
}

fn start_owned(settings: &BrokerSettings, addr: SocketAddr) -> Result<BrokerAccess, BrokerError> {
    match server::start(settings) {
        Ok(handle) => {
            let flag = handle.shutdown_flag();
            let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag));
            let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, flag);
            let addr = handle.addr();
            tracing::info!(%addr, "broker started in-process");
            Ok(BrokerAccess {
                ownership: Ownership::Owner,
                addr,
                handle: Some(handle),
            })
        }
        Err(BrokerError::Io(err)) if err.kind() == std::io::ErrorKind::AddrInUse => {
            // Lost the cross-process race; the winner is (or will be)
            // listening.
            wait_for_listener(addr).map(|()| BrokerAccess {
                ownership: Ownership::Attached,
                addr,
                handle: None,
            })
        }
        Err(err) => Err(err),
    }
}

fn resolve(settings: &BrokerSettings) -> Result<SocketAddr, BrokerError> {
    settings
        .listen_addr()
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            BrokerError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no address for {}", settings.listen_addr()),
            ))
        })
}

fn probe(addr: SocketAddr) -> bool {
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
}

fn wait_for_listener(addr: SocketAddr) -> Result<(), BrokerError> {
    let deadline = Instant::now() + WAIT_FOR_PEER_START;
    let mut backoff = Duration::from_millis(25);
    while Instant::now() < deadline {
        if probe(addr) {
            return Ok(());
        }
        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(Duration::from_millis(200));
    }
    Err(BrokerError::StartTimeout)
}
