#![forbid(unsafe_code)]

//! backchannel: a local message-routing fabric between AI-agent
//! processes (producers) and interactive terminals (consumers).
//!
//! Producers send clarification requests (each expecting exactly one
//! human reply) and yap notifications (one-way). The broker delivers,
//! queues, balances, and times out; the client library speaks the
//! newline-delimited JSON wire protocol and reconnects with backoff.

pub mod broker;
#[cfg(feature = "cli")]
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use broker::{BrokerAccess, BrokerHandle, Ownership};
pub use client::{BrokerClient, ClientConfig, ClientError, ClientEvent};
pub use protocol::{
    ClarificationPayload, DEFAULT_PORT, Envelope, ErrorPayload, Kind, ReplyPayload, RequestStatus,
    ResponsePayload, Role, SyncPayload, Urgency, YapPayload,
};
