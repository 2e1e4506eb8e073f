use thiserror::Error;

use crate::broker::BrokerError;
use crate::client::ClientError;
use crate::config::ConfigError;
use crate::protocol::codec::DecodeError;

/// Crate-level convenience error: a thin wrapper over the module
/// errors, not a god error.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}
