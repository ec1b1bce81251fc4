use std::time::Duration;

use thiserror::Error;

use murmur_shared::ProtocolError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Connection to relay failed: {0}")]
    Connect(String),

    #[error("Relay transport error: {0}")]
    Transport(String),

    #[error("Relay closed the connection")]
    Closed,

    #[error("Relay is not open: {0}")]
    RelayUnavailable(String),

    #[error("No relay connection opened within {0:?}")]
    ConnectionTimeout(Duration),

    #[error("Relay pool has shut down")]
    PoolClosed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
