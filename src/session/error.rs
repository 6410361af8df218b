//! Connection error types

use thiserror::Error;

use crate::client::ClientError;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Duration must be at least one minute")]
    InvalidDuration,

    #[error("Failed to create client: {0}")]
    Client(#[from] ClientError),
}

impl serde::Serialize for ConnectionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
