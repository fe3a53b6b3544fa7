//! Error taxonomy for the MPD client.
//!
//! Errors fall into three groups:
//! - transport and protocol failures, which poison the connection
//!   ([`MpdError::is_fatal`] returns `true`)
//! - command failures (`ACK` lines), which are local to one command
//! - authentication failures, kept apart so callers can prompt for credentials

use std::time::Duration;
use thiserror::Error;

use crate::protocol::AckError;

/// Every failure the client can report.
#[derive(Debug, Error)]
pub enum MpdError {
    /// No connection is established (or it was dropped after a fatal error).
    #[error("Not connected to MPD")]
    NotConnected,

    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Connection refused by {0}")]
    ConnectRefused(String),

    /// Host name could not be resolved to any address.
    #[error("Could not resolve host {0}")]
    Dns(String),

    /// The server closed the stream.
    #[error("Connection closed by server")]
    Eof,

    #[error("Read timed out after {0:?}")]
    ReadTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte stream no longer follows the protocol framing.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server rejected a command.
    #[error("{0}")]
    Ack(AckError),

    /// The server rejected the configured password.
    #[error("Authentication failed: {0}")]
    Auth(AckError),

    /// A command could not be encoded (e.g. an argument contains a newline).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl MpdError {
    /// Whether this error leaves the connection unusable.
    ///
    /// Command and authentication errors keep the stream framed; everything
    /// that touched the socket or broke framing does not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout(_)
                | Self::ConnectRefused(_)
                | Self::Dns(_)
                | Self::Eof
                | Self::ReadTimeout(_)
                | Self::Io(_)
                | Self::Protocol(_)
        )
    }

    /// The server-side error, if this is a command or authentication failure.
    pub fn ack(&self) -> Option<&AckError> {
        match self {
            Self::Ack(ack) | Self::Auth(ack) => Some(ack),
            _ => None,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

impl From<AckError> for MpdError {
    fn from(ack: AckError) -> Self {
        Self::Ack(ack)
    }
}

pub type Result<T, E = MpdError> = std::result::Result<T, E>;
