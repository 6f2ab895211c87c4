//! Error handling for the session engine and wire codec.

use std::time::Duration;

use thiserror::Error;

/// The main result type used throughout the client.
pub type TlcpResult<T> = Result<T, TlcpError>;

/// An error reported by the server, carrying its numeric code and text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// `CONERR`: the server refused to create or bind the session.
    #[error("{code}: {message}")]
    ConnectionError { code: i32, message: String },

    /// `END`: the server closed the session.
    #[error("{code}: {message}")]
    End { code: i32, message: String },

    /// `ERROR`: a session-wide server error.
    #[error("{code}: {message}")]
    Error { code: i32, message: String },

    /// `REQERR`: a single request was refused.
    #[error("{code}: {message}")]
    RequestError { code: i32, message: String },
}

impl ServerError {
    /// Server error code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ConnectionError { code, .. }
            | Self::End { code, .. }
            | Self::Error { code, .. }
            | Self::RequestError { code, .. } => *code,
        }
    }

    /// Server error description.
    pub fn message(&self) -> &str {
        match self {
            Self::ConnectionError { message, .. }
            | Self::End { message, .. }
            | Self::Error { message, .. }
            | Self::RequestError { message, .. } => message,
        }
    }
}

/// Comprehensive error type for all client operations.
#[derive(Error, Debug, Clone)]
pub enum TlcpError {
    /// The physical channel failed or closed.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// A bounded wait expired.
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Inbound data could not be decoded.
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// The server broke the protocol contract.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Error reported by the server.
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// A local precondition was violated.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The owning session or client was closed.
    #[error("Cancelled: {reason}")]
    Cancelled {
        reason: String,
        server_error: Option<ServerError>,
    },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TlcpError {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a cancellation without an underlying server cause.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
            server_error: None,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether the connect cycle may be retried after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// The server exception behind this error, if any.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Self::Server(err) => Some(err),
            Self::Cancelled { server_error, .. } => server_error.as_ref(),
            _ => None,
        }
    }

    /// Convert a session termination cause into the error seen by its dependents.
    pub(crate) fn into_cancellation(self) -> Self {
        match self {
            Self::Cancelled { .. } => self,
            Self::Server(err) => Self::Cancelled {
                reason: err.to_string(),
                server_error: Some(err),
            },
            other => Self::cancelled(other.to_string()),
        }
    }
}
