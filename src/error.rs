//! Error model for the `lxd-ops` crate.

use std::time::Duration;

use thiserror::Error;

/// Convenience result type.
pub type Result<T> = std::result::Result<T, Error>;

/// High-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Transport level failure: dial, read, write, closed socket.
    Connection,
    /// Malformed payload or unexpected message.
    Protocol,
    /// The daemon answered with an error response.
    Server,
    /// An operation reached a final state with a non-empty error.
    OperationFailed,
    /// A deadline or long-poll expired before the operation finished.
    Timeout,
    /// The wait was cancelled by the caller.
    Cancelled,
    /// A handler or target could not be found.
    NotFound,
    /// The call is not supported in the current mode.
    Unsupported,
    /// Invalid arguments supplied by the caller.
    InvalidInput,
    /// Aggregated failure of a cross-server operation.
    Remote,
}

/// Structured error type.
///
/// `Display` renders server and operation messages verbatim so they can be
/// shown to users as-is.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Socket / file I/O error.
    #[error("I/O error: {source}")]
    Io {
        /// Lower-level error.
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {source}")]
    Json {
        /// Lower-level error.
        #[from]
        source: serde_json::Error,
    },

    /// Dial, read or write failure on the transport.
    #[error("connection error: {message}")]
    Connection {
        /// Human readable message.
        message: String,
    },

    /// The connection closed underneath a reader or waiter.
    #[error("connection closed")]
    Disconnected,

    /// No event connection is open to carry an outgoing event.
    #[error("no available event listener connection")]
    NoConnection,

    /// The daemon sent an unexpected or invalid message.
    #[error("protocol error: {message}")]
    Protocol {
        /// Human readable message.
        message: String,
    },

    /// The daemon returned an error response.
    #[error("{message}")]
    Server {
        /// HTTP-style status code reported by the daemon.
        status_code: u16,
        /// Error message reported by the daemon.
        message: String,
    },

    /// The operation finished with an error.
    #[error("{message}")]
    OperationFailed {
        /// The operation's `err` field.
        message: String,
    },

    /// A wait exceeded its deadline.
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// Timeout value.
        timeout: Duration,
    },

    /// A wait was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// A handler or resource was not found.
    #[error("{message}")]
    NotFound {
        /// Human readable message.
        message: String,
    },

    /// A cross-server operation has no target yet.
    #[error("no associated target operation")]
    NoTarget,

    /// The call is not supported by this object.
    #[error("{message}")]
    Unsupported {
        /// Human readable message.
        message: String,
    },

    /// Invalid caller input.
    #[error("{message}")]
    InvalidInput {
        /// Human readable message.
        message: String,
    },

    /// A migration relay could not be set up.
    #[error("{message}")]
    Migration {
        /// Human readable message.
        message: String,
    },

    /// A cross-server operation failed on every candidate address.
    #[error("{message}")]
    Remote {
        /// Aggregated message.
        message: String,
    },
}

impl Error {
    /// Returns a coarse error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::Connection { .. } | Self::Disconnected | Self::NoConnection => {
                ErrorKind::Connection
            }
            Self::Json { .. } | Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Server { .. } => ErrorKind::Server,
            Self::OperationFailed { .. } => ErrorKind::OperationFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotFound { .. } | Self::NoTarget => ErrorKind::NotFound,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::InvalidInput { .. } | Self::Migration { .. } => ErrorKind::InvalidInput,
            Self::Remote { .. } => ErrorKind::Remote,
        }
    }

    /// Whether this error is a transport failure.
    ///
    /// Cross-server operations move on to the next candidate address when
    /// this returns `true` and give up otherwise.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    /// Whether this error is likely retryable at the transport layer.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Timeout)
    }

    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn server(status_code: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status_code,
            message: message.into(),
        }
    }

    pub(crate) fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed {
            message: message.into(),
        }
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub(crate) fn migration(message: impl Into<String>) -> Self {
        Self::Migration {
            message: message.into(),
        }
    }

    /// Create an owned copy of this error suitable for fanning out across tasks.
    ///
    /// `Error` is not `Clone` because of the wrapped `std::io::Error` and
    /// `serde_json::Error`. A failed event connection has to report its error to
    /// every listener and every operation bound to them; this keeps the kind and
    /// the rendered message of the original.
    pub(crate) fn clone_for_task(&self) -> Self {
        match self {
            Self::Io { source } => Self::Connection {
                message: source.to_string(),
            },
            Self::Json { source } => Self::Protocol {
                message: source.to_string(),
            },
            Self::Connection { message } => Self::connection(message.clone()),
            Self::Disconnected => Self::Disconnected,
            Self::NoConnection => Self::NoConnection,
            Self::Protocol { message } => Self::protocol(message.clone()),
            Self::Server {
                status_code,
                message,
            } => Self::server(*status_code, message.clone()),
            Self::OperationFailed { message } => Self::operation_failed(message.clone()),
            Self::Timeout { timeout } => Self::Timeout { timeout: *timeout },
            Self::Cancelled => Self::Cancelled,
            Self::NotFound { message } => Self::not_found(message.clone()),
            Self::NoTarget => Self::NoTarget,
            Self::Unsupported { message } => Self::unsupported(message.clone()),
            Self::InvalidInput { message } => Self::invalid_input(message.clone()),
            Self::Migration { message } => Self::migration(message.clone()),
            Self::Remote { message } => Self::Remote {
                message: message.clone(),
            },
        }
    }
}
