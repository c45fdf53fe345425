//! Relay error types with numeric error codes.
//!
//! [`RelayError`] is the central error type of the crate. Connection
//! attempts report through [`ConnectError`] so the pool can tell an
//! unreachable endpoint (retried under backoff) from a setup problem
//! (fatal, returned to the caller).

use std::io;
use std::path::PathBuf;

use crate::domain::ConnectionId;
use crate::transport::MessageError;

/// Library-level error enum.
///
/// # Error Code Ranges
///
/// | Range     | Category                 |
/// |-----------|--------------------------|
/// | 1000–1999 | Configuration / topology |
/// | 2000–2999 | State / lookup           |
/// | 3000–3999 | I/O and journal          |
/// | 4000–4999 | Wire format              |
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Connection string does not match the topology grammar.
    #[error("invalid connection string: {0}")]
    InvalidTopology(String),

    /// Client profile is missing or unusable.
    #[error("invalid client profile: {0}")]
    Profile(String),

    /// An endpoint rejected the client in a way retrying cannot fix.
    #[error("setup needed for {addr}: {reason}")]
    SetupNeeded {
        /// Endpoint address.
        addr: String,
        /// Reason reported by the connector.
        reason: String,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No connection with the given id in the pool.
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Asynchronous broadcast requested outside of a tokio runtime.
    #[error("no tokio runtime available for asynchronous broadcast")]
    NoRuntime,

    /// A failover journal directory is already locked by another owner.
    #[error("failover journal {} is locked by another process", .0.display())]
    JournalLocked(PathBuf),

    /// A failover journal file operation failed.
    #[error("failover journal {}: {source}", path.display())]
    Journal {
        /// Journal directory.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Malformed message.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// An event callback reported a failure for a connection.
    #[error("event callback failed: {0}")]
    Callback(String),
}

impl RelayError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidTopology(_) => 1001,
            Self::Profile(_) => 1002,
            Self::SetupNeeded { .. } => 1003,
            Self::Config(_) => 1004,
            Self::ConnectionNotFound(_) => 2001,
            Self::NoRuntime => 2002,
            Self::Callback(_) => 2003,
            Self::Journal { .. } => 3001,
            Self::JournalLocked(_) => 3002,
            Self::Message(_) => 4001,
        }
    }

    /// Returns `true` for errors that make the originating call fatal
    /// (configuration and profile problems).
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidTopology(_) | Self::Profile(_) | Self::SetupNeeded { .. } | Self::Config(_)
        )
    }

    pub(crate) fn journal(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Journal {
            path: path.into(),
            source,
        }
    }
}

/// Failure reported by a [`crate::transport::Connector`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The endpoint could not be reached; retried under backoff.
    #[error("unreachable: {0}")]
    Unreachable(#[from] io::Error),

    /// The client needs setup (profile, credentials) before it can connect.
    #[error("setup needed: {0}")]
    Setup(String),
}

impl ConnectError {
    /// Returns `true` when retrying cannot succeed without reconfiguration.
    #[must_use]
    pub const fn is_setup_needed(&self) -> bool {
        matches!(self, Self::Setup(_))
    }
}
