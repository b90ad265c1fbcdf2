//! Error types for the request-processing core.
//!
//! Every error that can reach a client maps to exactly one `ResultCode`.

use std::path::PathBuf;

use ldapd_core::ResultCode;

/// Invalid configuration. The previous configuration stays in effect.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("worker thread count {value} is outside 1..={max}")]
    WorkerThreads { value: u64, max: u32 },
    #[error("bounded admission queue needs a capacity of at least 1")]
    ZeroCapacity,
    #[error("unknown SASL mechanism: {0:?}")]
    UnknownMechanism(String),
    #[error("failed to read configuration from {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// An operation refused at submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("work queue is full ({capacity} operations), retry later")]
    QueueFull { capacity: usize },
    #[error("server is not accepting operations")]
    Closed,
}

impl AdmissionError {
    #[must_use]
    pub fn result_code(self) -> ResultCode {
        match self {
            Self::QueueFull { .. } => ResultCode::Busy,
            Self::Closed => ResultCode::Unavailable,
        }
    }
}

/// Terminal failure of a bind negotiation.
///
/// `InvalidCredentials` carries an internal reason for logs only; its
/// client-facing message is the same whatever the reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid credentials")]
    InvalidCredentials { reason: &'static str },
    #[error("authentication method not supported: {0}")]
    UnsupportedMechanism(String),
    #[error("{0}")]
    Unwilling(String),
    #[error("internal error during bind")]
    Internal(String),
}

impl BindError {
    #[must_use]
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::Protocol(_) => ResultCode::ProtocolError,
            Self::InvalidCredentials { .. } => ResultCode::InvalidCredentials,
            Self::UnsupportedMechanism(_) => ResultCode::AuthMethodNotSupported,
            Self::Unwilling(_) => ResultCode::UnwillingToPerform,
            Self::Internal(_) => ResultCode::OperationsError,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub(crate) fn invalid(reason: &'static str) -> Self {
        Self::InvalidCredentials { reason }
    }

    /// Short label used in logs and metrics.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol_error",
            Self::InvalidCredentials { .. } => "invalid_credentials",
            Self::UnsupportedMechanism(_) => "unsupported",
            Self::Unwilling(_) => "unwilling",
            Self::Internal(_) => "internal",
        }
    }
}

/// Failure reported by a backend.
///
/// `Internal` never reaches the client verbatim; it becomes a generic
/// operations error and the source is logged.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no such object: {0}")]
    NoSuchObject(String),
    #[error("entry already exists: {0}")]
    AlreadyExists(String),
    #[error("entry has subordinates: {0}")]
    NotAllowedOnNonLeaf(String),
    #[error("no such attribute: {0}")]
    NoSuchAttribute(String),
    #[error("insufficient access rights: {0}")]
    InsufficientAccess(String),
    #[error("{0}")]
    Unwilling(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("operation canceled")]
    Canceled,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BackendError {
    #[must_use]
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::NoSuchObject(_) => ResultCode::NoSuchObject,
            Self::AlreadyExists(_) => ResultCode::EntryAlreadyExists,
            Self::NotAllowedOnNonLeaf(_) => ResultCode::NotAllowedOnNonLeaf,
            Self::NoSuchAttribute(_) => ResultCode::NoSuchAttribute,
            Self::InsufficientAccess(_) => ResultCode::InsufficientAccessRights,
            Self::Unwilling(_) => ResultCode::UnwillingToPerform,
            Self::Protocol(_) => ResultCode::ProtocolError,
            Self::Canceled => ResultCode::Canceled,
            Self::Internal(_) => ResultCode::OperationsError,
        }
    }

    /// Message safe to send to the client.
    #[must_use]
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Startup failure.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
