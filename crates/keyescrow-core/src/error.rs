//! Error type shared by every keyescrow crate.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type EscrowResult<T> = Result<T, EscrowError>;

/// Failure categories surfaced to callers of the rotation workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Credential,
    DirectoryConnect,
    NotFound,
    DirectoryWrite,
    KeySlot,
    Config,
    Io,
}

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("machine credential error: {0}")]
    Credential(String),

    #[error("directory connection failed: {0}")]
    DirectoryConnect(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("directory write failed: {0}")]
    DirectoryWrite(String),

    #[error("key slot operation failed: {0}")]
    KeySlot(String),

    #[error("{tool} timed out after {after:?}")]
    Timeout {
        tool: String,
        after: Duration,
        kind: ErrorKind,
    },

    /// A key-slot step failed after the new key may already have been written to the volume.
    #[error("{0}; the new key may already be installed")]
    KeyPossiblyInstalled(Box<EscrowError>),

    #[error("invalid key material at {path}: {reason}")]
    InvalidKeyFile { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl EscrowError {
    /// Category of this error; timeouts report the category of the call that timed out.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EscrowError::Validation(_) | EscrowError::InvalidKeyFile { .. } => {
                ErrorKind::Validation
            }
            EscrowError::Credential(_) => ErrorKind::Credential,
            EscrowError::DirectoryConnect(_) => ErrorKind::DirectoryConnect,
            EscrowError::NotFound(_) => ErrorKind::NotFound,
            EscrowError::DirectoryWrite(_) => ErrorKind::DirectoryWrite,
            EscrowError::KeySlot(_) => ErrorKind::KeySlot,
            EscrowError::Timeout { kind, .. } => *kind,
            EscrowError::KeyPossiblyInstalled(inner) => inner.kind(),
            EscrowError::InvalidConfig(_) | EscrowError::Toml(_) => ErrorKind::Config,
            EscrowError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether retrying the same call may succeed (transport trouble rather than a rejection).
    pub fn is_transient(&self) -> bool {
        matches!(self, EscrowError::Timeout { .. } | EscrowError::Io(_))
    }

    /// Whether the volume may carry the new key even though installing it reported a failure.
    pub fn key_may_be_installed(&self) -> bool {
        matches!(self, EscrowError::KeyPossiblyInstalled(_))
    }

    /// Re-tag a tool-level error with the category of the workflow step that produced it.
    ///
    /// Already categorised errors are returned unchanged.
    pub fn into_kind(self, kind: ErrorKind) -> Self {
        match self {
            EscrowError::Io(err) => wrap_message(kind, err.to_string()),
            EscrowError::Timeout { tool, after, .. } => EscrowError::Timeout { tool, after, kind },
            other => other,
        }
    }
}

fn wrap_message(kind: ErrorKind, message: String) -> EscrowError {
    match kind {
        ErrorKind::Validation => EscrowError::Validation(message),
        ErrorKind::Credential => EscrowError::Credential(message),
        ErrorKind::DirectoryConnect => EscrowError::DirectoryConnect(message),
        ErrorKind::NotFound => EscrowError::NotFound(message),
        ErrorKind::DirectoryWrite => EscrowError::DirectoryWrite(message),
        ErrorKind::KeySlot => EscrowError::KeySlot(message),
        ErrorKind::Config => EscrowError::InvalidConfig(message),
        ErrorKind::Io => EscrowError::Io(std::io::Error::other(message)),
    }
}
