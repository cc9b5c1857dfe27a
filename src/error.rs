//! Error types for volgrid operations

use crate::types::CellIndex;
use std::fmt;
use thiserror::Error;

/// Why a cell transfer failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFailureKind {
    /// Credentials were rejected; retrying cannot help
    Authentication,
    /// The source has no payload for this cell
    NotFound,
    /// Timeout, dropped connection, short body, server-side error
    Transient,
}

impl fmt::Display for TransferFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferFailureKind::Authentication => write!(f, "authentication failed"),
            TransferFailureKind::NotFound => write!(f, "not found"),
            TransferFailureKind::Transient => write!(f, "transient failure"),
        }
    }
}

/// Main error type for volgrid operations
#[derive(Error, Debug)]
pub enum VolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error("Transfer of cell {cell} failed ({kind}): {message}")]
    Transfer {
        cell: CellIndex,
        kind: TransferFailureKind,
        message: String,
    },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Out of loaded window: {0}")]
    OutOfLoadedWindow(String),

    #[error("Store contention: {0}")]
    StoreContention(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported store version: {0}")]
    UnsupportedVersion(u32),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl VolError {
    /// Build a transfer error for a cell
    pub fn transfer(cell: CellIndex, kind: TransferFailureKind, message: impl Into<String>) -> Self {
        VolError::Transfer {
            cell,
            kind,
            message: message.into(),
        }
    }

    /// Whether re-invoking the same operation may succeed.
    ///
    /// Only transient transfer failures qualify. Everything else reflects bad
    /// input, corrupt data or an operator error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VolError::Transfer {
                kind: TransferFailureKind::Transient,
                ..
            }
        )
    }
}

/// Specialized Result type for volgrid operations
pub type Result<T> = std::result::Result<T, VolError>;

impl From<bincode::Error> for VolError {
    fn from(err: bincode::Error) -> Self {
        VolError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VolError {
    fn from(err: serde_json::Error) -> Self {
        VolError::Serialization(err.to_string())
    }
}

impl From<tiff::TiffError> for VolError {
    fn from(err: tiff::TiffError) -> Self {
        VolError::Decode(err.to_string())
    }
}
