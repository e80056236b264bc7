//! Error types for elohim-replica

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("No free file name for {name} in {folder} after {limit} attempts")]
    NameExhausted {
        folder: String,
        name: String,
        limit: usize,
    },

    #[error("Transfer to/from {peer} failed: {reason}")]
    Transfer { peer: String, reason: String },

    #[error("Malformed ledger line: {0}")]
    MalformedLedgerLine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Multipart error: {0}")]
    Multipart(#[from] multer::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Replication queue closed")]
    QueueClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Shorthand for a failed peer transfer
    pub fn transfer(peer: &str, reason: impl std::fmt::Display) -> Self {
        Self::Transfer {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that a later retry or reconciliation pass can heal
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transfer { .. } | Self::Http(_))
    }
}

impl From<rmp_serde::encode::Error> for StorageError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StorageError::Encoding(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StorageError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StorageError::Encoding(e.to_string())
    }
}

impl From<serde_urlencoded::de::Error> for StorageError {
    fn from(e: serde_urlencoded::de::Error) -> Self {
        StorageError::InvalidRequest(e.to_string())
    }
}
