//! Error types for the vector store.

use std::io;
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch for {artifact}: expected {expected}, got {got}")]
    ChecksumMismatch {
        artifact: String,
        expected: String,
        got: String,
    },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Store is locked by another writer")]
    Locked,

    #[error("Lease is not held by this process: {0}")]
    LeaseNotHeld(String),

    #[error("Timed out waiting for write lock after {attempts} attempts")]
    LockTimeout { attempts: u32 },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Item already exists: {0}")]
    DuplicateId(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("An update session is already in progress")]
    UpdateInProgress,

    #[error("No update session is active")]
    NoActiveUpdate,

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No handler registered for operation type: {0}")]
    NoHandler(String),

    #[error("Operation queue is closed")]
    QueueClosed,

    #[error("Invalid path component: {0}")]
    InvalidPath(String),
}

impl StoreError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Validation, corruption and bookkeeping errors are never transient.
    /// I/O errors are transient unless their kind says the request itself is
    /// wrong (permissions, wrong file type, bad argument, missing parent).
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Io(e) => crate::retry::is_retriable_io(e),
            StoreError::Locked => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            return StoreError::Io(e.into());
        }
        match e.classify() {
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => StoreError::Deserialization(e.to_string()),
            serde_json::error::Category::Io => StoreError::Serialization(e.to_string()),
        }
    }
}

impl From<globset::Error> for StoreError {
    fn from(e: globset::Error) -> Self {
        StoreError::InvalidPath(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
