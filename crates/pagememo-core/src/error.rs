//! Error types for Pagememo

use thiserror::Error;

/// Main error type for Pagememo operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Link or control-channel failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Inbound message could not be interpreted
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Identity could not be loaded or persisted
    #[error("Identity error: {0}")]
    Identity(String),

    /// Entity was not found in storage
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// The coordinator task has stopped and no longer accepts commands
    #[error("Sync coordinator is not running")]
    CoordinatorStopped,

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Failures of the link layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The rendezvous address is malformed or unreachable
    #[error("Transport initialization failed: {0}")]
    Init(String),

    /// The remote never acknowledged the link request
    #[error("Link to {0} timed out")]
    LinkTimeout(String),

    /// The remote or the rendezvous rejected the link
    #[error("Link to {peer} refused: {reason}")]
    LinkRefused {
        /// Remote identity
        peer: String,
        /// Reason reported by the refusing side
        reason: String,
    },

    /// Operation attempted before `initialize` or after `disconnect`
    #[error("Transport is not initialized")]
    NotInitialized,

    /// Underlying socket failure
    #[error("Transport I/O error: {0}")]
    Io(String),

    /// The control connection closed while the operation was pending
    #[error("Transport closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Failures decoding a wire message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not valid JSON, or the payload does not match the kind
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// `protocolVersion` has no decoder
    #[error("Protocol version {0} is not supported")]
    UnsupportedVersion(u32),

    /// `kind` is not part of the message taxonomy
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
