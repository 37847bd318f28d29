//! Error types for the Lattice client.

use lattice_engine::ErrorCode;
use thiserror::Error;

/// All possible errors from the Lattice client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Engine(#[from] lattice_engine::Error),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("server rejected the request ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
