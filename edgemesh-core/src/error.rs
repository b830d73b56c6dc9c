//! Error types for EdgeMesh
//!
//! Provides a unified error type for all EdgeMesh operations.

use thiserror::Error;

/// Result type alias for EdgeMesh operations
pub type Result<T> = std::result::Result<T, EdgeMeshError>;

/// Unified error type for EdgeMesh
#[derive(Error, Debug)]
pub enum EdgeMeshError {
    // ===== Master Connection Errors =====
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Connection closed: code {code} ({reason})")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Wire error: {0}")]
    Wire(String),

    #[error("Job descriptor required in ledger-gated mode")]
    MissingJobDescriptor,

    // ===== Content Errors =====
    #[error("Invalid range: offset {offset} + length {length} exceeds piece of {available} bytes")]
    InvalidRange {
        offset: u64,
        length: u64,
        available: u64,
    },

    #[error("Piece index out of bounds: {index} (max: {max})")]
    PieceOutOfBounds { index: u32, max: u32 },

    #[error("Store error: {0}")]
    Store(String),

    // ===== Transport Errors =====
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Bind failed on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    // ===== Ledger / Job Search Errors =====
    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Job search timed out after {0} seconds")]
    JobSearchTimeout(u64),

    #[error("Job search already active")]
    JobSearchActive,

    // ===== Port Mapping Errors =====
    #[error("Port mapping failed: {0}")]
    PortMapping(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EdgeMeshError {
    fn from(err: serde_json::Error) -> Self {
        EdgeMeshError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for EdgeMeshError {
    fn from(err: bincode::Error) -> Self {
        EdgeMeshError::Serialization(err.to_string())
    }
}
