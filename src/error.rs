use thiserror::Error;

/// Taxonomy from the error-handling design: transport, space, metadata,
/// protocol, and commit-phase failures all map onto one of these variants.
#[derive(Debug, Error)]
pub enum GfsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("insufficient space: available {available} bytes")]
    InsufficientSpace { available: u64 },

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer returned an error: {0}")]
    Remote(String),

    #[error("connection closed by peer")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, GfsError>;
