//! Chukcha Error Types

use thiserror::Error;

/// Result type alias for chukcha operations
pub type Result<T> = std::result::Result<T, Error>;

/// Chukcha error types
#[derive(Error, Debug)]
pub enum Error {
    // Request validation errors
    #[error("invalid category name: {0:?}")]
    InvalidCategory(String),

    #[error("invalid chunk name: {0:?}")]
    InvalidChunkName(String),

    // Chunk store errors
    #[error("chunk {0:?} does not exist")]
    ChunkNotFound(String),

    #[error("could not acknowledge the chunk that is currently being written into")]
    AckOfCurrentChunk,

    #[error("not all messages were processed: acknowledged {acked} bytes of {chunk_size}")]
    AckSizeMismatch { acked: u64, chunk_size: u64 },

    #[error("the buffer is too small to fit a single message, please increase it")]
    BufferTooSmall,

    // Consumer sentinel: no more data for this cursor right now
    #[error("no new messages")]
    EndOfStream,

    // Replication errors
    #[error("unknown peer {0:?}")]
    UnknownPeer(String),

    #[error("unexpected http status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Registry errors
    #[error("registry error: {0}")]
    Registry(String),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    // Transport errors
    #[error("http request error: {0}")]
    Http(#[from] reqwest::Error),

    // Client state errors
    #[error("state serialization error: {0}")]
    StateSerialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Check if this error means the caller supplied a bad request
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Error::InvalidCategory(_)
                | Error::InvalidChunkName(_)
                | Error::AckOfCurrentChunk
                | Error::AckSizeMismatch { .. }
        )
    }

    /// Check if this error means the requested chunk is gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ChunkNotFound(_))
    }
}
