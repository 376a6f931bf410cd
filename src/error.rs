//! Error types for forkpool.

use thiserror::Error;

/// Main error type for forkpool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[source] nix::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Worker {0} is not active")]
    NotActive(usize),

    #[error("Unknown worker kind '{0}'")]
    UnknownKind(String),

    #[error("No worker kind or prototype configured for the pool")]
    MissingTemplate,

    #[error("Pool configured with more than one worker template")]
    ConflictingTemplate,

    #[error("Pool has no workers (target size is 0)")]
    EmptyPool,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for forkpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
