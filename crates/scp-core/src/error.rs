use thiserror::Error;

/// A convenience `Result` alias using [`ScpError`].
pub type ScpResult<T> = Result<T, ScpError>;

/// Unified error type for the case store, indexes and orchestrator.
///
/// A missing case is never reported through this type: lookups return
/// `Option`, deletes return `bool` and searches return empty lists.
#[derive(Error, Debug)]
pub enum ScpError {
    /// A record or draft failed validation. Batch imports skip and count these.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The configured similarity backend (usually the embedding encoder) cannot start.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A persisted index was produced by a different encoder than the live one.
    #[error("Index model mismatch: stored {stored}, current {current}")]
    IndexModelMismatch {
        /// Model identity recorded next to the persisted vectors.
        stored: String,
        /// Model identity of the encoder in use.
        current: String,
    },

    /// A persisted vector table is corrupt or inconsistent with its metadata.
    #[error("Index error: {0}")]
    Index(String),

    /// The encoder failed to produce a vector.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Invalid configuration value or unreadable config file.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
