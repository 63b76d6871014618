//! Error taxonomy for the indexing pipeline.
//!
//! Discovery failures are fatal to a run; per-registry fetch and
//! normalization failures are isolated and recorded on the run instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    /// The registry archive could not be retrieved or its listing format
    /// was not recognized. Fatal to the indexing run.
    #[error("registry discovery failed: {0}")]
    Discovery(String),

    /// A single registry's data file could not be fetched or parsed.
    /// Non-fatal: the registry is skipped.
    #[error("failed to fetch registry '{registry}': {message}")]
    Fetch { registry: String, message: String },

    /// A new run was triggered while another run is active. At most one
    /// run may be `running` at a time; the trigger is rejected, not queued.
    #[error("an indexing run is already in progress")]
    RunActive,

    /// The active run was stopped between registries.
    #[error("indexing run cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
