//! Lower-layer errors, converted into `chat_core::ChatError` at the
//! boundary — the same two-tier shape as the donor's
//! `ProviderError`/`RpcError` split.

use chat_core::ChatError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("sequence mode not wired up: {0}")]
    UnsupportedSequenceMode(&'static str),

    #[error("row not found")]
    NotFound,

    /// A stored row held a value this layer's decoder doesn't recognize
    /// (unknown `type`/`status` discriminant) — a schema/code skew, not a
    /// transient failure.
    #[error("failed to decode stored row: {0}")]
    Decode(String),

    /// A call into an external collaborator (membership, auth) failed.
    #[error("external collaborator call failed: {0}")]
    External(String),
}

impl From<ProviderError> for ChatError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound => ChatError::NotFound,
            other => ChatError::Unavailable(other.to_string()),
        }
    }
}
