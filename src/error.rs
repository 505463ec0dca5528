//! Error types for batchq.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::Status;

#[derive(Debug, Error)]
pub enum Error {
    /// The allocation lock could not be taken within the retry budget.
    /// Fatal to the requesting operation.
    #[error("timed out acquiring lock {} after {attempts} attempts", path.display())]
    LockTimeout { path: PathBuf, attempts: u32 },

    /// The lease ran out or another process reclaimed the lock while we held it.
    #[error("lock {} is no longer held by this process", path.display())]
    LockLost { path: PathBuf },

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    /// Every identifier up to `u32::MAX` is already taken in the batch.
    #[error("identifier space exhausted in batch {0}")]
    IdentifiersExhausted(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
