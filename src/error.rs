//! Crate-level error type.

use thiserror::Error;

/// Errors surfaced across the harvesting engine.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("adapter error: {0}")]
    Adapter(String),
}

pub type HarvestResult<T> = Result<T, HarvestError>;
