//! Imaging store errors

use thiserror::Error;

/// Errors returned by session store and image catalog implementations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request (e.g., duplicate session id)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Backing store failure
    #[error("Store backend error: {0}")]
    Backend(String),
}
