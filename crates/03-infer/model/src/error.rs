//! Error surface of the model loader.

use thiserror::Error;

/// Convenience result alias for fallible model operations.
pub type ModelResult<T, E = ModelError> = Result<T, E>;

/// Errors surfaced when loading or validating a model package.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The package could not be read from its url.
    #[error("reading model package failed: {0}")]
    Read(#[from] std::io::Error),
    /// The manifest is not valid JSON.
    #[error("parsing model manifest failed: {0}")]
    Parse(#[from] serde_json::Error),
    /// The manifest parsed but does not describe a usable model.
    #[error("invalid model manifest: {0}")]
    Invalid(&'static str),
}
