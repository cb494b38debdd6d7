//! Error surface of the inference server.

use thiserror::Error;

use crate::status::Status;

/// Convenience result alias for fallible server operations.
pub type ServerResult<T, E = ServerError> = Result<T, E>;

/// Errors surfaced by server and session operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Caller supplied a value outside the contract.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    /// Async-only operation on a sync session or the other way around.
    #[error("wrong session kind: {0}")]
    WrongSessionKind(&'static str),
    /// The session is shutting down or failed; it accepts no more requests.
    #[error("session no longer accepts requests")]
    SessionStopped,
    /// Underlying device fault.
    #[error(transparent)]
    Device(#[from] device::DeviceError),
    /// Surface or pool fault.
    #[error(transparent)]
    Surface(#[from] surface::SurfaceError),
    /// Model load or validation fault.
    #[error(transparent)]
    Model(#[from] model::ModelError),
}

impl ServerError {
    /// Maps the error onto the wire status taxonomy.
    pub fn status(&self) -> Status {
        match self {
            ServerError::InvalidParam(_) | ServerError::WrongSessionKind(_) => Status::InvalidParam,
            ServerError::SessionStopped => Status::ErrorBackend,
            ServerError::Device(device::DeviceError::MarksExhausted { .. }) => Status::ErrorMemory,
            ServerError::Device(_) => Status::ErrorBackend,
            ServerError::Surface(surface::SurfaceError::Unavailable { .. }) => Status::ErrorMemory,
            ServerError::Surface(_) => Status::ErrorMemory,
            ServerError::Model(model::ModelError::Read(_)) => Status::ErrorReadwrite,
            ServerError::Model(_) => Status::InvalidParam,
        }
    }
}
