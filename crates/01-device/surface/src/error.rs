//! Error surface for buffers, surfaces and their pools.

use thiserror::Error;

/// Convenience result alias for fallible surface operations.
pub type SurfaceResult<T, E = SurfaceError> = Result<T, E>;

/// Errors surfaced by buffer, surface and pool operations.
#[derive(Debug, Error)]
pub enum SurfaceError {
    /// The creation parameters do not describe a representable image.
    #[error("invalid surface description: {0}")]
    InvalidDesc(&'static str),
    /// Host-side access on a surface created without a host mirror.
    #[error("surface has no host mirror, create it with a host-visible memory kind")]
    NoHostMirror,
    /// A copy would run past the end of the buffer.
    #[error("range {offset}+{len} exceeds buffer of {size} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        size: usize,
    },
    /// Pool exhausted and the wait timed out; the caller may retry.
    #[error("pool exhausted, no block released within {waited_ms} ms")]
    Unavailable { waited_ms: u64 },
    /// Underlying device fault.
    #[error(transparent)]
    Device(#[from] device::DeviceError),
}
