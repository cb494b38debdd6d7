//! Error surface of the codec service.

use thiserror::Error;

/// Convenience result alias for fallible codec operations.
pub type CodecResult<T, E = CodecError> = Result<T, E>;

/// Errors surfaced by decoder and encoder instances.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Creation or submission parameters are out of contract.
    #[error("invalid codec parameter: {0}")]
    InvalidParam(&'static str),
    /// Submission did not complete within its deadline.
    #[error("codec submission timed out after {waited_ms} ms")]
    Timeout { waited_ms: u64 },
    /// The instance hit a terminal error earlier; it accepts no more work.
    #[error("codec instance is in a terminal error state")]
    Terminal,
    /// A packet or frame was submitted after the EOS marker.
    #[error("submission after end of stream")]
    AfterEos,
    /// The bitstream could not be parsed.
    #[error("corrupt bitstream: {0}")]
    CorruptStream(&'static str),
    /// Picture dimensions exceed what the instance was created for.
    #[error("picture {width}x{height} exceeds configured maximum {max_width}x{max_height}")]
    OversizedPicture {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },
    /// Destination surface acquisition or fill failed.
    #[error(transparent)]
    Surface(#[from] surface::SurfaceError),
    /// Underlying device fault.
    #[error(transparent)]
    Device(#[from] device::DeviceError),
}
