//! Error surface of the device substrate.
//!
//! The variants map onto the cross-component error kinds: bad arguments are
//! surfaced and never retried, exhausted resources suggest a retry, and
//! backend faults poison the object they came from.

use thiserror::Error;

/// Convenience result alias for fallible device operations.
pub type DeviceResult<T, E = DeviceError> = Result<T, E>;

/// Errors surfaced by device context, memory and task-queue operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Device id is outside the enumerated range.
    #[error("invalid device id {id}, {count} devices present")]
    BadDeviceId { id: u32, count: u32 },
    /// The calling thread has not bound the device it is operating on.
    #[error("thread is not bound to device {expected}")]
    NotBound { expected: u32 },
    /// The device pointer does not name a live allocation.
    #[error("unknown device allocation {addr:#x}")]
    UnknownAlloc { addr: u64 },
    /// A copy or memset runs past the end of its allocation.
    #[error("range {offset}+{len} exceeds allocation of {size} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        size: usize,
    },
    /// Allocation size of zero bytes.
    #[error("zero-byte device allocation")]
    ZeroSize,
    /// All mark slots of a task queue are live.
    #[error("mark pool exhausted ({limit} live marks), drop marks before placing more")]
    MarksExhausted { limit: usize },
    /// A mark was measured before the queue executed it.
    #[error("mark has not been recorded yet, sync the queue first")]
    MarkNotRecorded,
    /// The queue's device stream has shut down and accepts no more work.
    #[error("task queue is shut down")]
    QueueClosed,
}
