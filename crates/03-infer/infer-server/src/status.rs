//! Wire-stable response status taxonomy.

use std::fmt;

/// Status delivered with every response. The integer values of the first
/// eight variants are wire stable; `Canceled` is the response state of
/// discarded or shutdown-flushed requests.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success = 0,
    ErrorReadwrite = 1,
    ErrorMemory = 2,
    InvalidParam = 3,
    WrongType = 4,
    ErrorBackend = 5,
    NotImplemented = 6,
    Timeout = 7,
    Canceled = 8,
}

impl Status {
    /// `true` only for [`Status::Success`].
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Success => "SUCCESS",
            Status::ErrorReadwrite => "ERROR_READWRITE",
            Status::ErrorMemory => "ERROR_MEMORY",
            Status::InvalidParam => "INVALID_PARAM",
            Status::WrongType => "WRONG_TYPE",
            Status::ErrorBackend => "ERROR_BACKEND",
            Status::NotImplemented => "NOT_IMPLEMENTED",
            Status::Timeout => "TIMEOUT",
            Status::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}
