//! Staged pipeline framework.
//!
//! A pipeline is a forest of chains: self-driving source modules feeding
//! worker modules over bounded per-worker queues. Frames carry a stream id;
//! the router pins every stream to one worker of the next node
//! (`stream_id % parallelism`), so per-stream order is preserved end to
//! end. Each node tracks which streams are still running; end-of-stream
//! frames flow through the links like any other frame and flip the
//! per-stream liveness that [`Pipeline::wait_for_stop`] watches.

mod frame;
mod graph;
mod module;

pub use frame::Frame;
pub use graph::Pipeline;
pub use module::{Flow, Module, Transmitter};

use thiserror::Error;

/// Convenience result alias for fallible pipeline operations.
pub type PipelineResult<T, E = PipelineError> = Result<T, E>;

/// Errors surfaced by pipeline construction and execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A module with this name is already registered.
    #[error("module `{0}` already exists")]
    DuplicateModule(String),
    /// A link names a module that was never registered.
    #[error("unknown module `{0}`")]
    UnknownModule(String),
    /// Links must end in worker modules; sources have no input queues.
    #[error("cannot link into source `{0}`")]
    LinkIntoSource(String),
    /// `start` without any registered source.
    #[error("pipeline has no source")]
    NoSource,
    /// The pipeline is already running.
    #[error("pipeline already started")]
    AlreadyStarted,
    /// A module's `open` failed; the whole start was aborted.
    #[error("opening module `{0}` failed")]
    OpenFailed(String),
    /// Transmission into a torn-down queue.
    #[error("downstream queue is closed")]
    QueueClosed,
    /// A module reported a processing failure.
    #[error("module failure: {0}")]
    Module(String),
}
