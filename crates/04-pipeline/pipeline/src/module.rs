//! The module contract and the transmitter handed to `process`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::frame::Frame;
use crate::{PipelineError, PipelineResult};

/// What a source's `process` reports back to its driver loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// More work may follow.
    Continue,
    /// The module produced its end of stream; the driver stops calling.
    Eos,
}

/// A pipeline stage. One instance serves all of its workers, so state
/// shared across workers needs interior mutability.
pub trait Module: Send + Sync + 'static {
    /// Unique name used for linking.
    fn name(&self) -> &str;

    /// Number of worker threads (and input queues) for this module.
    fn parallelism(&self) -> usize {
        1
    }

    /// Called once per start cycle before any worker runs; must be
    /// idempotent within the cycle.
    fn open(&self) -> PipelineResult<()> {
        Ok(())
    }

    /// Worker entry. Non-source modules receive `Some(frame)` and decide
    /// what to transmit; sources are driven with `None` until they return
    /// [`Flow::Eos`] or the pipeline stops. Frames must not be borrowed
    /// past the return — take a surface reference instead.
    fn process(&self, frame: Option<Frame>, tx: &Transmitter) -> PipelineResult<Flow>;

    /// Producer-side interruption point for sources, release hook for the
    /// rest.
    fn close(&self);
}

pub(crate) struct Wakener {
    lock: Mutex<()>,
    cv: Condvar,
}

impl Wakener {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        })
    }

    pub(crate) fn notify(&self) {
        let _guard = self.lock.lock();
        self.cv.notify_all();
    }

    pub(crate) fn wait_for(&self, timeout: std::time::Duration) {
        let mut guard = self.lock.lock();
        let _ = self.cv.wait_for(&mut guard, timeout);
    }
}

pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) module: Arc<dyn Module>,
    pub(crate) parallelism: usize,
    pub(crate) senders: Vec<Sender<Frame>>,
    pub(crate) receivers: Vec<Receiver<Frame>>,
    pub(crate) next: Mutex<Option<Arc<Node>>>,
    /// Per-stream liveness: set on first frame, cleared on EOS.
    pub(crate) stream_running: Mutex<HashMap<u32, bool>>,
    /// Source-only flag watched by `wait_for_stop`.
    pub(crate) source_running: AtomicBool,
    pub(crate) is_source: bool,
}

impl Node {
    pub(crate) fn any_stream_running(&self) -> bool {
        self.stream_running.lock().values().any(|&running| running)
    }

    pub(crate) fn note_frame(&self, stream_id: u32, eos: bool) {
        let mut streams = self.stream_running.lock();
        if eos {
            if let Some(running) = streams.get_mut(&stream_id) {
                *running = false;
            } else {
                // EOS can be the first (and only) frame of a stream.
                streams.insert(stream_id, false);
            }
        } else {
            streams.entry(stream_id).or_insert(true);
        }
    }
}

/// Routes frames from one node into the next node's queues. The router
/// pins `stream_id % parallelism`, so one stream always lands on the same
/// worker downstream.
pub struct Transmitter {
    pub(crate) next: Option<Arc<Node>>,
    /// Set for source workers; transmitting EOS retires the source.
    pub(crate) source: Option<Arc<Node>>,
    pub(crate) wakener: Arc<Wakener>,
}

impl Transmitter {
    /// Hands `frame` to the next node, blocking while its queue is full.
    /// With no successor the frame is dropped (the node is a sink).
    pub fn transmit(&self, frame: Frame) -> PipelineResult<()> {
        if frame.eos {
            if let Some(source) = &self.source {
                source.source_running.store(false, Ordering::Release);
                self.wakener.notify();
            }
        }
        if let Some(next) = &self.next {
            let idx = frame.stream_id as usize % next.parallelism;
            next.senders[idx]
                .send(frame)
                .map_err(|_| PipelineError::QueueClosed)?;
        }
        Ok(())
    }
}
