//! Inference stage: wraps frames into request packages, submits them to an
//! asynchronous session, and forwards each frame downstream once its
//! response arrives, detections attached.
//!
//! The stage runs single-worker — concurrency comes from the session's
//! engine pool — so responses (already ordered per tag by the server) are
//! forwarded in order. An EOS frame waits for the stream's in-flight work
//! before travelling on.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use infer_server::{
    InferData, InferServer, InferValue, Observer, Package, Session, SessionDesc, Status, UserData,
};
use parking_lot::Mutex;
use pipeline::{Flow, Frame, Module, PipelineError, PipelineResult, Transmitter};

struct StageObserver {
    done_tx: Sender<Frame>,
}

impl Observer for StageObserver {
    fn response(&self, status: Status, package: Package, user_data: UserData) {
        let frame = user_data
            .and_then(|boxed| boxed.downcast::<Frame>().ok())
            .map(|boxed| *boxed);
        let Some(mut frame) = frame else {
            log::error!("[Stages] [Infer] response without its frame");
            return;
        };
        if status.is_success() {
            for item in package.data {
                if let InferValue::Detections(detections) = item.value {
                    frame.detections.extend(detections);
                }
            }
        } else {
            log::warn!(
                "[Stages] [Infer] stream {} frame {} completed with {status}",
                frame.stream_id,
                frame.frame_idx
            );
        }
        let _ = self.done_tx.send(frame);
    }
}

struct Running {
    session: Session,
    done_rx: Receiver<Frame>,
}

/// Pipeline stage feeding an inference session.
pub struct InferStage {
    name: String,
    device_id: device::DeviceId,
    desc: Mutex<Option<SessionDesc>>,
    running: Mutex<Option<Running>>,
    /// Final snapshot kept across `close` so callers can report totals.
    last_perf: Mutex<Option<std::sync::Arc<infer_server::PerfSnapshot>>>,
}

impl InferStage {
    /// The session is created from `desc` at `open`; the descriptor's
    /// observer-less form is required, the stage installs its own observer.
    pub fn new(name: impl Into<String>, device_id: device::DeviceId, desc: SessionDesc) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            device_id,
            desc: Mutex::new(Some(desc)),
            running: Mutex::new(None),
            last_perf: Mutex::new(None),
        })
    }

    /// Performance snapshot of the session; after `close` this is the
    /// session's final snapshot.
    pub fn perf(&self) -> Option<std::sync::Arc<infer_server::PerfSnapshot>> {
        match self.running.lock().as_ref() {
            Some(running) => Some(running.session.perf()),
            None => self.last_perf.lock().clone(),
        }
    }

    fn forward_ready(&self, running: &Running, tx: &Transmitter) -> PipelineResult<()> {
        while let Ok(frame) = running.done_rx.try_recv() {
            tx.transmit(frame)?;
        }
        Ok(())
    }
}

impl Module for InferStage {
    fn name(&self) -> &str {
        &self.name
    }

    // Concurrency comes from the session's engine pool; a single worker
    // keeps response forwarding ordered.
    fn parallelism(&self) -> usize {
        1
    }

    fn open(&self) -> PipelineResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let desc = self
            .desc
            .lock()
            .take()
            .ok_or_else(|| PipelineError::Module("infer stage reopened".into()))?;
        let (done_tx, done_rx) = unbounded();
        let server = InferServer::new(self.device_id)
            .map_err(|err| PipelineError::Module(format!("server: {err}")))?;
        let session = server
            .create_session(desc, Arc::new(StageObserver { done_tx }))
            .map_err(|err| PipelineError::Module(format!("session: {err}")))?;
        *running = Some(Running { session, done_rx });
        Ok(())
    }

    fn process(&self, frame: Option<Frame>, tx: &Transmitter) -> PipelineResult<Flow> {
        let guard = self.running.lock();
        let running = guard
            .as_ref()
            .ok_or_else(|| PipelineError::Module("infer stage not opened".into()))?;
        let frame = frame.ok_or_else(|| PipelineError::Module("infer stage is not a source".into()))?;

        if frame.eos {
            let tag = frame.stream_id.to_string();
            running.session.wait_task_done(&tag);
            self.forward_ready(running, tx)?;
            tx.transmit(frame)?;
            return Ok(Flow::Continue);
        }

        let Some(surf) = frame.surface.clone() else {
            // A data frame without a picture passes through untouched.
            tx.transmit(frame)?;
            return Ok(Flow::Continue);
        };
        let mut package = Package::new(frame.stream_id.to_string());
        package.push(InferData::image(surf));
        running
            .session
            .request(package, Some(Box::new(frame)))
            .map_err(|err| PipelineError::Module(format!("request: {err}")))?;

        self.forward_ready(running, tx)?;
        Ok(Flow::Continue)
    }

    fn close(&self) {
        // Dropping the session drains every in-flight request.
        if let Some(running) = self.running.lock().take() {
            *self.last_perf.lock() = Some(running.session.perf());
        }
    }
}
