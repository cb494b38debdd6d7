//! Pipeline graph construction and execution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::Mutex;

use crate::frame::Frame;
use crate::module::{Flow, Module, Node, Transmitter, Wakener};
use crate::{PipelineError, PipelineResult};

/// Depth of each worker's input queue; transmitters block when full.
const INPUT_QUEUE_DEPTH: usize = 16;
/// Poll window of the worker loops; doubles as the shutdown check.
const POLL_WINDOW: Duration = Duration::from_micros(200);
/// Re-check period of `wait_for_stop`.
const WAIT_RECHECK: Duration = Duration::from_secs(1);

/// A directed forest of module chains rooted at sources.
pub struct Pipeline {
    sources: Vec<Arc<Node>>,
    nodes: Vec<Arc<Node>>,
    /// Non-source nodes reachable from a source, recorded at start.
    spawned: Vec<Arc<Node>>,
    threads: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    wakener: Arc<Wakener>,
    started: bool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// An empty pipeline.
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            nodes: Vec::new(),
            spawned: Vec::new(),
            threads: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            wakener: Wakener::new(),
            started: false,
        }
    }

    fn make_node(module: Arc<dyn Module>, is_source: bool) -> Arc<Node> {
        let parallelism = module.parallelism().max(1);
        let mut senders = Vec::with_capacity(parallelism);
        let mut receivers = Vec::with_capacity(parallelism);
        if !is_source {
            for _ in 0..parallelism {
                let (tx, rx) = bounded::<Frame>(INPUT_QUEUE_DEPTH);
                senders.push(tx);
                receivers.push(rx);
            }
        }
        Arc::new(Node {
            name: module.name().to_string(),
            module,
            parallelism,
            senders,
            receivers,
            next: Mutex::new(None),
            stream_running: Mutex::new(std::collections::HashMap::new()),
            source_running: AtomicBool::new(true),
            is_source,
        })
    }

    fn find(&self, name: &str) -> Option<Arc<Node>> {
        self.sources
            .iter()
            .chain(self.nodes.iter())
            .find(|node| node.name == name)
            .cloned()
    }

    /// Registers a self-driving module; its `process` is invoked with
    /// `None` until it reports EOS or the pipeline stops.
    pub fn add_source(&mut self, module: Arc<dyn Module>) -> PipelineResult<()> {
        if self.find(module.name()).is_some() {
            return Err(PipelineError::DuplicateModule(module.name().to_string()));
        }
        self.sources.push(Self::make_node(module, true));
        Ok(())
    }

    /// Registers a worker module with `parallelism` input queues.
    pub fn add_module(&mut self, module: Arc<dyn Module>) -> PipelineResult<()> {
        if self.find(module.name()).is_some() {
            return Err(PipelineError::DuplicateModule(module.name().to_string()));
        }
        self.nodes.push(Self::make_node(module, false));
        Ok(())
    }

    /// Links `current` to `next`; each node keeps at most one successor.
    pub fn add_link(&mut self, current: &str, next: &str) -> PipelineResult<()> {
        let next_node = self
            .find(next)
            .ok_or_else(|| PipelineError::UnknownModule(next.to_string()))?;
        if next_node.is_source {
            return Err(PipelineError::LinkIntoSource(next.to_string()));
        }
        let current_node = self
            .find(current)
            .ok_or_else(|| PipelineError::UnknownModule(current.to_string()))?;
        *current_node.next.lock() = Some(next_node);
        Ok(())
    }

    /// Opens every reachable module and spawns the worker pools. A single
    /// failed `open` closes the already-opened modules and aborts.
    pub fn start(&mut self) -> PipelineResult<()> {
        if self.started {
            return Err(PipelineError::AlreadyStarted);
        }
        if self.sources.is_empty() {
            return Err(PipelineError::NoSource);
        }

        let mut opened: Vec<Arc<Node>> = Vec::new();
        let mut reachable: Vec<Arc<Node>> = Vec::new();
        for source in &self.sources {
            let chain = std::iter::successors(Some(Arc::clone(source)), |node| {
                node.next.lock().clone()
            });
            for node in chain {
                if opened.iter().any(|n| Arc::ptr_eq(n, &node)) {
                    // A shared tail is opened once.
                    break;
                }
                if node.module.open().is_err() {
                    log::error!("[Pipeline] [Start] open `{}` failed", node.name);
                    for prior in &opened {
                        prior.module.close();
                    }
                    return Err(PipelineError::OpenFailed(node.name.clone()));
                }
                if !node.is_source {
                    reachable.push(Arc::clone(&node));
                }
                opened.push(node);
            }
        }

        self.running.store(true, Ordering::Release);
        for node in &reachable {
            for worker_idx in 0..node.parallelism {
                self.threads.push(spawn_worker(
                    Arc::clone(node),
                    worker_idx,
                    Arc::clone(&self.running),
                    Arc::clone(&self.wakener),
                ));
            }
        }
        for source in &self.sources {
            self.threads.push(spawn_source(
                Arc::clone(source),
                Arc::clone(&self.running),
                Arc::clone(&self.wakener),
            ));
        }
        self.spawned = reachable;
        self.started = true;
        Ok(())
    }

    /// Closes every source; EOS then travels through the links naturally.
    pub fn stop(&self) {
        if self.running.load(Ordering::Acquire) {
            for source in &self.sources {
                source.module.close();
            }
        }
    }

    /// Blocks until every source retired and every sink saw EOS for every
    /// stream it ever carried, then joins the worker pools.
    pub fn wait_for_stop(&mut self) {
        if !self.started {
            return;
        }
        loop {
            let sources_done = self
                .sources
                .iter()
                .all(|s| !s.source_running.load(Ordering::Acquire));
            let sinks_done = self
                .spawned
                .iter()
                .filter(|node| node.next.lock().is_none())
                .all(|sink| !sink.any_stream_running());
            if sources_done && sinks_done {
                break;
            }
            self.wakener.wait_for(WAIT_RECHECK);
        }

        self.running.store(false, Ordering::Release);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        for node in &self.spawned {
            node.module.close();
        }
        self.started = false;
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.started {
            self.stop();
            self.wait_for_stop();
        }
    }
}

fn spawn_worker(
    node: Arc<Node>,
    worker_idx: usize,
    running: Arc<AtomicBool>,
    wakener: Arc<Wakener>,
) -> JoinHandle<()> {
    let rx = node.receivers[worker_idx].clone();
    let tx = Transmitter {
        next: node.next.lock().clone(),
        source: None,
        wakener: Arc::clone(&wakener),
    };
    std::thread::Builder::new()
        .name(format!("{}-{worker_idx}", node.name))
        .spawn(move || {
            while running.load(Ordering::Acquire) {
                match rx.recv_timeout(POLL_WINDOW) {
                    Ok(frame) => {
                        let stream_id = frame.stream_id;
                        let eos = frame.eos;
                        if let Err(err) = node.module.process(Some(frame), &tx) {
                            log::error!(
                                "[Pipeline] [Process] `{}` failed on stream {stream_id}: {err}",
                                node.name
                            );
                        }
                        node.note_frame(stream_id, eos);
                        if eos {
                            wakener.notify();
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .expect("spawn pipeline worker")
}

fn spawn_source(
    node: Arc<Node>,
    running: Arc<AtomicBool>,
    wakener: Arc<Wakener>,
) -> JoinHandle<()> {
    let tx = Transmitter {
        next: node.next.lock().clone(),
        source: Some(Arc::clone(&node)),
        wakener: Arc::clone(&wakener),
    };
    std::thread::Builder::new()
        .name(format!("{}-source", node.name))
        .spawn(move || {
            while running.load(Ordering::Acquire) && node.source_running.load(Ordering::Acquire) {
                match node.module.process(None, &tx) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Eos) => {
                        node.source_running.store(false, Ordering::Release);
                        wakener.notify();
                        break;
                    }
                    Err(err) => {
                        log::error!("[Pipeline] [Source] `{}` failed: {err}", node.name);
                        node.source_running.store(false, Ordering::Release);
                        wakener.notify();
                        break;
                    }
                }
            }
        })
        .expect("spawn pipeline source")
}
