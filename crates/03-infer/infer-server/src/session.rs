//! Sessions: lifecycle, request intake and ordered response delivery.
//!
//! A session owns its batcher thread, its engine workers and (optionally) a
//! perf reporter; those threads hold a non-owning [`SessionShared`] handle,
//! which breaks the ownership cycle between the session and its workers.
//! Dropping the session drains: intake stops, queued work cancels, in-flight
//! batches finish, and every thread is joined before the drop returns.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::unbounded;
use device::DeviceId;
use model::{Model, TensorLayout};
use parking_lot::{Condvar, Mutex};
use surface::ColorFormat;

use crate::batcher;
use crate::data::{InferData, Package, UserData};
use crate::error::{ServerError, ServerResult};
use crate::perf::PerfCounters;
use crate::priority::PriorityQueues;
use crate::processor::{self, DefaultPreprocessor, Postprocessor, Preprocessor};
use crate::request::RequestCtrl;
use crate::status::Status;
use crate::PerfSnapshot;

/// How a session gathers units into device batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    /// Merge units across tags, flush at the model batch or on timeout.
    Dynamic,
    /// Dispatch only exactly-full batches, one tag per batch.
    Static,
    /// One unit per dispatch, never reordered within a tag.
    Sequence,
}

/// Receiver of asynchronous responses.
pub trait Observer: Send + Sync + 'static {
    /// Called once per request, in per-tag submission order. Blocking
    /// session operations must not be called from inside the callback.
    fn response(&self, status: Status, package: Package, user_data: UserData);
}

/// Session creation options.
pub struct SessionDesc {
    /// Diagnostic label.
    pub name: String,
    pub model: Arc<Model>,
    pub strategy: BatchStrategy,
    /// Longest wait to fill a dynamic batch, measured from the first unit.
    pub batch_timeout: Duration,
    /// Engine slots working this session's batches.
    pub engine_num: usize,
    /// Default dispatch priority 0..=9 (9 highest) for its packages.
    pub priority: u8,
    /// Emit a periodic throughput log.
    pub show_perf: bool,
    /// Preprocessor override; falls back to the per-model registry, then to
    /// the default host-memcpy preprocessor.
    pub preproc: Option<Arc<dyn Preprocessor>>,
    /// Postprocessor override; `None` falls back to the registry, and with
    /// no registration the raw output tensor lands in each unit.
    pub postproc: Option<Arc<dyn Postprocessor>>,
    /// Advisory layout for postprocessor consumers.
    pub host_output_layout: Option<TensorLayout>,
    /// Input format hint handed to the preprocessor.
    pub model_input_format: ColorFormat,
}

impl SessionDesc {
    /// A descriptor with everything defaulted except name and model.
    pub fn new(name: impl Into<String>, model: Arc<Model>) -> Self {
        Self {
            name: name.into(),
            model,
            strategy: BatchStrategy::Dynamic,
            batch_timeout: Duration::from_millis(100),
            engine_num: 1,
            priority: 0,
            show_perf: false,
            preproc: None,
            postproc: None,
            host_output_layout: None,
            model_input_format: ColorFormat::Nv12,
        }
    }
}

pub(crate) struct PendingPackage {
    pub(crate) items: Vec<InferData>,
    pub(crate) ctrl: Arc<RequestCtrl>,
}

#[derive(Default)]
struct TagState {
    next_submit_seq: u64,
    next_deliver_seq: u64,
    /// Requests with seq below this deliver as canceled.
    discard_before: u64,
    ready: BTreeMap<u64, Arc<RequestCtrl>>,
    inflight: usize,
}

pub(crate) struct SessionShared {
    pub(crate) name: String,
    pub(crate) device_id: DeviceId,
    pub(crate) model: Arc<Model>,
    pub(crate) strategy: BatchStrategy,
    pub(crate) batch_timeout: Duration,
    default_priority: u8,
    observer: Option<Arc<dyn Observer>>,
    pub(crate) preproc: Arc<dyn Preprocessor>,
    pub(crate) postproc: Option<Arc<dyn Postprocessor>>,
    host_output_layout: Option<TensorLayout>,
    pub(crate) input: Mutex<PriorityQueues<PendingPackage>>,
    pub(crate) input_cv: Condvar,
    tags: Mutex<HashMap<String, TagState>>,
    tag_cv: Condvar,
    /// Serializes the collect-and-deliver path so per-tag order holds even
    /// when several engine workers complete requests concurrently.
    deliver_lock: Mutex<()>,
    stopping: AtomicBool,
    failed: AtomicBool,
    pub(crate) perf: PerfCounters,
}

impl SessionShared {
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn mark_failed(&self) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            log::error!(
                "[InferServer] [Session] `{}` entered error state, new requests fail fast",
                self.name
            );
        }
    }

    pub(crate) fn is_discarded(&self, ctrl: &RequestCtrl) -> bool {
        self.tags
            .lock()
            .get(&ctrl.tag)
            .map_or(false, |state| ctrl.seq < state.discard_before)
    }
}

/// Delivers every request whose turn has come. Called by whichever worker
/// completed a request's last unit; the delivery lock makes the path
/// single-file.
pub(crate) fn on_request_complete(shared: &Arc<SessionShared>, ctrl: Arc<RequestCtrl>) {
    let _delivery = shared.deliver_lock.lock();

    let tag = ctrl.tag.clone();
    let deliverables = {
        let mut tags = shared.tags.lock();
        let state = tags.get_mut(&tag).expect("completed tag is registered");
        state.ready.insert(ctrl.seq, ctrl);
        let mut out = Vec::new();
        while let Some(entry) = state.ready.first_entry() {
            if *entry.key() != state.next_deliver_seq {
                break;
            }
            let ctrl = entry.remove();
            let canceled = ctrl.seq < state.discard_before;
            state.next_deliver_seq += 1;
            out.push((ctrl, canceled));
        }
        out
    };
    if deliverables.is_empty() {
        return;
    }

    let delivered = deliverables.len();
    for (ctrl, canceled) in deliverables {
        let final_status = if canceled {
            Status::Canceled
        } else {
            ctrl.status()
        };
        let latency_ms = ctrl.created_at.elapsed().as_secs_f64() * 1e3;
        shared.perf.record(&ctrl.tag, ctrl.total as u32, latency_ms);
        let (status, package, user_data) = ctrl.take_response(final_status);
        match &shared.observer {
            Some(observer) => observer.response(status, package, user_data),
            None => ctrl.deliver_sync(status, package),
        }
    }

    // In-flight bookkeeping moves only after the callbacks ran, so
    // `wait_task_done` covers delivery, not just execution.
    let mut tags = shared.tags.lock();
    if let Some(state) = tags.get_mut(&tag) {
        state.inflight -= delivered;
    }
    drop(tags);
    shared.tag_cv.notify_all();
}

/// A running session. Dropping it drains and joins every worker.
pub struct Session {
    shared: Arc<SessionShared>,
    batcher: Option<JoinHandle<()>>,
    engines: Vec<JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
}

impl Session {
    pub(crate) fn create(
        device_id: DeviceId,
        desc: SessionDesc,
        observer: Option<Arc<dyn Observer>>,
    ) -> ServerResult<Self> {
        if desc.priority > 9 {
            return Err(ServerError::InvalidParam("priority above 9"));
        }
        if desc.engine_num == 0 {
            return Err(ServerError::InvalidParam("zero engines"));
        }

        let registered = processor::lookup(desc.model.key());
        let preproc = desc
            .preproc
            .or(registered.pre)
            .unwrap_or_else(|| Arc::new(DefaultPreprocessor));
        let postproc = desc.postproc.or(registered.post);
        preproc.on_tensor_params(&desc.model, desc.model_input_format);

        // A sequence session must not run units of one tag concurrently.
        let engine_num = if desc.strategy == BatchStrategy::Sequence {
            if desc.engine_num > 1 {
                log::warn!(
                    "[InferServer] [Session] `{}` uses sequence batching, clamping engines to 1",
                    desc.name
                );
            }
            1
        } else {
            desc.engine_num
        };

        let shared = Arc::new(SessionShared {
            name: desc.name,
            device_id,
            model: desc.model,
            strategy: desc.strategy,
            batch_timeout: desc.batch_timeout,
            default_priority: desc.priority,
            observer,
            preproc,
            postproc,
            host_output_layout: desc.host_output_layout,
            input: Mutex::new(PriorityQueues::default()),
            input_cv: Condvar::new(),
            tags: Mutex::new(HashMap::new()),
            tag_cv: Condvar::new(),
            deliver_lock: Mutex::new(()),
            stopping: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            perf: PerfCounters::new(),
        });

        let (batch_tx, batch_rx) = unbounded();
        let batcher = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("{}-batcher", shared.name))
                .spawn(move || batcher::run_batcher(shared, batch_tx))
                .expect("spawn batcher")
        };
        let engines = (0..engine_num)
            .map(|slot_idx| {
                let shared = Arc::clone(&shared);
                let rx = batch_rx.clone();
                std::thread::Builder::new()
                    .name(format!("{}-engine-{slot_idx}", shared.name))
                    .spawn(move || batcher::run_engine(shared, rx, slot_idx))
                    .expect("spawn engine worker")
            })
            .collect();
        let reporter = desc.show_perf.then(|| {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("{}-perf", shared.name))
                .spawn(move || run_reporter(shared))
                .expect("spawn perf reporter")
        });

        Ok(Self {
            shared,
            batcher: Some(batcher),
            engines,
            reporter,
        })
    }

    /// Diagnostic session name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The model this session serves.
    pub fn model(&self) -> &Arc<Model> {
        &self.shared.model
    }

    /// Advisory output layout requested at creation.
    pub fn host_output_layout(&self) -> Option<TensorLayout> {
        self.shared.host_output_layout
    }

    /// Current performance snapshot.
    pub fn perf(&self) -> Arc<PerfSnapshot> {
        self.shared.perf.publish()
    }

    fn enqueue(&self, package: Package, user_data: UserData) -> ServerResult<Arc<RequestCtrl>> {
        if self.shared.is_stopping() || self.shared.failed.load(Ordering::Acquire) {
            return Err(ServerError::SessionStopped);
        }
        let Package {
            data,
            tag,
            priority,
        } = package;
        let priority = priority.unwrap_or(self.shared.default_priority).min(9);

        let ctrl = {
            let mut tags = self.shared.tags.lock();
            let state = tags.entry(tag.clone()).or_default();
            let seq = state.next_submit_seq;
            state.next_submit_seq += 1;
            state.inflight += 1;
            RequestCtrl::new(tag, seq, data.len(), priority, user_data)
        };

        let mut input = self.shared.input.lock();
        input.enqueue(
            priority,
            PendingPackage {
                items: data,
                ctrl: Arc::clone(&ctrl),
            },
        );
        drop(input);
        self.shared.input_cv.notify_one();
        Ok(ctrl)
    }

    /// Asynchronous request; returns once the package is queued.
    pub fn request(&self, package: Package, user_data: UserData) -> ServerResult<()> {
        if self.shared.observer.is_none() {
            return Err(ServerError::WrongSessionKind(
                "async request on a sync session",
            ));
        }
        self.enqueue(package, user_data).map(|_| ())
    }

    /// Synchronous request; blocks until the response is ready or `timeout`
    /// elapses. A late response is discarded.
    pub fn request_sync(
        &self,
        package: Package,
        timeout: Option<Duration>,
    ) -> ServerResult<(Status, Option<Package>)> {
        if self.shared.observer.is_some() {
            return Err(ServerError::WrongSessionKind(
                "sync request on an async session",
            ));
        }
        let ctrl = self.enqueue(package, None)?;
        match ctrl.wait_sync(timeout) {
            Some((status, response)) => Ok((status, Some(response))),
            None => Ok((Status::Timeout, None)),
        }
    }

    /// Blocks until every in-flight item with `tag` has completed and its
    /// response was delivered.
    pub fn wait_task_done(&self, tag: &str) {
        let mut tags = self.shared.tags.lock();
        loop {
            match tags.get(tag) {
                Some(state) if state.inflight > 0 => self.shared.tag_cv.wait(&mut tags),
                _ => return,
            }
        }
    }

    /// Marks every undelivered request with `tag` to complete as
    /// [`Status::Canceled`]; queued work is skipped, dispatched work still
    /// executes but its results are dropped.
    pub fn discard_task(&self, tag: &str) {
        let mut tags = self.shared.tags.lock();
        if let Some(state) = tags.get_mut(tag) {
            state.discard_before = state.next_submit_seq;
        }
        drop(tags);
        // Wake the batcher so queued work is skipped promptly.
        self.shared.input_cv.notify_one();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        // Notify under the input lock: the batcher re-checks the stopping
        // flag with the lock held, so a bare notify could slip between its
        // check and its wait.
        {
            let _input = self.shared.input.lock();
            self.shared.input_cv.notify_all();
        }
        if let Some(batcher) = self.batcher.take() {
            let _ = batcher.join();
        }
        // The batcher dropped the batch sender; engines drain and exit.
        for engine in self.engines.drain(..) {
            let _ = engine.join();
        }
        if let Some(reporter) = self.reporter.take() {
            let _ = reporter.join();
        }
        log::info!("[InferServer] [Session] `{}` destroyed", self.shared.name);
    }
}


fn run_reporter(shared: Arc<SessionShared>) {
    let period = crate::perf::ROLLING_WINDOW;
    let mut slept = Duration::ZERO;
    loop {
        if shared.is_stopping() {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
        slept += Duration::from_millis(100);
        if slept < period {
            continue;
        }
        slept = Duration::ZERO;
        let snap = shared.perf.publish();
        log::info!(
            "[InferServer] [Perf] `{}` requests={} units={} rps={:.1} ups={:.1} latency avg/min/max {:.2}/{:.2}/{:.2} ms",
            shared.name,
            snap.aggregate.request_count,
            snap.aggregate.unit_count,
            snap.aggregate.rps,
            snap.aggregate.ups,
            snap.aggregate.latency_avg_ms(),
            snap.aggregate.latency_min_ms,
            snap.aggregate.latency_max_ms,
        );
    }
}
