//! The per-session batcher thread and the engine pool workers.
//!
//! The batcher drains the priority input queue into batch builders and
//! dispatches full or timed-out batches onto the engine channel. Engine
//! workers pull batches, run preprocess → forward → postprocess, and push
//! every unit's result into its request control block; the last unit of a
//! request hands it to the ordered delivery path in [`crate::session`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use smallvec::SmallVec;
use surface::Rect;

use crate::data::{InferData, InferValue};
use crate::engine::Engine;
use crate::processor::write_raw_outputs;
use crate::request::RequestCtrl;
use crate::session::{on_request_complete, BatchStrategy, PendingPackage, SessionShared};
use crate::status::Status;

pub(crate) struct BatchSlot {
    pub(crate) ctrl: Arc<RequestCtrl>,
    pub(crate) item_idx: usize,
}

/// One dispatched unit group; at most `model.batch_dim()` units.
pub(crate) struct Batch {
    pub(crate) items: Vec<InferData>,
    pub(crate) slots: Vec<BatchSlot>,
}

struct Builder {
    items: Vec<InferData>,
    slots: Vec<BatchSlot>,
    first_at: Instant,
}

impl Builder {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            slots: Vec::new(),
            first_at: Instant::now(),
        }
    }

    fn take(&mut self, count: usize) -> Batch {
        let items = self.items.drain(..count).collect();
        let slots = self.slots.drain(..count).collect();
        // The remainder starts a fresh accumulation window.
        self.first_at = Instant::now();
        Batch { items, slots }
    }
}

/// Key under which a package's units accumulate. Dynamic batching merges
/// every tag of the session into one builder — within a session all tags
/// share the model and the processor pair — while static batching keeps at
/// most one tag per batch.
fn builder_key(strategy: BatchStrategy, tag: &str) -> String {
    match strategy {
        BatchStrategy::Dynamic => String::new(),
        _ => tag.to_string(),
    }
}

fn complete_whole(shared: &Arc<SessionShared>, ctrl: &Arc<RequestCtrl>, items: Vec<InferData>, status: Status) {
    let mut finished = items.is_empty();
    for (idx, item) in items.into_iter().enumerate() {
        finished = ctrl.complete_unit(idx, item, status);
    }
    if finished {
        on_request_complete(shared, Arc::clone(ctrl));
    }
}

fn dispatch(shared: &Arc<SessionShared>, batch_tx: &Sender<Batch>, batch: Batch) {
    if let Err(err) = batch_tx.send(batch) {
        let batch = err.into_inner();
        log::error!(
            "[InferServer] [Batcher] engine channel closed, failing batch of {}",
            batch.items.len()
        );
        for (slot, item) in batch.slots.into_iter().zip(batch.items) {
            if slot.ctrl.complete_unit(slot.item_idx, item, Status::ErrorBackend) {
                on_request_complete(shared, slot.ctrl);
            }
        }
    }
}

pub(crate) fn run_batcher(shared: Arc<SessionShared>, batch_tx: Sender<Batch>) {
    if let Err(err) = device::DeviceContext::new(shared.device_id).and_then(|ctx| {
        ctx.bind()?;
        Ok(ctx)
    }) {
        log::error!("[InferServer] [Batcher] device bind failed: {err}");
    }

    let batch_dim = shared.model.batch_dim();
    let mut builders: HashMap<String, Builder> = HashMap::new();

    loop {
        // Wait for input, the earliest builder deadline, or shutdown.
        let drained = {
            let mut input = shared.input.lock();
            if input.is_empty() && !shared.is_stopping() {
                let deadline = builders
                    .values()
                    .filter(|b| !b.items.is_empty())
                    .map(|b| b.first_at + shared.batch_timeout)
                    .min();
                match deadline {
                    Some(deadline) if shared.strategy == BatchStrategy::Dynamic => {
                        let _ = shared.input_cv.wait_until(&mut input, deadline);
                    }
                    _ => shared.input_cv.wait(&mut input),
                }
            }
            let mut drained = Vec::with_capacity(input.len());
            while let Some(pending) = input.pop_next() {
                drained.push(pending);
            }
            drained
        };

        let stopping = shared.is_stopping();
        for pending in drained {
            if stopping {
                cancel_pending(&shared, pending);
            } else {
                ingest(&shared, &batch_tx, &mut builders, batch_dim, pending);
            }
        }

        if stopping {
            // Accepted-but-undispatched units are flushed as canceled.
            for (_, mut builder) in builders.drain() {
                while !builder.items.is_empty() {
                    let batch = builder.take(builder.items.len());
                    for (slot, item) in batch.slots.into_iter().zip(batch.items) {
                        if slot.ctrl.complete_unit(slot.item_idx, item, Status::Canceled) {
                            on_request_complete(&shared, slot.ctrl);
                        }
                    }
                }
            }
            if shared.input.lock().is_empty() {
                return;
            }
            continue;
        }

        // Dynamic builders flush on their accumulation deadline.
        if shared.strategy == BatchStrategy::Dynamic {
            let now = Instant::now();
            for builder in builders.values_mut() {
                if !builder.items.is_empty() && now >= builder.first_at + shared.batch_timeout {
                    let count = builder.items.len().min(batch_dim);
                    dispatch(&shared, &batch_tx, builder.take(count));
                }
            }
        }
    }
}

fn cancel_pending(shared: &Arc<SessionShared>, pending: PendingPackage) {
    complete_whole(shared, &pending.ctrl, pending.items, Status::Canceled);
}

fn ingest(
    shared: &Arc<SessionShared>,
    batch_tx: &Sender<Batch>,
    builders: &mut HashMap<String, Builder>,
    batch_dim: usize,
    pending: PendingPackage,
) {
    let PendingPackage { items, ctrl } = pending;

    if shared.is_discarded(&ctrl) {
        // The batcher skips discarded work entirely.
        complete_whole(shared, &ctrl, items, Status::Canceled);
        return;
    }
    if items.is_empty() {
        on_request_complete(shared, ctrl);
        return;
    }

    if shared.strategy == BatchStrategy::Sequence {
        // One unit per dispatch, in submission order.
        for (idx, item) in items.into_iter().enumerate() {
            dispatch(
                shared,
                batch_tx,
                Batch {
                    items: vec![item],
                    slots: vec![BatchSlot {
                        ctrl: Arc::clone(&ctrl),
                        item_idx: idx,
                    }],
                },
            );
        }
        return;
    }

    let key = builder_key(shared.strategy, &ctrl.tag);
    let builder = builders.entry(key).or_insert_with(Builder::new);
    if builder.items.is_empty() {
        builder.first_at = Instant::now();
    }
    for (idx, item) in items.into_iter().enumerate() {
        builder.items.push(item);
        builder.slots.push(BatchSlot {
            ctrl: Arc::clone(&ctrl),
            item_idx: idx,
        });
    }
    while builder.items.len() >= batch_dim {
        dispatch(shared, batch_tx, builder.take(batch_dim));
    }
}

pub(crate) fn run_engine(shared: Arc<SessionShared>, rx: Receiver<Batch>, slot_idx: usize) {
    let bound = device::DeviceContext::new(shared.device_id).and_then(|ctx| {
        ctx.bind()?;
        Ok(())
    });
    let engine = bound
        .map_err(crate::error::ServerError::from)
        .and_then(|_| Engine::new(Arc::clone(&shared.model), shared.device_id));
    let engine = match engine {
        Ok(engine) => engine,
        Err(err) => {
            log::error!("[InferServer] [Engine] slot {slot_idx} failed to start: {err}");
            shared.mark_failed();
            // Fail every batch routed here so requests still complete.
            for batch in rx.iter() {
                for (slot, item) in batch.slots.into_iter().zip(batch.items) {
                    if slot.ctrl.complete_unit(slot.item_idx, item, Status::ErrorBackend) {
                        on_request_complete(&shared, slot.ctrl);
                    }
                }
            }
            return;
        }
    };

    for batch in rx.iter() {
        exec_batch(&shared, &engine, batch);
    }
}

fn exec_batch(shared: &Arc<SessionShared>, engine: &Engine, batch: Batch) {
    let Batch { mut items, slots } = batch;

    let rects: SmallVec<[Option<Rect>; 8]> = items
        .iter()
        .map(|item| match &item.value {
            InferValue::Image { roi, .. } => *roi,
            _ => None,
        })
        .collect();

    let status = shared
        .preproc
        .on_preproc(&items, &rects, engine.input(), &shared.model);
    let status = if status.is_success() {
        match engine.forward() {
            Ok((output, exec_ms)) => {
                log::trace!(
                    "[InferServer] [Engine] batch of {} ran in {exec_ms:.3} ms",
                    items.len()
                );
                match &shared.postproc {
                    Some(postproc) => postproc.on_postproc(&mut items, &output, &shared.model),
                    None => write_raw_outputs(&mut items, &output),
                }
            }
            Err(err) => {
                log::error!("[InferServer] [Engine] forward failed: {err}");
                shared.mark_failed();
                Status::ErrorBackend
            }
        }
    } else {
        // A processor failure aborts exactly this batch.
        log::error!("[InferServer] [Preproc] batch aborted with {status}");
        status
    };

    for (slot, item) in slots.into_iter().zip(items) {
        if slot.ctrl.complete_unit(slot.item_idx, item, status) {
            on_request_complete(shared, slot.ctrl);
        }
    }
}
