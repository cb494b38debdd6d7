//! Ordered streams of device-side operations.
//!
//! A [`TaskQueue`] owns exactly one device stream: a dedicated executor
//! thread, bound to the queue's device, that runs submitted operations in
//! submission order. [`TaskQueue::sync`] is an in-stream fence; [`Mark`]s are
//! lightweight handles recorded by the stream and measured after a sync.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};

use crate::context::{DeviceContext, DeviceId};
use crate::error::{DeviceError, DeviceResult};

/// Upper bound on simultaneously live marks per queue.
pub const MARKS_MAX_NUM: usize = 40;

enum Op {
    Exec(Box<dyn FnOnce() + Send + 'static>),
    Fence(Arc<Fence>),
}

#[derive(Default)]
struct Fence {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Fence {
    fn signal(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }
}

#[derive(Default, Clone, Copy)]
struct MarkSlot {
    live: bool,
    generation: u64,
    recorded: Option<Instant>,
}

#[derive(Default)]
struct MarkTable {
    slots: Vec<MarkSlot>,
}

impl MarkTable {
    fn acquire(&mut self) -> DeviceResult<(usize, u64)> {
        if let Some(idx) = self.slots.iter().position(|s| !s.live) {
            let slot = &mut self.slots[idx];
            slot.live = true;
            slot.generation += 1;
            slot.recorded = None;
            return Ok((idx, slot.generation));
        }
        if self.slots.len() >= MARKS_MAX_NUM {
            return Err(DeviceError::MarksExhausted {
                limit: MARKS_MAX_NUM,
            });
        }
        self.slots.push(MarkSlot {
            live: true,
            generation: 0,
            recorded: None,
        });
        log::trace!(
            "[Device] [TaskQueue] mark table grown to {}",
            self.slots.len()
        );
        Ok((self.slots.len() - 1, 0))
    }

    fn record(&mut self, idx: usize, generation: u64) {
        let slot = &mut self.slots[idx];
        // A stream may reach a mark whose handle was already dropped and
        // whose slot was handed out again; the stale record is discarded.
        if slot.live && slot.generation == generation {
            slot.recorded = Some(Instant::now());
        }
    }

    fn release(&mut self, idx: usize) {
        self.slots[idx].live = false;
        self.slots[idx].recorded = None;
    }
}

/// Handle to a point in the queue's stream, used for elapsed-time
/// measurement. Dropping the handle returns its slot to the queue's pool.
pub struct Mark {
    idx: usize,
    table: Arc<Mutex<MarkTable>>,
}

impl std::fmt::Debug for Mark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mark").field("idx", &self.idx).finish()
    }
}

impl Drop for Mark {
    fn drop(&mut self) {
        self.table.lock().release(self.idx);
    }
}

/// An ordered stream of device operations with sync points and marks.
pub struct TaskQueue {
    device_id: DeviceId,
    tx: Option<Sender<Op>>,
    worker: Option<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
    marks: Arc<Mutex<MarkTable>>,
}

impl TaskQueue {
    /// Creates a queue whose stream executes on `device_id`.
    pub fn create(device_id: DeviceId) -> DeviceResult<Self> {
        let ctx = DeviceContext::new(device_id)?;
        let (tx, rx) = unbounded::<Op>();
        let pending = Arc::new(AtomicUsize::new(0));
        let pending_worker = Arc::clone(&pending);
        let worker = std::thread::Builder::new()
            .name(format!("task-queue-{device_id}"))
            .spawn(move || {
                ctx.bind().expect("queue worker binds its device");
                while let Ok(op) = rx.recv() {
                    match op {
                        Op::Exec(f) => {
                            f();
                            pending_worker.fetch_sub(1, Ordering::Release);
                        }
                        Op::Fence(fence) => fence.signal(),
                    }
                }
            })
            .expect("spawn task queue worker");
        Ok(Self {
            device_id,
            tx: Some(tx),
            worker: Some(worker),
            pending,
            marks: Arc::new(Mutex::new(MarkTable::default())),
        })
    }

    /// The device this queue's stream runs on.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Enqueues one operation onto the stream.
    pub fn submit<F>(&self, op: F) -> DeviceResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self.tx.as_ref().ok_or(DeviceError::QueueClosed)?;
        self.pending.fetch_add(1, Ordering::Acquire);
        tx.send(Op::Exec(Box::new(op))).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            DeviceError::QueueClosed
        })
    }

    /// Blocks until every operation submitted before this call has executed.
    pub fn sync(&self) -> DeviceResult<()> {
        let tx = self.tx.as_ref().ok_or(DeviceError::QueueClosed)?;
        let fence = Arc::new(Fence::default());
        tx.send(Op::Fence(Arc::clone(&fence)))
            .map_err(|_| DeviceError::QueueClosed)?;
        fence.wait();
        Ok(())
    }

    /// Places a mark into the stream. The mark is recorded when the stream
    /// reaches it; measure only after a [`sync`](Self::sync).
    pub fn place_mark(&self) -> DeviceResult<Mark> {
        let (idx, generation) = self.marks.lock().acquire()?;
        let table = Arc::clone(&self.marks);
        let record = Arc::clone(&self.marks);
        if let Err(err) = self.submit(move || record.lock().record(idx, generation)) {
            table.lock().release(idx);
            return Err(err);
        }
        Ok(Mark { idx, table })
    }

    /// Milliseconds elapsed between two recorded marks. Negative when `end`
    /// was recorded before `start`.
    pub fn elapsed(&self, start: &Mark, end: &Mark) -> DeviceResult<f32> {
        let table = self.marks.lock();
        let a = table.slots[start.idx]
            .recorded
            .ok_or(DeviceError::MarkNotRecorded)?;
        let b = table.slots[end.idx]
            .recorded
            .ok_or(DeviceError::MarkNotRecorded)?;
        let ms = if b >= a {
            b.duration_since(a).as_secs_f32() * 1e3
        } else {
            -(a.duration_since(b).as_secs_f32() * 1e3)
        };
        Ok(ms)
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        if self.pending.load(Ordering::Acquire) > 0 {
            log::error!(
                "[Device] [TaskQueue] destroying queue on device {} with unsynced work",
                self.device_id
            );
        }
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            // The stream drains whatever was queued before exiting.
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn operations_run_in_order() {
        let q = TaskQueue::create(0).expect("create queue");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let seen = Arc::clone(&seen);
            q.submit(move || seen.lock().push(i)).expect("submit");
        }
        q.sync().expect("sync");
        assert_eq!(*seen.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn marks_measure_stream_time() {
        let q = TaskQueue::create(0).expect("create queue");
        let start = q.place_mark().expect("start mark");
        q.submit(|| std::thread::sleep(Duration::from_millis(20)))
            .expect("submit");
        let end = q.place_mark().expect("end mark");
        q.sync().expect("sync");
        let ms = q.elapsed(&start, &end).expect("elapsed");
        assert!(ms >= 15.0, "expected >= 15ms, measured {ms}");
    }

    #[test]
    fn unsynced_mark_cannot_be_measured() {
        let q = TaskQueue::create(0).expect("create queue");
        let gate = Arc::new(Fence::default());
        let held = Arc::clone(&gate);
        q.submit(move || held.wait()).expect("submit blocker");
        let a = q.place_mark().expect("mark a");
        let b = q.place_mark().expect("mark b");
        let err = q.elapsed(&a, &b).unwrap_err();
        assert!(matches!(err, DeviceError::MarkNotRecorded));
        gate.signal();
        q.sync().expect("sync");
        assert!(q.elapsed(&a, &b).expect("elapsed") >= 0.0);
    }

    #[test]
    fn mark_pool_is_bounded_and_recycled() {
        let q = TaskQueue::create(0).expect("create queue");
        let mut live = Vec::new();
        for _ in 0..MARKS_MAX_NUM {
            live.push(q.place_mark().expect("mark within limit"));
        }
        let err = q.place_mark().unwrap_err();
        assert!(matches!(err, DeviceError::MarksExhausted { .. }));

        live.pop();
        q.place_mark().expect("slot recycled after drop");
    }

    #[test]
    fn drop_drains_queued_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let q = TaskQueue::create(0).expect("create queue");
            for _ in 0..32 {
                let counter = Arc::clone(&counter);
                q.submit(move || {
                    std::thread::sleep(Duration::from_millis(1));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .expect("submit");
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32, "drop waits for drain");
    }
}
