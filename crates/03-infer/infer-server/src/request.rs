//! Per-request control blocks.
//!
//! A control block pairs the N work units of one package with its response:
//! units complete independently on engine workers, and the request is ready
//! for delivery when the last unit lands. Synchronous callers block on the
//! control block's condvar; the same mechanism backs `wait_task_done`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::data::{InferData, InferValue, Package, UserData};
use crate::status::Status;

struct CtrlState {
    done: usize,
    status: Status,
    outputs: Vec<Option<InferData>>,
    user_data: UserData,
    /// Response parked for a synchronous caller.
    sync_result: Option<(Status, Package)>,
    delivered: bool,
    /// The synchronous caller timed out; a late result is dropped.
    abandoned: bool,
}

pub(crate) struct RequestCtrl {
    pub(crate) tag: String,
    /// Position in the per-tag submission order.
    pub(crate) seq: u64,
    pub(crate) total: usize,
    pub(crate) priority: u8,
    pub(crate) created_at: Instant,
    state: Mutex<CtrlState>,
    done_cv: Condvar,
}

impl RequestCtrl {
    pub(crate) fn new(
        tag: String,
        seq: u64,
        total: usize,
        priority: u8,
        user_data: UserData,
    ) -> Arc<Self> {
        let mut outputs = Vec::with_capacity(total);
        outputs.resize_with(total, || None);
        Arc::new(Self {
            tag,
            seq,
            total,
            priority,
            created_at: Instant::now(),
            state: Mutex::new(CtrlState {
                done: 0,
                status: Status::Success,
                outputs,
                user_data,
                sync_result: None,
                delivered: false,
                abandoned: false,
            }),
            done_cv: Condvar::new(),
        })
    }

    /// Records the result of one unit. Returns `true` when this completes
    /// the whole request.
    pub(crate) fn complete_unit(&self, idx: usize, data: InferData, status: Status) -> bool {
        let mut state = self.state.lock();
        debug_assert!(state.outputs[idx].is_none(), "unit completed twice");
        state.outputs[idx] = Some(data);
        state.done += 1;
        if state.status.is_success() && !status.is_success() {
            state.status = status;
        }
        state.done == self.total
    }

    /// Accumulated status across completed units.
    pub(crate) fn status(&self) -> Status {
        self.state.lock().status
    }

    /// Consumes the results into a response package. Called once, at
    /// delivery.
    pub(crate) fn take_response(&self, final_status: Status) -> (Status, Package, UserData) {
        let mut state = self.state.lock();
        let data = state
            .outputs
            .drain(..)
            .map(|slot| slot.unwrap_or_else(|| InferData::new(InferValue::Empty)))
            .collect();
        let package = Package {
            data,
            tag: self.tag.clone(),
            priority: Some(self.priority),
        };
        (final_status, package, state.user_data.take())
    }

    /// Hands the response to a parked synchronous caller. A caller that
    /// already timed out gets nothing; the response is dropped here.
    pub(crate) fn deliver_sync(&self, status: Status, package: Package) {
        let mut state = self.state.lock();
        if !state.abandoned {
            state.sync_result = Some((status, package));
        }
        state.delivered = true;
        self.done_cv.notify_all();
    }

    /// Blocks the synchronous caller until delivery or `timeout`. `None`
    /// means the wait timed out and the response was detached.
    pub(crate) fn wait_sync(&self, timeout: Option<Duration>) -> Option<(Status, Package)> {
        let mut state = self.state.lock();
        match timeout {
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !state.delivered {
                    if self.done_cv.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while !state.delivered {
                    self.done_cv.wait(&mut state);
                }
            }
        }
        if state.delivered {
            state.sync_result.take()
        } else {
            state.abandoned = true;
            None
        }
    }
}
