//! Shape-fixed recycling pool of surfaces.
//!
//! Requesting a surface consumes a pool slot for as long as any handle to it
//! is alive; the slot returns when the last handle drops. Dropping the pool
//! blocks until every outstanding surface has come back, then releases the
//! device memory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{SurfaceError, SurfaceResult};
use crate::surf::{Surface, SurfaceDesc, SurfaceStorage};

pub(crate) struct SurfacePoolShared {
    free: Mutex<Vec<SurfaceStorage>>,
    released: Condvar,
    capacity: usize,
}

impl SurfacePoolShared {
    pub(crate) fn give_back(&self, storage: SurfaceStorage) {
        storage.reset();
        self.free.lock().push(storage);
        self.released.notify_all();
    }
}

/// Pool of `capacity` same-shape surfaces.
pub struct SurfacePool {
    shared: Arc<SurfacePoolShared>,
    desc: SurfaceDesc,
}

impl SurfacePool {
    /// Pre-allocates `capacity` surfaces shaped by `desc`.
    pub fn new(desc: &SurfaceDesc, capacity: usize) -> SurfaceResult<Self> {
        if capacity == 0 {
            return Err(SurfaceError::InvalidDesc("zero-capacity pool"));
        }
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(SurfaceStorage::alloc(desc)?);
        }
        Ok(Self {
            shared: Arc::new(SurfacePoolShared {
                free: Mutex::new(free),
                released: Condvar::new(),
                capacity,
            }),
            desc: *desc,
        })
    }

    /// Blocks until a surface is available.
    pub fn request(&self) -> Surface {
        let mut free = self.shared.free.lock();
        while free.is_empty() {
            self.shared.released.wait(&mut free);
        }
        let storage = free.pop().expect("non-empty free list");
        drop(free);
        Surface::pooled(storage, Arc::downgrade(&self.shared))
    }

    /// Like [`request`](Self::request) but fails with
    /// [`SurfaceError::Unavailable`] when no surface returns within
    /// `timeout`.
    pub fn request_timeout(&self, timeout: Duration) -> SurfaceResult<Surface> {
        let deadline = Instant::now() + timeout;
        let mut free = self.shared.free.lock();
        while free.is_empty() {
            if self
                .shared
                .released
                .wait_until(&mut free, deadline)
                .timed_out()
            {
                return Err(SurfaceError::Unavailable {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }
        let storage = free.pop().expect("non-empty free list");
        drop(free);
        Ok(Surface::pooled(storage, Arc::downgrade(&self.shared)))
    }

    /// The shape every pooled surface shares.
    pub fn desc(&self) -> &SurfaceDesc {
        &self.desc
    }

    /// Number of surfaces currently free.
    pub fn available(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Pool capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl Drop for SurfacePool {
    fn drop(&mut self) {
        let mut free = self.shared.free.lock();
        while free.len() < self.shared.capacity {
            self.shared.released.wait(&mut free);
        }
        free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ColorFormat;
    use crate::surf::MemKind;
    use std::thread;

    fn small_desc() -> SurfaceDesc {
        SurfaceDesc {
            batch: 1,
            width: 64,
            height: 16,
            format: ColorFormat::Nv12,
            alignment: 64,
            mem_kind: MemKind::Device,
            device_id: 0,
        }
    }

    #[test]
    fn request_consumes_slot_until_last_handle_drops() {
        let pool = SurfacePool::new(&small_desc(), 2).expect("pool");
        let surf = pool.request();
        assert_eq!(pool.available(), 1);
        let extra_ref = surf.clone();
        drop(surf);
        assert_eq!(pool.available(), 1, "slot held by the remaining ref");
        drop(extra_ref);
        assert_eq!(pool.available(), 2, "last unref returns the slot");
    }

    #[test]
    fn exhausted_pool_reports_unavailable() {
        let pool = SurfacePool::new(&small_desc(), 1).expect("pool");
        let held = pool.request();
        let err = pool
            .request_timeout(Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, SurfaceError::Unavailable { .. }));
        drop(held);
        pool.request_timeout(Duration::from_millis(1000))
            .expect("succeeds after release");
    }

    #[test]
    fn destroy_waits_for_every_outstanding_ref() {
        let pool = SurfacePool::new(&small_desc(), 1).expect("pool");
        let surf = pool.request();
        let holder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(surf);
        });
        drop(pool);
        holder.join().expect("join");
    }

    #[test]
    fn recycled_surface_filled_count_is_reset() {
        let pool = SurfacePool::new(&small_desc(), 1).expect("pool");
        let surf = pool.request();
        surf.set_filled(1);
        drop(surf);
        let surf = pool.request();
        assert_eq!(surf.filled(), 0);
    }
}
