//! Reference-counted byte buffers and the generic device memory pool.
//!
//! A [`Buffer`] is either host or device resident. Cloning shares the
//! backing block; [`Buffer::view`] narrows a clone to a byte window, which
//! is how model output tensors are split per batch item without copying.
//! A [`MemPool`] pre-allocates fixed-size device blocks; requests wait on a
//! condition until a block is released, and dropping the pool waits for all
//! outstanding blocks.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use device::{mem, DeviceId, DevPtr};
use parking_lot::{Condvar, Mutex};

use crate::error::{SurfaceError, SurfaceResult};

enum Backing {
    Host(Mutex<Box<[u8]>>),
    Device(DevPtr),
}

struct BufferInner {
    len: usize,
    backing: Backing,
    device_id: Option<DeviceId>,
    recycle: Option<Weak<MemPoolShared>>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Backing::Device(ptr) = self.backing {
            if let Some(pool) = self.recycle.as_ref().and_then(Weak::upgrade) {
                pool.give_back(ptr);
                return;
            }
            if let Err(err) = mem::free(ptr) {
                log::error!("[Surface] [Buffer] releasing device block failed: {err}");
            }
        }
    }
}

/// Reference-counted byte block, host or device resident.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
    offset: usize,
    len: usize,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl Buffer {
    /// Allocates a zeroed host-resident buffer.
    pub fn host(len: usize) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                len,
                backing: Backing::Host(Mutex::new(vec![0u8; len].into_boxed_slice())),
                device_id: None,
                recycle: None,
            }),
            offset: 0,
            len,
        }
    }

    /// Allocates a device-resident buffer on the bound device.
    pub fn device(len: usize) -> SurfaceResult<Self> {
        let ptr = mem::alloc(len)?;
        Ok(Self {
            inner: Arc::new(BufferInner {
                len,
                backing: Backing::Device(ptr),
                device_id: device::bound_device(),
                recycle: None,
            }),
            offset: 0,
            len,
        })
    }

    fn pooled(ptr: DevPtr, len: usize, device_id: DeviceId, pool: Weak<MemPoolShared>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                len,
                backing: Backing::Device(ptr),
                device_id: Some(device_id),
                recycle: Some(pool),
            }),
            offset: 0,
            len,
        }
    }

    /// Bytes visible through this handle.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` when the visible window is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `true` for device-resident buffers.
    pub fn is_device(&self) -> bool {
        matches!(self.inner.backing, Backing::Device(_))
    }

    /// Device owning the block, if device resident.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.inner.device_id
    }

    /// Device pointer at this view's start, if device resident.
    pub fn dev_ptr(&self) -> Option<DevPtr> {
        match self.inner.backing {
            Backing::Device(ptr) => Some(ptr.offset(self.offset)),
            Backing::Host(_) => None,
        }
    }

    /// Returns a handle narrowed to `[offset..]` of this view. The backing
    /// block is shared, not copied.
    pub fn view(&self, offset: usize) -> SurfaceResult<Buffer> {
        if offset > self.len {
            return Err(SurfaceError::OutOfRange {
                offset,
                len: 0,
                size: self.len,
            });
        }
        Ok(Buffer {
            inner: Arc::clone(&self.inner),
            offset: self.offset + offset,
            len: self.len - offset,
        })
    }

    /// Returns a handle narrowed to `[offset..offset + len]` of this view.
    pub fn narrow(&self, offset: usize, len: usize) -> SurfaceResult<Buffer> {
        let mut out = self.view(offset)?;
        if len > out.len {
            return Err(SurfaceError::OutOfRange {
                offset,
                len,
                size: self.len,
            });
        }
        out.len = len;
        Ok(out)
    }

    fn check(&self, len: usize) -> SurfaceResult<()> {
        if len > self.len {
            return Err(SurfaceError::OutOfRange {
                offset: self.offset,
                len,
                size: self.inner.len,
            });
        }
        Ok(())
    }

    /// Copies `src` into the start of this view.
    pub fn copy_from(&self, src: &[u8]) -> SurfaceResult<()> {
        self.check(src.len())?;
        match &self.inner.backing {
            Backing::Host(bytes) => {
                bytes.lock()[self.offset..self.offset + src.len()].copy_from_slice(src);
                Ok(())
            }
            Backing::Device(ptr) => Ok(mem::copy_h2d(ptr.offset(self.offset), src)?),
        }
    }

    /// Copies the start of this view into `dst`.
    pub fn copy_to(&self, dst: &mut [u8]) -> SurfaceResult<()> {
        self.check(dst.len())?;
        match &self.inner.backing {
            Backing::Host(bytes) => {
                dst.copy_from_slice(&bytes.lock()[self.offset..self.offset + dst.len()]);
                Ok(())
            }
            Backing::Device(ptr) => Ok(mem::copy_d2h(dst, ptr.offset(self.offset))?),
        }
    }
}

struct MemPoolShared {
    free: Mutex<Vec<DevPtr>>,
    released: Condvar,
    block_size: usize,
    capacity: usize,
    device_id: DeviceId,
}

impl MemPoolShared {
    fn give_back(&self, ptr: DevPtr) {
        self.free.lock().push(ptr);
        self.released.notify_all();
    }
}

/// Fixed-size-block pool over device memory.
pub struct MemPool {
    shared: Arc<MemPoolShared>,
}

impl MemPool {
    /// Pre-allocates `capacity` blocks of `block_size` bytes on the bound
    /// device.
    pub fn new(block_size: usize, capacity: usize) -> SurfaceResult<Self> {
        if capacity == 0 {
            return Err(SurfaceError::InvalidDesc("zero-capacity pool"));
        }
        let device_id = device::bound_device().ok_or(device::DeviceError::NotBound {
            expected: 0,
        })?;
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(mem::alloc(block_size)?);
        }
        Ok(Self {
            shared: Arc::new(MemPoolShared {
                free: Mutex::new(free),
                released: Condvar::new(),
                block_size,
                capacity,
                device_id,
            }),
        })
    }

    /// Blocks until a free block is available.
    pub fn request(&self) -> Buffer {
        let mut free = self.shared.free.lock();
        while free.is_empty() {
            self.shared.released.wait(&mut free);
        }
        let ptr = free.pop().expect("non-empty free list");
        drop(free);
        Buffer::pooled(
            ptr,
            self.shared.block_size,
            self.shared.device_id,
            Arc::downgrade(&self.shared),
        )
    }

    /// Like [`request`](Self::request) but gives up after `timeout`.
    pub fn request_timeout(&self, timeout: Duration) -> SurfaceResult<Buffer> {
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
        let ptr = free.pop().expect("non-empty free list");
        drop(free);
        Ok(Buffer::pooled(
            ptr,
            self.shared.block_size,
            self.shared.device_id,
            Arc::downgrade(&self.shared),
        ))
    }

    /// Size of each block in bytes.
    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    /// Number of blocks currently free.
    pub fn available(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Pool capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl Drop for MemPool {
    fn drop(&mut self) {
        let mut free = self.shared.free.lock();
        while free.len() < self.shared.capacity {
            self.shared.released.wait(&mut free);
        }
        for ptr in free.drain(..) {
            if let Err(err) = mem::free(ptr) {
                log::error!("[Surface] [MemPool] freeing pooled block failed: {err}");
            }
        }
    }
}
