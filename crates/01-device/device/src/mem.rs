//! Device memory primitives.
//!
//! Every allocation lives in a process-wide table keyed by its base address.
//! A [`DevPtr`] is a base address plus a byte offset, so one allocation can
//! back several planes of an image. Copies and memsets are bounds-checked
//! against the owning allocation; a pointer into freed memory is an error,
//! not undefined behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::context::{bound_device, ensure_bound, DeviceId};
use crate::error::{DeviceError, DeviceResult};

/// Pointer into device memory: a live allocation plus a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevPtr {
    base: u64,
    offset: usize,
}

impl DevPtr {
    /// Returns a pointer advanced by `bytes` within the same allocation.
    pub fn offset(self, bytes: usize) -> DevPtr {
        DevPtr {
            base: self.base,
            offset: self.offset + bytes,
        }
    }

    /// Base address of the owning allocation.
    pub fn base_addr(self) -> u64 {
        self.base
    }

    /// Byte offset into the owning allocation.
    pub fn byte_offset(self) -> usize {
        self.offset
    }
}

struct DevBlock {
    device: DeviceId,
    bytes: Mutex<Box<[u8]>>,
}

fn table() -> &'static Mutex<HashMap<u64, Arc<DevBlock>>> {
    static TABLE: OnceLock<Mutex<HashMap<u64, Arc<DevBlock>>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn next_base() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0x1000);
    NEXT.fetch_add(0x10, Ordering::Relaxed)
}

fn block_of(ptr: DevPtr) -> DeviceResult<Arc<DevBlock>> {
    table()
        .lock()
        .get(&ptr.base)
        .cloned()
        .ok_or(DeviceError::UnknownAlloc { addr: ptr.base })
}

fn check_range(offset: usize, len: usize, size: usize) -> DeviceResult<()> {
    if offset.checked_add(len).map_or(true, |end| end > size) {
        return Err(DeviceError::OutOfRange { offset, len, size });
    }
    Ok(())
}

/// Allocates `size` bytes on the device the calling thread is bound to.
pub fn alloc(size: usize) -> DeviceResult<DevPtr> {
    let device = bound_device().ok_or(DeviceError::NotBound { expected: 0 })?;
    if size == 0 {
        return Err(DeviceError::ZeroSize);
    }
    let base = next_base();
    let block = Arc::new(DevBlock {
        device,
        bytes: Mutex::new(vec![0u8; size].into_boxed_slice()),
    });
    table().lock().insert(base, block);
    log::trace!("[Device] [Alloc] {size} bytes at {base:#x} on device {device}");
    Ok(DevPtr { base, offset: 0 })
}

/// Frees an allocation. `ptr` must be the base pointer returned by [`alloc`].
///
/// Free is thread-agnostic: surface handles may drop their backing memory
/// from whichever thread releases the last reference.
pub fn free(ptr: DevPtr) -> DeviceResult<()> {
    if ptr.offset != 0 {
        // Only base pointers name allocations.
        return Err(DeviceError::UnknownAlloc {
            addr: ptr.base + ptr.offset as u64,
        });
    }
    let block = table()
        .lock()
        .remove(&ptr.base)
        .ok_or(DeviceError::UnknownAlloc { addr: ptr.base })?;
    if Arc::strong_count(&block) > 1 {
        // A copy is still in flight somewhere; the backing store stays alive
        // until it finishes, but the address is no longer reachable.
        log::error!(
            "[Device] [Free] allocation {:#x} freed while still in use",
            ptr.base
        );
    }
    Ok(())
}

/// Number of live allocations, all devices. Leak checks compare this
/// against a baseline after a run has torn everything down.
pub fn live_allocations() -> usize {
    table().lock().len()
}

/// Copies `src` from the host into device memory at `ptr`.
pub fn copy_h2d(ptr: DevPtr, src: &[u8]) -> DeviceResult<()> {
    let block = block_of(ptr)?;
    ensure_bound(block.device)?;
    let mut bytes = block.bytes.lock();
    check_range(ptr.offset, src.len(), bytes.len())?;
    bytes[ptr.offset..ptr.offset + src.len()].copy_from_slice(src);
    Ok(())
}

/// Copies device memory at `ptr` into the host buffer `dst`.
pub fn copy_d2h(dst: &mut [u8], ptr: DevPtr) -> DeviceResult<()> {
    let block = block_of(ptr)?;
    ensure_bound(block.device)?;
    let bytes = block.bytes.lock();
    check_range(ptr.offset, dst.len(), bytes.len())?;
    dst.copy_from_slice(&bytes[ptr.offset..ptr.offset + dst.len()]);
    Ok(())
}

/// Copies `len` bytes between two device allocations.
pub fn copy_d2d(dst: DevPtr, src: DevPtr, len: usize) -> DeviceResult<()> {
    let dst_block = block_of(dst)?;
    ensure_bound(dst_block.device)?;
    if dst.base == src.base {
        let mut bytes = dst_block.bytes.lock();
        let size = bytes.len();
        check_range(dst.offset, len, size)?;
        check_range(src.offset, len, size)?;
        bytes.copy_within(src.offset..src.offset + len, dst.offset);
        return Ok(());
    }
    let src_block = block_of(src)?;
    // Lock order by base address so concurrent opposite-direction copies
    // cannot deadlock.
    let (first, second) = if src.base < dst.base {
        (&src_block, &dst_block)
    } else {
        (&dst_block, &src_block)
    };
    let first_bytes = first.bytes.lock();
    let second_bytes = second.bytes.lock();
    let (src_bytes, mut dst_bytes) = if src.base < dst.base {
        (first_bytes, second_bytes)
    } else {
        (second_bytes, first_bytes)
    };
    check_range(src.offset, len, src_bytes.len())?;
    check_range(dst.offset, len, dst_bytes.len())?;
    dst_bytes[dst.offset..dst.offset + len]
        .copy_from_slice(&src_bytes[src.offset..src.offset + len]);
    Ok(())
}

/// Fills `len` bytes of device memory at `ptr` with `value`.
pub fn memset(ptr: DevPtr, value: u8, len: usize) -> DeviceResult<()> {
    let block = block_of(ptr)?;
    ensure_bound(block.device)?;
    let mut bytes = block.bytes.lock();
    check_range(ptr.offset, len, bytes.len())?;
    bytes[ptr.offset..ptr.offset + len].fill(value);
    Ok(())
}
