//! Multi-plane batched image surfaces.
//!
//! A surface is one device memory block holding `batch` images laid out by
//! the rules in [`crate::format`]. Handles are reference counted: cloning is
//! the `ref`, dropping the matching `unref`. Pooled surfaces return to their
//! pool when the last handle drops; standalone surfaces free their block.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use device::{mem, DeviceContext, DeviceId, DevPtr};
use parking_lot::{Mutex, MutexGuard};

use crate::error::{SurfaceError, SurfaceResult};
use crate::format::{compute_layout, ColorFormat, SurfaceLayout};
use crate::pool::SurfacePoolShared;

/// Memory placement of a surface's backing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemKind {
    /// Device memory only.
    #[default]
    Device,
    /// Device memory plus a page-locked host mirror.
    PinnedHost,
    /// Unified address space; host mirror kept coherent via sync calls.
    Unified,
    /// Cacheable host-visible memory on edge parts.
    VbCached,
}

impl MemKind {
    /// Whether surfaces of this kind carry a host mirror.
    pub fn has_host_mirror(self) -> bool {
        !matches!(self, MemKind::Device)
    }
}

/// Creation parameters for surfaces and surface pools.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceDesc {
    pub batch: u32,
    pub width: u32,
    pub height: u32,
    pub format: ColorFormat,
    /// Stride alignment in bytes; `0` selects the device default for its
    /// core generation.
    pub alignment: usize,
    pub mem_kind: MemKind,
    pub device_id: DeviceId,
}

impl Default for SurfaceDesc {
    fn default() -> Self {
        Self {
            batch: 1,
            width: 0,
            height: 0,
            format: ColorFormat::Nv12,
            alignment: 0,
            mem_kind: MemKind::Device,
            device_id: 0,
        }
    }
}

pub(crate) struct SurfaceStorage {
    desc: SurfaceDesc,
    layout: SurfaceLayout,
    alignment: usize,
    total: usize,
    dev: DevPtr,
    host: Option<Mutex<Box<[u8]>>>,
    filled: AtomicU32,
}

impl SurfaceStorage {
    pub(crate) fn alloc(desc: &SurfaceDesc) -> SurfaceResult<Self> {
        if desc.batch == 0 {
            return Err(SurfaceError::InvalidDesc("zero batch"));
        }
        let ctx = DeviceContext::new(desc.device_id)?;
        ctx.bind()?;
        let alignment = if desc.alignment == 0 {
            ctx.core_version().default_alignment()
        } else {
            desc.alignment
        };
        let layout = compute_layout(desc.format, desc.width, desc.height, alignment)?;
        let total = layout.image_size * desc.batch as usize;
        let dev = mem::alloc(total)?;
        let host = desc
            .mem_kind
            .has_host_mirror()
            .then(|| Mutex::new(vec![0u8; total].into_boxed_slice()));
        Ok(Self {
            desc: *desc,
            layout,
            alignment,
            total,
            dev,
            host,
            filled: AtomicU32::new(0),
        })
    }

    pub(crate) fn reset(&self) {
        self.filled.store(0, Ordering::Relaxed);
    }
}

impl Drop for SurfaceStorage {
    fn drop(&mut self) {
        if let Err(err) = mem::free(self.dev) {
            log::error!("[Surface] [Surface] releasing backing block failed: {err}");
        }
    }
}

pub(crate) struct SurfaceCore {
    storage: Option<SurfaceStorage>,
    recycle: Option<Weak<SurfacePoolShared>>,
}

impl SurfaceCore {
    fn storage(&self) -> &SurfaceStorage {
        self.storage.as_ref().expect("surface storage present while alive")
    }
}

impl Drop for SurfaceCore {
    fn drop(&mut self) {
        let storage = self.storage.take().expect("surface storage present at drop");
        if let Some(pool) = self.recycle.as_ref().and_then(Weak::upgrade) {
            pool.give_back(storage);
        }
        // Standalone surfaces free their block when storage drops here.
    }
}

/// Reference-counted handle onto a batched multi-plane image.
#[derive(Clone)]
pub struct Surface {
    core: Arc<SurfaceCore>,
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl Surface {
    /// Allocates a standalone surface (not pool managed).
    pub fn alloc(desc: &SurfaceDesc) -> SurfaceResult<Self> {
        Ok(Self {
            core: Arc::new(SurfaceCore {
                storage: Some(SurfaceStorage::alloc(desc)?),
                recycle: None,
            }),
        })
    }

    pub(crate) fn pooled(storage: SurfaceStorage, pool: Weak<SurfacePoolShared>) -> Self {
        Self {
            core: Arc::new(SurfaceCore {
                storage: Some(storage),
                recycle: Some(pool),
            }),
        }
    }

    /// Creation parameters of this surface.
    pub fn desc(&self) -> &SurfaceDesc {
        &self.core.storage().desc
    }

    /// Per-image plane layout.
    pub fn layout(&self) -> &SurfaceLayout {
        &self.core.storage().layout
    }

    /// Effective stride alignment in bytes.
    pub fn alignment(&self) -> usize {
        self.core.storage().alignment
    }

    /// Total bytes of the backing block, all images.
    pub fn total_size(&self) -> usize {
        self.core.storage().total
    }

    /// Number of images currently considered filled.
    pub fn filled(&self) -> u32 {
        self.core.storage().filled.load(Ordering::Relaxed)
    }

    /// Updates the filled image count.
    pub fn set_filled(&self, n: u32) {
        self.core.storage().filled.store(n, Ordering::Relaxed);
    }

    /// Number of strong handles alive, this one included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.core)
    }

    /// Byte offset of image `batch_idx` from the block start.
    pub fn image_offset(&self, batch_idx: u32) -> SurfaceResult<usize> {
        let storage = self.core.storage();
        if batch_idx >= storage.desc.batch {
            return Err(SurfaceError::InvalidDesc("batch index out of range"));
        }
        Ok(storage.layout.image_size * batch_idx as usize)
    }

    /// Device pointer of `plane` in image `batch_idx`.
    pub fn plane_dev_ptr(&self, batch_idx: u32, plane: usize) -> SurfaceResult<DevPtr> {
        let storage = self.core.storage();
        let plane_layout = storage
            .layout
            .planes
            .get(plane)
            .ok_or(SurfaceError::InvalidDesc("plane index out of range"))?;
        Ok(storage
            .dev
            .offset(self.image_offset(batch_idx)? + plane_layout.offset))
    }

    /// Device pointer of the whole block.
    pub fn dev_ptr(&self) -> DevPtr {
        self.core.storage().dev
    }

    /// Copies the device block into the host mirror.
    pub fn sync_to_host(&self) -> SurfaceResult<()> {
        let storage = self.core.storage();
        let host = storage.host.as_ref().ok_or(SurfaceError::NoHostMirror)?;
        let mut bytes = host.lock();
        mem::copy_d2h(&mut bytes[..], storage.dev)?;
        Ok(())
    }

    /// Copies the host mirror into the device block.
    pub fn sync_to_device(&self) -> SurfaceResult<()> {
        let storage = self.core.storage();
        let host = storage.host.as_ref().ok_or(SurfaceError::NoHostMirror)?;
        let bytes = host.lock();
        mem::copy_h2d(storage.dev, &bytes[..])?;
        Ok(())
    }

    /// Maps the host mirror for direct access.
    pub fn map_host(&self) -> SurfaceResult<HostMap<'_>> {
        let storage = self.core.storage();
        let host = storage.host.as_ref().ok_or(SurfaceError::NoHostMirror)?;
        Ok(HostMap { guard: host.lock() })
    }

    /// Returns a non-owning observer of this surface's lifetime.
    pub fn downgrade(&self) -> SurfaceWeak {
        SurfaceWeak {
            core: Arc::downgrade(&self.core),
        }
    }
}

/// Non-owning observer used to tell whether any handle is still alive.
pub struct SurfaceWeak {
    core: std::sync::Weak<SurfaceCore>,
}

impl SurfaceWeak {
    /// `true` while at least one strong handle exists.
    pub fn alive(&self) -> bool {
        self.core.strong_count() > 0
    }
}

/// Guard over a surface's mapped host mirror.
pub struct HostMap<'a> {
    guard: MutexGuard<'a, Box<[u8]>>,
}

impl HostMap<'_> {
    /// The mirrored bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.guard
    }

    /// The mirrored bytes, writable. Call
    /// [`Surface::sync_to_device`] afterwards to publish the edit.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}
