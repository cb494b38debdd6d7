//! Device enumeration and per-thread binding.
//!
//! Binding is a thread-local affair: every thread that touches device memory
//! or task queues binds its device first, and repeated binds of the same
//! device are idempotent. Runtime bring-up happens transparently on first
//! contact; teardown is process exit.

use std::cell::Cell;
use std::sync::OnceLock;

use crate::error::{DeviceError, DeviceResult};

/// Small non-negative integer selecting one accelerator in the host.
pub type DeviceId = u32;

/// Core generation of a device. Influences allocator defaults and codec
/// parameter mappings only; contracts never branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreVersion {
    /// Second-generation discrete cores.
    G2,
    /// Third-generation discrete cores.
    G3,
    /// First-generation edge cores.
    E1,
}

impl CoreVersion {
    /// Default surface stride alignment for this core generation.
    pub fn default_alignment(self) -> usize {
        match self {
            CoreVersion::G2 => 64,
            CoreVersion::G3 => 128,
            CoreVersion::E1 => 256,
        }
    }

    /// Whether the codec honours a caller-supplied frame buffer count.
    pub fn codec_owns_frame_buffers(self) -> bool {
        !matches!(self, CoreVersion::E1)
    }
}

struct VirtualDevice {
    version: CoreVersion,
}

struct Runtime {
    devices: Vec<VirtualDevice>,
}

const VIRTUAL_DEVICE_NUM: usize = 4;

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        let devices = (0..VIRTUAL_DEVICE_NUM)
            .map(|_| VirtualDevice {
                version: CoreVersion::G3,
            })
            .collect::<Vec<_>>();
        log::info!(
            "[Device] [Runtime] initialized with {} virtual devices",
            devices.len()
        );
        Runtime { devices }
    })
}

thread_local! {
    static BOUND_DEVICE: Cell<Option<DeviceId>> = const { Cell::new(None) };
}

/// Returns the number of devices present in this host.
pub fn device_count() -> u32 {
    runtime().devices.len() as u32
}

/// Returns `true` when `id` names an existing device.
pub fn device_check(id: DeviceId) -> bool {
    (id as usize) < runtime().devices.len()
}

/// Static properties of one device.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    pub name: String,
    pub core_version: CoreVersion,
}

/// Queries the properties of device `id`.
pub fn device_properties(id: DeviceId) -> DeviceResult<DeviceProperties> {
    let rt = runtime();
    let device = rt
        .devices
        .get(id as usize)
        .ok_or(DeviceError::BadDeviceId {
            id,
            count: rt.devices.len() as u32,
        })?;
    Ok(DeviceProperties {
        name: format!("virtual-accelerator-{id}"),
        core_version: device.version,
    })
}

/// Returns the device the calling thread is bound to, if any.
pub fn bound_device() -> Option<DeviceId> {
    BOUND_DEVICE.with(|b| b.get())
}

/// Fails unless the calling thread is bound to `id`.
pub(crate) fn ensure_bound(id: DeviceId) -> DeviceResult<()> {
    if bound_device() == Some(id) {
        Ok(())
    } else {
        Err(DeviceError::NotBound { expected: id })
    }
}

/// Per-thread handle onto one device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceContext {
    device_id: DeviceId,
}

impl DeviceContext {
    /// Creates a context for `device_id`, validating it against the host.
    pub fn new(device_id: DeviceId) -> DeviceResult<Self> {
        let count = device_count();
        if device_id >= count {
            return Err(DeviceError::BadDeviceId {
                id: device_id,
                count,
            });
        }
        Ok(Self { device_id })
    }

    /// The device this context names.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Binds the calling thread to this device. Must precede any device
    /// memory or task-queue call on the thread; rebinding the same device is
    /// idempotent.
    pub fn bind(&self) -> DeviceResult<()> {
        // First contact drives runtime init.
        let count = device_count();
        if self.device_id >= count {
            return Err(DeviceError::BadDeviceId {
                id: self.device_id,
                count,
            });
        }
        BOUND_DEVICE.with(|b| {
            if b.get() != Some(self.device_id) {
                log::trace!(
                    "[Device] [Bind] thread {:?} -> device {}",
                    std::thread::current().id(),
                    self.device_id
                );
            }
            b.set(Some(self.device_id));
        });
        Ok(())
    }

    /// Core generation of the device.
    pub fn core_version(&self) -> CoreVersion {
        runtime().devices[self.device_id as usize].version
    }
}
