//! Device substrate shared by every other crate in the workspace.
//!
//! This crate exposes the accelerator-facing primitives the runtime is built
//! on:
//! * [`DeviceContext`] – per-thread binding to one device, enumeration and
//!   core-version queries.
//! * [`DevPtr`] / the `mem` module – device memory with host↔device copies,
//!   bounds-checked against an allocation table.
//! * [`TaskQueue`] – an ordered stream of device-side operations with sync
//!   points and [`Mark`]-based elapsed-time measurement.
//!
//! The backing implementation is a software device runtime: each virtual
//! device owns host memory, and each task queue is executed in order by a
//! dedicated thread. The contracts are written against the abstract device,
//! so nothing above this crate observes the simulation.

mod context;
mod error;
pub mod mem;
mod queue;

pub use context::{
    bound_device, device_check, device_count, device_properties, CoreVersion, DeviceContext,
    DeviceId, DeviceProperties,
};
pub use error::{DeviceError, DeviceResult};
pub use mem::DevPtr;
pub use queue::{Mark, TaskQueue, MARKS_MAX_NUM};
