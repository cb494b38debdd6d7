//! Image buffers and memory pools over the device substrate.
//!
//! The pieces layered here, bottom up:
//! * [`Buffer`] – reference-counted byte block, host or device resident, with
//!   offset views and copies in both directions.
//! * [`MemPool`] – fixed-size-block pool over device memory used for model
//!   I/O staging; requests wait until a block is released.
//! * [`ColorFormat`] and the plane layout rules mapping an image description
//!   onto strides, plane sizes and one backing block.
//! * [`Surface`] – a batch of multi-plane images backed by one device block
//!   with an optional host mirror; cloning a handle is a `ref`, dropping it
//!   is the matching `unref`.
//! * [`SurfacePool`] – shape-fixed recycling factory of surfaces whose
//!   destruction waits for every outstanding handle.

mod buffer;
mod error;
mod format;
mod geometry;
mod pool;
mod surf;

pub use buffer::{Buffer, MemPool};
pub use error::{SurfaceError, SurfaceResult};
pub use format::{compute_layout, ColorFormat, PlaneLayout, SurfaceLayout};
pub use geometry::{BoundingBox, Detection, Rect};
pub use pool::SurfacePool;
pub use surf::{HostMap, MemKind, Surface, SurfaceDesc, SurfaceWeak};
