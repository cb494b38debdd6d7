//! Resize stage: scales frames to a fixed target resolution.
//!
//! Nearest-neighbour scaling on the host for NV12 and packed BGR surfaces,
//! writing into surfaces drawn from the stage's own pool. Used to bridge a
//! decode resolution to a different encode resolution in transcode graphs.

use std::sync::Arc;

use device::mem;
use parking_lot::Mutex;
use pipeline::{Flow, Frame, Module, PipelineError, PipelineResult, Transmitter};
use surface::{ColorFormat, MemKind, Surface, SurfaceDesc, SurfacePool};

pub struct ResizeStage {
    name: String,
    device_id: device::DeviceId,
    width: u32,
    height: u32,
    pool_capacity: usize,
    parallelism: usize,
    pool: Mutex<Option<SurfacePool>>,
}

impl ResizeStage {
    pub fn new(
        name: impl Into<String>,
        device_id: device::DeviceId,
        width: u32,
        height: u32,
        pool_capacity: usize,
        parallelism: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            device_id,
            width,
            height,
            pool_capacity,
            parallelism,
            pool: Mutex::new(None),
        })
    }
}

/// Reads one plane of image 0 into packed rows.
fn read_plane(surf: &Surface, plane_idx: usize, sample_bytes: usize) -> PipelineResult<Vec<u8>> {
    let plane = surf.layout().planes[plane_idx];
    let mut staged = vec![0u8; plane.stride * plane.height as usize];
    let ptr = surf
        .plane_dev_ptr(0, plane_idx)
        .map_err(|err| PipelineError::Module(format!("plane pointer: {err}")))?;
    mem::copy_d2h(&mut staged, ptr).map_err(|err| PipelineError::Module(format!("read: {err}")))?;
    let row_bytes = plane.width as usize * sample_bytes;
    let mut packed = vec![0u8; row_bytes * plane.height as usize];
    for row in 0..plane.height as usize {
        packed[row * row_bytes..(row + 1) * row_bytes]
            .copy_from_slice(&staged[row * plane.stride..row * plane.stride + row_bytes]);
    }
    Ok(packed)
}

/// Writes packed rows into one plane of image 0, applying the stride.
fn write_plane(
    surf: &Surface,
    plane_idx: usize,
    packed: &[u8],
    sample_bytes: usize,
) -> PipelineResult<()> {
    let plane = surf.layout().planes[plane_idx];
    let row_bytes = plane.width as usize * sample_bytes;
    let mut staged = vec![0u8; plane.stride * plane.height as usize];
    for row in 0..plane.height as usize {
        staged[row * plane.stride..row * plane.stride + row_bytes]
            .copy_from_slice(&packed[row * row_bytes..(row + 1) * row_bytes]);
    }
    let ptr = surf
        .plane_dev_ptr(0, plane_idx)
        .map_err(|err| PipelineError::Module(format!("plane pointer: {err}")))?;
    mem::copy_h2d(ptr, &staged).map_err(|err| PipelineError::Module(format!("write: {err}")))
}

/// Nearest-neighbour scale of a packed plane of `sample_bytes`-wide pixels.
fn scale_plane(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
    sample_bytes: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * sample_bytes];
    for row in 0..dst_h {
        let src_row = row * src_h / dst_h;
        for col in 0..dst_w {
            let src_col = col * src_w / dst_w;
            let from = (src_row * src_w + src_col) * sample_bytes;
            let to = (row * dst_w + col) * sample_bytes;
            dst[to..to + sample_bytes].copy_from_slice(&src[from..from + sample_bytes]);
        }
    }
    dst
}

fn resize_surface(src: &Surface, dst: &Surface) -> PipelineResult<()> {
    let src_desc = *src.desc();
    let dst_desc = *dst.desc();
    match src_desc.format {
        ColorFormat::Bgr24 => {
            let pixels = read_plane(src, 0, 3)?;
            let scaled = scale_plane(
                &pixels,
                src_desc.width as usize,
                src_desc.height as usize,
                dst_desc.width as usize,
                dst_desc.height as usize,
                3,
            );
            write_plane(dst, 0, &scaled, 3)
        }
        ColorFormat::Nv12 | ColorFormat::Nv21 => {
            let luma = read_plane(src, 0, 1)?;
            let scaled_luma = scale_plane(
                &luma,
                src_desc.width as usize,
                src_desc.height as usize,
                dst_desc.width as usize,
                dst_desc.height as usize,
                1,
            );
            write_plane(dst, 0, &scaled_luma, 1)?;
            // Chroma pairs scale at half vertical resolution.
            let chroma = read_plane(src, 1, 1)?;
            let scaled_chroma = scale_plane(
                &chroma,
                src_desc.width as usize / 2,
                ((src_desc.height + 1) / 2) as usize,
                dst_desc.width as usize / 2,
                ((dst_desc.height + 1) / 2) as usize,
                2,
            );
            write_plane(dst, 1, &scaled_chroma, 1)
        }
        other => Err(PipelineError::Module(format!(
            "resize does not support {other:?}"
        ))),
    }
}

impl Module for ResizeStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn parallelism(&self) -> usize {
        self.parallelism
    }

    fn open(&self) -> PipelineResult<()> {
        Ok(())
    }

    fn process(&self, frame: Option<Frame>, tx: &Transmitter) -> PipelineResult<Flow> {
        let mut frame = frame.ok_or_else(|| {
            PipelineError::Module("resize stage is not a source".into())
        })?;
        let Some(src) = frame.surface.take() else {
            tx.transmit(frame)?;
            return Ok(Flow::Continue);
        };

        device::DeviceContext::new(self.device_id)
            .and_then(|ctx| ctx.bind())
            .map_err(|err| PipelineError::Module(format!("bind: {err}")))?;

        // The pool shape follows the first frame's format.
        let mut pool = self.pool.lock();
        let pool = match pool.as_mut() {
            Some(pool) => pool,
            None => {
                let desc = SurfaceDesc {
                    batch: 1,
                    width: self.width,
                    height: self.height,
                    format: src.desc().format,
                    alignment: 0,
                    mem_kind: MemKind::PinnedHost,
                    device_id: self.device_id,
                };
                let created = SurfacePool::new(&desc, self.pool_capacity)
                    .map_err(|err| PipelineError::Module(format!("resize pool: {err}")))?;
                pool.insert(created)
            }
        };
        let dst = pool.request();
        resize_surface(&src, &dst)?;
        dst.set_filled(1);
        drop(src);
        frame.surface = Some(dst);
        tx.transmit(frame)?;
        Ok(Flow::Continue)
    }

    fn close(&self) {
        let _ = self.pool.lock().take();
    }
}
