//! On-screen-display stage: draws detection boxes into the frame.
//!
//! Drawing happens on the host mirror of packed RGB-family surfaces; the
//! edited pixels are synced back to the device before the frame travels
//! on. Frames without detections, without a mirror, or in planar YUV pass
//! through untouched.

use std::sync::Arc;

use device::DeviceContext;
use pipeline::{Flow, Frame, Module, PipelineResult, Transmitter};
use surface::{ColorFormat, Rect, Surface};

/// Border width of drawn boxes, in pixels.
const BORDER: u32 = 2;

/// Color palette cycled by detection label.
const PALETTE: [[u8; 3]; 6] = [
    [0x00, 0xff, 0x00],
    [0xff, 0x00, 0x00],
    [0x00, 0x00, 0xff],
    [0x00, 0xff, 0xff],
    [0xff, 0x00, 0xff],
    [0xff, 0xff, 0x00],
];

pub struct OsdStage {
    name: String,
    device_id: device::DeviceId,
    parallelism: usize,
}

impl OsdStage {
    pub fn new(name: impl Into<String>, device_id: device::DeviceId, parallelism: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            device_id,
            parallelism,
        })
    }
}

fn bytes_per_pixel(format: ColorFormat) -> Option<usize> {
    match format {
        ColorFormat::Bgr24 | ColorFormat::Rgb24 => Some(3),
        ColorFormat::Bgra | ColorFormat::Rgba | ColorFormat::Abgr | ColorFormat::Argb => Some(4),
        _ => None,
    }
}

fn draw_rect(bytes: &mut [u8], stride: usize, bpp: usize, rect: Rect, color: [u8; 3]) {
    let paint = |bytes: &mut [u8], x: u32, y: u32| {
        let at = y as usize * stride + x as usize * bpp;
        if at + 3 <= bytes.len() {
            bytes[at..at + 3].copy_from_slice(&color);
        }
    };
    let x1 = rect.x + rect.w.saturating_sub(1);
    let y1 = rect.y + rect.h.saturating_sub(1);
    for x in rect.x..=x1 {
        for dy in 0..BORDER.min(rect.h) {
            paint(bytes, x, rect.y + dy);
            paint(bytes, x, y1.saturating_sub(dy));
        }
    }
    for y in rect.y..=y1 {
        for dx in 0..BORDER.min(rect.w) {
            paint(bytes, rect.x + dx, y);
            paint(bytes, x1.saturating_sub(dx), y);
        }
    }
}

fn draw_detections(surf: &Surface, frame: &Frame) -> surface::SurfaceResult<()> {
    let desc = *surf.desc();
    let Some(bpp) = bytes_per_pixel(desc.format) else {
        return Ok(());
    };
    let stride = surf.layout().planes[0].stride;
    surf.sync_to_host()?;
    {
        let mut map = surf.map_host()?;
        for detection in &frame.detections {
            let rect = detection.bbox.to_rect(desc.width, desc.height);
            if rect.w == 0 || rect.h == 0 {
                continue;
            }
            let color = PALETTE[(detection.label.unsigned_abs() as usize) % PALETTE.len()];
            draw_rect(map.bytes_mut(), stride, bpp, rect, color);
        }
    }
    surf.sync_to_device()
}

impl Module for OsdStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn parallelism(&self) -> usize {
        self.parallelism
    }

    fn process(&self, frame: Option<Frame>, tx: &Transmitter) -> PipelineResult<Flow> {
        let frame = frame.ok_or_else(|| {
            pipeline::PipelineError::Module("osd stage is not a source".into())
        })?;
        if !frame.eos && !frame.detections.is_empty() {
            if let Some(surf) = &frame.surface {
                if let Err(err) = DeviceContext::new(self.device_id).and_then(|ctx| ctx.bind()) {
                    log::error!("[Stages] [Osd] device bind failed: {err}");
                } else if let Err(err) = draw_detections(surf, &frame) {
                    log::error!("[Stages] [Osd] drawing failed: {err}");
                }
            }
        }
        tx.transmit(frame)?;
        Ok(Flow::Continue)
    }

    fn close(&self) {}
}
