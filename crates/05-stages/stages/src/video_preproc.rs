//! Format-aware video preprocessor.
//!
//! Turns image work units into model input tensors on the host: reads the
//! source surface (NV12 or packed BGR), applies the optional per-item crop,
//! scales to the model's input resolution with nearest-neighbour sampling —
//! optionally letterboxed to keep the aspect ratio — and writes the result
//! in the model's dimension order. Covers models shaped `[N,3,H,W]` (NCHW)
//! or `[N,H,W,3]` (NHWC) with u8 elements.

use device::mem;
use infer_server::{InferData, InferValue, ModelIo, Preprocessor, Status};
use model::{DataType, DimOrder, Model};
use parking_lot::Mutex;
use surface::{ColorFormat, Rect, Surface};

#[derive(Clone, Copy)]
struct InputGeometry {
    width: usize,
    height: usize,
    planar: bool,
}

fn input_geometry(model: &Model) -> Option<InputGeometry> {
    let layout = model.input_layout(0);
    if layout.dtype != DataType::U8 {
        return None;
    }
    let dims = model.input_shape(0).dims();
    if dims.len() != 4 {
        return None;
    }
    match layout.order {
        DimOrder::Nchw if dims[1] == 3 => Some(InputGeometry {
            width: dims[3],
            height: dims[2],
            planar: true,
        }),
        DimOrder::Nhwc if dims[3] == 3 => Some(InputGeometry {
            width: dims[2],
            height: dims[1],
            planar: false,
        }),
        _ => None,
    }
}

/// Preprocessor converting video frames to u8 BGR model input.
pub struct VideoPreprocessor {
    keep_aspect_ratio: bool,
    pad_value: u8,
    geometry: Mutex<Option<InputGeometry>>,
}

impl VideoPreprocessor {
    /// Plain stretch-to-fit scaling.
    pub fn new() -> Self {
        Self {
            keep_aspect_ratio: false,
            pad_value: 0,
            geometry: Mutex::new(None),
        }
    }

    /// Letterboxed scaling: the image keeps its aspect ratio, centred on a
    /// canvas filled with `pad_value`.
    pub fn letterbox(pad_value: u8) -> Self {
        Self {
            keep_aspect_ratio: true,
            pad_value,
            geometry: Mutex::new(None),
        }
    }
}

impl Default for VideoPreprocessor {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Reads one plane of image 0 into a tightly packed host vector.
fn read_plane(surf: &Surface, plane_idx: usize, sample_bytes: usize) -> Option<Vec<u8>> {
    let plane = surf.layout().planes[plane_idx];
    let mut staged = vec![0u8; plane.stride * plane.height as usize];
    mem::copy_d2h(&mut staged, surf.plane_dev_ptr(0, plane_idx).ok()?).ok()?;
    let row_bytes = plane.width as usize * sample_bytes;
    let mut packed = vec![0u8; row_bytes * plane.height as usize];
    for row in 0..plane.height as usize {
        packed[row * row_bytes..(row + 1) * row_bytes]
            .copy_from_slice(&staged[row * plane.stride..row * plane.stride + row_bytes]);
    }
    Some(packed)
}

/// Decodes image 0 of `surf` into packed BGR24 host pixels.
fn surface_to_bgr(surf: &Surface) -> Option<(Vec<u8>, usize, usize)> {
    let desc = *surf.desc();
    let width = desc.width as usize;
    let height = desc.height as usize;
    match desc.format {
        ColorFormat::Bgr24 => {
            let pixels = read_plane(surf, 0, 3)?;
            Some((pixels, width, height))
        }
        ColorFormat::Nv12 | ColorFormat::Nv21 => {
            let y_plane = read_plane(surf, 0, 1)?;
            let uv_plane = read_plane(surf, 1, 1)?;
            let swap_uv = desc.format == ColorFormat::Nv21;
            let mut bgr = vec![0u8; width * height * 3];
            for row in 0..height {
                for col in 0..width {
                    let y = y_plane[row * width + col] as i32;
                    let uv_at = (row / 2) * width + (col / 2) * 2;
                    let (u, v) = if swap_uv {
                        (uv_plane[uv_at + 1] as i32, uv_plane[uv_at] as i32)
                    } else {
                        (uv_plane[uv_at] as i32, uv_plane[uv_at + 1] as i32)
                    };
                    let c = y - 16;
                    let d = u - 128;
                    let e = v - 128;
                    let at = (row * width + col) * 3;
                    bgr[at] = clamp_u8((298 * c + 516 * d + 128) >> 8);
                    bgr[at + 1] = clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8);
                    bgr[at + 2] = clamp_u8((298 * c + 409 * e + 128) >> 8);
                }
            }
            Some((bgr, width, height))
        }
        _ => None,
    }
}

fn crop_bgr(pixels: &[u8], width: usize, height: usize, rect: Rect) -> (Vec<u8>, usize, usize) {
    let x = (rect.x as usize).min(width.saturating_sub(1));
    let y = (rect.y as usize).min(height.saturating_sub(1));
    let w = (rect.w as usize).clamp(1, width - x);
    let h = (rect.h as usize).clamp(1, height - y);
    let mut out = vec![0u8; w * h * 3];
    for row in 0..h {
        let src = ((y + row) * width + x) * 3;
        out[row * w * 3..(row + 1) * w * 3].copy_from_slice(&pixels[src..src + w * 3]);
    }
    (out, w, h)
}

fn scale_into(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst: &mut [u8],
    geometry: InputGeometry,
    keep_aspect_ratio: bool,
    pad_value: u8,
) {
    let InputGeometry { width, height, .. } = geometry;
    dst.fill(pad_value);
    let (scaled_w, scaled_h, off_x, off_y) = if keep_aspect_ratio {
        let ratio = (width as f32 / src_w as f32).min(height as f32 / src_h as f32);
        let scaled_w = ((src_w as f32 * ratio) as usize).max(1);
        let scaled_h = ((src_h as f32 * ratio) as usize).max(1);
        (
            scaled_w,
            scaled_h,
            (width - scaled_w) / 2,
            (height - scaled_h) / 2,
        )
    } else {
        (width, height, 0, 0)
    };
    for row in 0..scaled_h {
        let src_row = row * src_h / scaled_h;
        for col in 0..scaled_w {
            let src_col = col * src_w / scaled_w;
            let from = (src_row * src_w + src_col) * 3;
            let to = ((row + off_y) * width + (col + off_x)) * 3;
            dst[to..to + 3].copy_from_slice(&src[from..from + 3]);
        }
    }
}

fn interleaved_to_planar(interleaved: &[u8], width: usize, height: usize) -> Vec<u8> {
    let pixels = width * height;
    let mut planar = vec![0u8; pixels * 3];
    for at in 0..pixels {
        for ch in 0..3 {
            planar[ch * pixels + at] = interleaved[at * 3 + ch];
        }
    }
    planar
}

impl Preprocessor for VideoPreprocessor {
    fn on_tensor_params(&self, model: &Model, _input_format: ColorFormat) {
        let geometry = input_geometry(model);
        if geometry.is_none() {
            log::error!(
                "[Stages] [VideoPreproc] model `{}` input is not u8 NCHW/NHWC with 3 channels",
                model.name()
            );
        }
        *self.geometry.lock() = geometry;
    }

    fn on_preproc(
        &self,
        items: &[InferData],
        rects: &[Option<Rect>],
        dst: &ModelIo,
        _model: &Model,
    ) -> Status {
        let Some(geometry) = *self.geometry.lock() else {
            return Status::InvalidParam;
        };
        let mut canvas = vec![0u8; geometry.width * geometry.height * 3];
        for (idx, item) in items.iter().enumerate() {
            let InferValue::Image { surf, .. } = &item.value else {
                log::error!(
                    "[Stages] [VideoPreproc] cannot feed a {} value",
                    item.value.kind()
                );
                return Status::WrongType;
            };
            let Some((mut pixels, mut width, mut height)) = surface_to_bgr(surf) else {
                log::error!(
                    "[Stages] [VideoPreproc] unsupported source format {:?}",
                    surf.desc().format
                );
                return Status::WrongType;
            };
            if let Some(rect) = rects.get(idx).copied().flatten() {
                let (cropped, w, h) = crop_bgr(&pixels, width, height, rect);
                pixels = cropped;
                width = w;
                height = h;
            }
            scale_into(
                &pixels,
                width,
                height,
                &mut canvas,
                geometry,
                self.keep_aspect_ratio,
                self.pad_value,
            );
            let tensor = if geometry.planar {
                interleaved_to_planar(&canvas, geometry.width, geometry.height)
            } else {
                canvas.clone()
            };
            let slot = match dst.item_view(0, idx) {
                Ok(slot) => slot,
                Err(err) => {
                    log::error!("[Stages] [VideoPreproc] input slot unavailable: {err}");
                    return Status::ErrorMemory;
                }
            };
            let bytes = tensor.len().min(slot.len());
            if slot.copy_from(&tensor[..bytes]).is_err() {
                return Status::ErrorMemory;
            }
        }
        Status::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{ModelManifest, TensorDesc};
    use std::sync::Arc;
    use surface::{MemKind, SurfaceDesc};

    fn nhwc_model(batch: usize, height: usize, width: usize) -> Arc<Model> {
        Model::from_manifest(ModelManifest {
            name: "video".into(),
            inputs: vec![TensorDesc {
                dims: vec![batch, height, width, 3],
                dtype: DataType::U8,
                order: DimOrder::Nhwc,
            }],
            outputs: vec![TensorDesc {
                dims: vec![batch, 8],
                dtype: DataType::F32,
                order: DimOrder::None,
            }],
        })
        .expect("model")
    }

    fn bind0() {
        device::DeviceContext::new(0)
            .expect("device 0")
            .bind()
            .expect("bind");
    }

    fn bgr_surface(width: u32, height: u32, fill: [u8; 3]) -> Surface {
        let desc = SurfaceDesc {
            batch: 1,
            width,
            height,
            format: ColorFormat::Bgr24,
            alignment: 64,
            mem_kind: MemKind::PinnedHost,
            device_id: 0,
        };
        let surf = Surface::alloc(&desc).expect("surface");
        {
            let mut map = surf.map_host().expect("map");
            for px in map.bytes_mut().chunks_exact_mut(3) {
                px.copy_from_slice(&fill);
            }
        }
        surf.sync_to_device().expect("sync");
        surf
    }

    fn staging_for(model: &Model) -> ModelIo {
        bind0();
        let buffer = surface::Buffer::device(model.input_batch_bytes(0)).expect("staging");
        ModelIo {
            buffers: vec![buffer],
            shapes: vec![model.input_shape(0).clone()],
            layouts: vec![model.input_layout(0)],
        }
    }

    #[test]
    fn geometry_parsed_per_dim_order() {
        let model = nhwc_model(2, 32, 64);
        let geometry = input_geometry(&model).expect("geometry");
        assert_eq!((geometry.width, geometry.height), (64, 32));
        assert!(!geometry.planar);
    }

    #[test]
    fn bgr_frame_is_scaled_into_the_slot() {
        bind0();
        let model = nhwc_model(1, 8, 8);
        let staging = staging_for(&model);
        let preproc = VideoPreprocessor::new();
        preproc.on_tensor_params(&model, ColorFormat::Bgr24);

        let items = vec![InferData::image(bgr_surface(32, 32, [10, 20, 30]))];
        let status = preproc.on_preproc(&items, &[None], &staging, &model);
        assert!(status.is_success());

        let mut out = vec![0u8; model.input_batch_bytes(0)];
        staging.buffers[0].copy_to(&mut out).expect("read");
        assert_eq!(&out[..3], &[10, 20, 30], "solid color survives scaling");
        assert_eq!(&out[out.len() - 3..], &[10, 20, 30]);
    }

    #[test]
    fn letterbox_pads_the_short_axis() {
        bind0();
        let model = nhwc_model(1, 8, 8);
        let staging = staging_for(&model);
        let preproc = VideoPreprocessor::letterbox(128);
        preproc.on_tensor_params(&model, ColorFormat::Bgr24);

        // A wide 32x8 image scales to 8x2, centred with padding above and
        // below.
        let items = vec![InferData::image(bgr_surface(32, 8, [50, 60, 70]))];
        let status = preproc.on_preproc(&items, &[None], &staging, &model);
        assert!(status.is_success());

        let mut out = vec![0u8; model.input_batch_bytes(0)];
        staging.buffers[0].copy_to(&mut out).expect("read");
        assert_eq!(&out[..3], &[128, 128, 128], "top rows are padding");
        let mid = (4 * 8) * 3;
        assert_eq!(&out[mid..mid + 3], &[50, 60, 70], "centre rows are image");
    }

    #[test]
    fn crop_rect_limits_the_source() {
        bind0();
        let model = nhwc_model(1, 4, 4);
        let staging = staging_for(&model);
        let preproc = VideoPreprocessor::new();
        preproc.on_tensor_params(&model, ColorFormat::Bgr24);

        // Left half dark, right half bright; crop the right half.
        let desc = SurfaceDesc {
            batch: 1,
            width: 16,
            height: 8,
            format: ColorFormat::Bgr24,
            alignment: 64,
            mem_kind: MemKind::PinnedHost,
            device_id: 0,
        };
        let surf = Surface::alloc(&desc).expect("surface");
        {
            let mut map = surf.map_host().expect("map");
            let stride = surf.layout().planes[0].stride;
            for row in 0..8 {
                for col in 0..16 {
                    let value = if col < 8 { 0 } else { 200 };
                    let at = row * stride + col * 3;
                    map.bytes_mut()[at..at + 3].copy_from_slice(&[value; 3]);
                }
            }
        }
        surf.sync_to_device().expect("sync");

        let items = vec![InferData::image_roi(
            surf,
            Rect {
                x: 8,
                y: 0,
                w: 8,
                h: 8,
            },
        )];
        let rects = [Some(Rect {
            x: 8,
            y: 0,
            w: 8,
            h: 8,
        })];
        let status = preproc.on_preproc(&items, &rects, &staging, &model);
        assert!(status.is_success());

        let mut out = vec![0u8; model.input_batch_bytes(0)];
        staging.buffers[0].copy_to(&mut out).expect("read");
        assert!(out.iter().all(|&b| b == 200), "only the crop was sampled");
    }

    #[test]
    fn nv12_gray_converts_to_gray_bgr() {
        bind0();
        let model = nhwc_model(1, 4, 4);
        let staging = staging_for(&model);
        let preproc = VideoPreprocessor::new();
        preproc.on_tensor_params(&model, ColorFormat::Nv12);

        let desc = SurfaceDesc {
            batch: 1,
            width: 8,
            height: 8,
            format: ColorFormat::Nv12,
            alignment: 64,
            mem_kind: MemKind::PinnedHost,
            device_id: 0,
        };
        let surf = Surface::alloc(&desc).expect("surface");
        {
            let mut map = surf.map_host().expect("map");
            let layout = surf.layout().clone();
            let luma_bytes = layout.planes[0].size;
            // Mid gray: Y=126, U=V=128.
            map.bytes_mut()[..luma_bytes].fill(126);
            map.bytes_mut()[luma_bytes..].fill(128);
        }
        surf.sync_to_device().expect("sync");

        let items = vec![InferData::image(surf)];
        let status = preproc.on_preproc(&items, &[None], &staging, &model);
        assert!(status.is_success());

        let mut out = vec![0u8; model.input_batch_bytes(0)];
        staging.buffers[0].copy_to(&mut out).expect("read");
        for px in out.chunks_exact(3) {
            assert!(px.iter().all(|&c| (125..=131).contains(&c)), "gray in, gray out: {px:?}");
        }
    }
}
