//! Color formats and the plane layout rules.
//!
//! Layout follows the per-format rules: the first stride is aligned up to
//! the requested alignment; for 3-plane YUV each following stride is half
//! the previous one, for 2-plane YUV the chroma stride equals the luma
//! stride; chroma plane height is `(height + 1) / 2`.

use smallvec::SmallVec;

use crate::error::{SurfaceError, SurfaceResult};

/// Pixel formats the runtime understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    Nv12,
    Nv21,
    I420,
    P010,
    I010,
    Bgr24,
    Rgb24,
    Bgra,
    Rgba,
    Abgr,
    Argb,
    Yuyv,
    Uyvy,
    Monochrome,
}

impl ColorFormat {
    /// Number of planes an image of this format occupies.
    pub fn plane_num(self) -> usize {
        match self {
            ColorFormat::Nv12 | ColorFormat::Nv21 | ColorFormat::P010 => 2,
            ColorFormat::I420 | ColorFormat::I010 => 3,
            _ => 1,
        }
    }

    /// Bytes per pixel in the first plane.
    pub fn luma_bytes(self) -> usize {
        match self {
            ColorFormat::Nv12 | ColorFormat::Nv21 | ColorFormat::I420 | ColorFormat::Monochrome => {
                1
            }
            ColorFormat::P010 | ColorFormat::I010 => 2,
            ColorFormat::Yuyv | ColorFormat::Uyvy => 2,
            ColorFormat::Bgr24 | ColorFormat::Rgb24 => 3,
            ColorFormat::Bgra | ColorFormat::Rgba | ColorFormat::Abgr | ColorFormat::Argb => 4,
        }
    }

}

/// One plane of a laid-out image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    /// Byte offset of this plane from the start of one image.
    pub offset: usize,
    /// Total bytes of this plane.
    pub size: usize,
}

/// Full layout of one image; a surface repeats it `batch` times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceLayout {
    pub planes: SmallVec<[PlaneLayout; 3]>,
    /// Bytes of one image, all planes.
    pub image_size: usize,
}

fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Computes the plane layout for one `width`×`height` image of `format`,
/// with the first stride aligned up to `alignment` bytes.
pub fn compute_layout(
    format: ColorFormat,
    width: u32,
    height: u32,
    alignment: usize,
) -> SurfaceResult<SurfaceLayout> {
    if width == 0 || height == 0 {
        return Err(SurfaceError::InvalidDesc("zero width or height"));
    }
    if !alignment.is_power_of_two() {
        return Err(SurfaceError::InvalidDesc("alignment must be a power of two"));
    }

    let plane_num = format.plane_num();
    let chroma_height = (height + 1) / 2;
    let stride0 = align_up(width as usize * format.luma_bytes(), alignment);

    let mut planes: SmallVec<[PlaneLayout; 3]> = SmallVec::new();
    let mut offset = 0usize;
    for idx in 0..plane_num {
        let (w, h, stride) = if idx == 0 {
            (width, height, stride0)
        } else if plane_num == 2 {
            (width, chroma_height, stride0)
        } else {
            let prev = planes[idx - 1].stride;
            ((width + 1) / 2, chroma_height, prev / 2)
        };
        let size = stride * h as usize;
        planes.push(PlaneLayout {
            width: w,
            height: h,
            stride,
            offset,
            size,
        });
        offset += size;
    }

    Ok(SurfaceLayout {
        planes,
        image_size: offset,
    })
}
