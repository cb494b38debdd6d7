//! Shared geometry and detection-result types.
//!
//! These cross every layer above: crop lists handed to preprocessors, boxes
//! drawn by the OSD stage, and detections attached to pipeline frames.

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Normalized bounding box; coordinates and extents in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    /// Converts to a pixel rectangle inside a `width`×`height` image,
    /// clamped to the image bounds.
    pub fn to_rect(&self, width: u32, height: u32) -> Rect {
        let clamp01 = |v: f32| v.clamp(0.0, 1.0);
        let x = (clamp01(self.x) * width as f32) as u32;
        let y = (clamp01(self.y) * height as f32) as u32;
        let w = ((clamp01(self.w) * width as f32) as u32).min(width.saturating_sub(x));
        let h = ((clamp01(self.h) * height as f32) as u32).min(height.saturating_sub(y));
        Rect { x, y, w, h }
    }
}

/// One detected object.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub label: i32,
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_clamps_to_image() {
        let bbox = BoundingBox {
            x: 0.5,
            y: 0.5,
            w: 0.9,
            h: 0.9,
        };
        let rect = bbox.to_rect(100, 100);
        assert_eq!(rect.x, 50);
        assert_eq!(rect.y, 50);
        assert_eq!(rect.w, 50, "width clamped to image edge");
        assert_eq!(rect.h, 50, "height clamped to image edge");
    }
}
