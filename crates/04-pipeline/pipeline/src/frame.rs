//! Frames flowing through pipeline links.

use std::any::Any;

use surface::{Detection, Surface};

/// One unit of pipeline traffic: a decoded picture with its bookkeeping, or
/// an end-of-stream marker (which carries no surface).
pub struct Frame {
    /// Routing key; all frames of one stream land on one worker per node.
    pub stream_id: u32,
    /// Non-decreasing per stream within one source.
    pub frame_idx: u64,
    /// End-of-stream marker.
    pub eos: bool,
    /// The picture; `None` on EOS frames.
    pub surface: Option<Surface>,
    /// Presentation timestamp, carried decoder to encoder.
    pub pts: u64,
    /// Results attached by inference stages.
    pub detections: Vec<Detection>,
    /// Free slot for module-private data.
    pub user_data: Option<Box<dyn Any + Send>>,
}

impl Frame {
    /// A regular picture frame.
    pub fn new(stream_id: u32, frame_idx: u64, surface: Surface, pts: u64) -> Self {
        Self {
            stream_id,
            frame_idx,
            eos: false,
            surface: Some(surface),
            pts,
            detections: Vec::new(),
            user_data: None,
        }
    }

    /// The end-of-stream marker for `stream_id`.
    pub fn eos(stream_id: u32) -> Self {
        Self {
            stream_id,
            frame_idx: 0,
            eos: true,
            surface: None,
            pts: 0,
            detections: Vec::new(),
            user_data: None,
        }
    }
}
