//! Request and response payloads.
//!
//! An [`InferData`] is a polymorphic single-value holder: an input image or
//! tensor on the way in, a detection list, tensor view or user value on the
//! way out. Extension points are new [`InferValue`] variants, not runtime
//! downcasting. A [`Package`] is an ordered list of infer data items sharing
//! one stream tag.

use std::any::Any;

use surface::{Buffer, Detection, Rect, Surface};

use crate::engine::ModelIo;

/// Opaque per-request caller data, handed back with the response.
pub type UserData = Option<Box<dyn Any + Send>>;

/// The value carried by one work unit.
pub enum InferValue {
    /// No payload yet; legal in requests, completed as-is.
    Empty,
    /// An input image, optionally cropped to a region of interest.
    Image { surf: Surface, roi: Option<Rect> },
    /// Raw tensor bytes, host or device resident.
    Tensor(Buffer),
    /// Concatenated model I/O for a whole batch.
    ModelIo(ModelIo),
    /// Detected objects, written by detection postprocessors.
    Detections(Vec<Detection>),
    /// Free-form user result, written by custom postprocessors.
    User(serde_json::Value),
}

impl InferValue {
    /// Short name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            InferValue::Empty => "empty",
            InferValue::Image { .. } => "image",
            InferValue::Tensor(_) => "tensor",
            InferValue::ModelIo(_) => "model-io",
            InferValue::Detections(_) => "detections",
            InferValue::User(_) => "user",
        }
    }
}

/// One work unit: a value plus an opaque user slot.
pub struct InferData {
    pub value: InferValue,
    pub user_data: UserData,
}

impl InferData {
    /// Wraps a value with no user slot.
    pub fn new(value: InferValue) -> Self {
        Self {
            value,
            user_data: None,
        }
    }

    /// Wraps an input image.
    pub fn image(surf: Surface) -> Self {
        Self::new(InferValue::Image { surf, roi: None })
    }

    /// Wraps an input image cropped to `roi`.
    pub fn image_roi(surf: Surface, roi: Rect) -> Self {
        Self::new(InferValue::Image {
            surf,
            roi: Some(roi),
        })
    }

    /// Wraps raw tensor bytes.
    pub fn tensor(buffer: Buffer) -> Self {
        Self::new(InferValue::Tensor(buffer))
    }
}

/// An ordered list of work units sharing one stream tag.
pub struct Package {
    pub data: Vec<InferData>,
    /// Stream identifier; per-tag responses are delivered in request order.
    pub tag: String,
    /// Dispatch priority 0..=9 (9 highest); `None` inherits the session's.
    pub priority: Option<u8>,
}

impl Package {
    /// Creates an empty package for `tag`.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            data: Vec::new(),
            tag: tag.into(),
            priority: None,
        }
    }

    /// Appends one work unit.
    pub fn push(&mut self, data: InferData) -> &mut Self {
        self.data.push(data);
        self
    }

    /// Number of work units.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` when the package has no work units.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
