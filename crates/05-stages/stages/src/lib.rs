//! Ready-made pipeline stages over the codec service and the inference
//! server: compressed-stream decode, batched inference with detection
//! attachment, on-screen-display box drawing, resolution scaling, and
//! encode back to packets — plus bundled video pre/postprocessors.

mod decode;
mod encode;
mod infer;
mod osd;
mod postproc;
mod resize;
mod video_preproc;

pub use decode::{DecodeStage, PacketSource};
pub use encode::{EncodeStage, PacketSink};
pub use infer::InferStage;
pub use osd::OsdStage;
pub use postproc::ClassifyPostprocessor;
pub use resize::ResizeStage;
pub use video_preproc::VideoPreprocessor;
