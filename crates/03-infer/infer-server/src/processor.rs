//! Preprocessors, postprocessors and the process-wide handler registry.
//!
//! Handlers are attached per model key in a process-wide table; a session
//! whose descriptor names no handler falls back to the registry, and from
//! there to the default host-memcpy preprocessor. Registered handlers must
//! outlive every session that uses them — sessions keep shared handles, so
//! dropping the registration alone does not invalidate running sessions.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use model::Model;
use parking_lot::RwLock;
use surface::{ColorFormat, Rect};

use crate::data::{InferData, InferValue};
use crate::engine::ModelIo;
use crate::status::Status;

/// Batch preprocessor: fills the model input staging from raw work units.
pub trait Preprocessor: Send + Sync + 'static {
    /// Called once per session start so the handler can cache the model's
    /// input layout and the session's input format hint.
    fn on_tensor_params(&self, model: &Model, input_format: ColorFormat) {
        let _ = (model, input_format);
    }

    /// Fills `dst` (shaped to the model input, one slot per item) from
    /// `items`; `rects` carries the optional per-item crop.
    fn on_preproc(
        &self,
        items: &[InferData],
        rects: &[Option<Rect>],
        dst: &ModelIo,
        model: &Model,
    ) -> Status;
}

/// Batch postprocessor: writes user-visible results into each work unit.
pub trait Postprocessor: Send + Sync + 'static {
    fn on_postproc(&self, items: &mut [InferData], output: &ModelIo, model: &Model) -> Status;
}

#[derive(Default, Clone)]
pub(crate) struct ProcessorEntry {
    pub(crate) pre: Option<Arc<dyn Preprocessor>>,
    pub(crate) post: Option<Arc<dyn Postprocessor>>,
}

fn registry() -> &'static RwLock<HashMap<String, ProcessorEntry>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, ProcessorEntry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Attaches a preprocessor to every future session of the model with
/// `model_key`.
pub fn register_preprocessor(model_key: &str, preproc: Arc<dyn Preprocessor>) {
    registry()
        .write()
        .entry(model_key.to_string())
        .or_default()
        .pre = Some(preproc);
}

/// Attaches a postprocessor to every future session of the model with
/// `model_key`.
pub fn register_postprocessor(model_key: &str, postproc: Arc<dyn Postprocessor>) {
    registry()
        .write()
        .entry(model_key.to_string())
        .or_default()
        .post = Some(postproc);
}

pub(crate) fn lookup(model_key: &str) -> ProcessorEntry {
    registry().read().get(model_key).cloned().unwrap_or_default()
}

/// Fallback preprocessor: a straight memcpy of each unit into its input
/// slot. Tensor bytes are copied through the host; images are copied block
/// to block on the device. Crop rects are ignored — cropping is a concern
/// of format-aware handlers.
pub(crate) struct DefaultPreprocessor;

impl Preprocessor for DefaultPreprocessor {
    fn on_preproc(
        &self,
        items: &[InferData],
        _rects: &[Option<Rect>],
        dst: &ModelIo,
        _model: &Model,
    ) -> Status {
        for (idx, item) in items.iter().enumerate() {
            let slot = match dst.item_view(0, idx) {
                Ok(slot) => slot,
                Err(err) => {
                    log::error!("[InferServer] [Preproc] input slot unavailable: {err}");
                    return Status::ErrorMemory;
                }
            };
            let copied = match &item.value {
                InferValue::Tensor(buf) => {
                    let bytes = buf.len().min(slot.len());
                    let mut tmp = vec![0u8; bytes];
                    buf.copy_to(&mut tmp)
                        .and_then(|_| slot.copy_from(&tmp))
                        .map_err(|err| {
                            log::error!("[InferServer] [Preproc] tensor copy failed: {err}")
                        })
                }
                InferValue::Image { surf, .. } => {
                    let slot_ptr = slot.dev_ptr().expect("input staging is device resident");
                    let bytes = surf.total_size().min(slot.len());
                    device::mem::copy_d2d(slot_ptr, surf.dev_ptr(), bytes).map_err(|err| {
                        log::error!("[InferServer] [Preproc] image copy failed: {err}")
                    })
                }
                // An empty unit contributes a zeroed slot.
                InferValue::Empty => Ok(()),
                other => {
                    log::error!(
                        "[InferServer] [Preproc] cannot feed a {} value to the model",
                        other.kind()
                    );
                    return Status::WrongType;
                }
            };
            if copied.is_err() {
                return Status::ErrorMemory;
            }
        }
        Status::Success
    }
}

/// With no postprocessor configured, the raw output tensor lands in each
/// unit: a view of the unit's slice for single-output models, the per-item
/// model I/O otherwise.
pub(crate) fn write_raw_outputs(items: &mut [InferData], output: &ModelIo) -> Status {
    for (idx, item) in items.iter_mut().enumerate() {
        if output.buffers.len() == 1 {
            match output.item_view(0, idx) {
                Ok(view) => item.value = InferValue::Tensor(view),
                Err(err) => {
                    log::error!("[InferServer] [Postproc] output view failed: {err}");
                    return Status::ErrorMemory;
                }
            }
        } else {
            let mut buffers = Vec::with_capacity(output.buffers.len());
            for out_idx in 0..output.buffers.len() {
                match output.item_view(out_idx, idx) {
                    Ok(view) => buffers.push(view),
                    Err(err) => {
                        log::error!("[InferServer] [Postproc] output view failed: {err}");
                        return Status::ErrorMemory;
                    }
                }
            }
            item.value = InferValue::ModelIo(ModelIo {
                buffers,
                shapes: output.shapes.clone(),
                layouts: output.layouts.clone(),
            });
        }
    }
    Status::Success
}
