//! Loaded models and their shape/layout queries.

use std::sync::Arc;

use crate::error::{ModelError, ModelResult};
use crate::manifest::{DataType, DimOrder, ModelManifest, TensorDesc};

/// Tensor dimensions. The first dimension is the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// All dimensions.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// The batch dimension.
    pub fn batch(&self) -> usize {
        self.0[0]
    }

    /// Elements of one batch item (all dims after the first).
    pub fn item_count(&self) -> usize {
        self.0[1..].iter().product()
    }

    /// Elements of the whole tensor.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }
}

/// Element type plus dimension order of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorLayout {
    pub dtype: DataType,
    pub order: DimOrder,
}

struct Tensor {
    shape: Shape,
    layout: TensorLayout,
}

/// A loaded model: tensor descriptions plus the content-addressed key used
/// to attach per-model processors.
pub struct Model {
    name: String,
    key: String,
    batch_dim: usize,
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
}

fn validate_tensors(descs: &[TensorDesc], empty_err: &'static str) -> ModelResult<Vec<Tensor>> {
    if descs.is_empty() {
        return Err(ModelError::Invalid(empty_err));
    }
    descs
        .iter()
        .map(|desc| {
            if desc.dims.is_empty() {
                return Err(ModelError::Invalid("tensor with no dimensions"));
            }
            if desc.dims.iter().any(|&d| d == 0) {
                return Err(ModelError::Invalid("tensor with a zero dimension"));
            }
            Ok(Tensor {
                shape: Shape(desc.dims.clone()),
                layout: TensorLayout {
                    dtype: desc.dtype,
                    order: desc.order,
                },
            })
        })
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

impl Model {
    /// Validates a manifest and builds the shared model object.
    pub fn from_manifest(manifest: ModelManifest) -> ModelResult<Arc<Model>> {
        let inputs = validate_tensors(&manifest.inputs, "model has no inputs")?;
        let outputs = validate_tensors(&manifest.outputs, "model has no outputs")?;
        let batch_dim = inputs[0].shape.batch();
        if inputs.iter().any(|t| t.shape.batch() != batch_dim)
            || outputs.iter().any(|t| t.shape.batch() != batch_dim)
        {
            return Err(ModelError::Invalid("tensors disagree on the batch dimension"));
        }
        let canonical = serde_json::to_vec(&manifest)?;
        let key = format!("{:016x}", fnv1a(&canonical));
        Ok(Arc::new(Model {
            name: manifest.name,
            key,
            batch_dim,
            inputs,
            outputs,
        }))
    }

    /// Parses and validates a serialized manifest.
    pub fn from_bytes(bytes: &[u8]) -> ModelResult<Arc<Model>> {
        Self::from_manifest(serde_json::from_slice(bytes)?)
    }

    /// Diagnostic model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Content-addressed key; stable across loads of the same package.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Batch dimension shared by every tensor.
    pub fn batch_dim(&self) -> usize {
        self.batch_dim
    }

    /// Number of input tensors.
    pub fn input_num(&self) -> usize {
        self.inputs.len()
    }

    /// Number of output tensors.
    pub fn output_num(&self) -> usize {
        self.outputs.len()
    }

    /// Shape of input `idx`.
    pub fn input_shape(&self, idx: usize) -> &Shape {
        &self.inputs[idx].shape
    }

    /// Layout of input `idx`.
    pub fn input_layout(&self, idx: usize) -> TensorLayout {
        self.inputs[idx].layout
    }

    /// Shape of output `idx`.
    pub fn output_shape(&self, idx: usize) -> &Shape {
        &self.outputs[idx].shape
    }

    /// Layout of output `idx`.
    pub fn output_layout(&self, idx: usize) -> TensorLayout {
        self.outputs[idx].layout
    }

    /// Bytes of one batch item of input `idx`.
    pub fn input_item_bytes(&self, idx: usize) -> usize {
        self.inputs[idx].shape.item_count() * self.inputs[idx].layout.dtype.size()
    }

    /// Bytes of the full input tensor `idx`.
    pub fn input_batch_bytes(&self, idx: usize) -> usize {
        self.inputs[idx].shape.elem_count() * self.inputs[idx].layout.dtype.size()
    }

    /// Bytes of one batch item of output `idx`.
    pub fn output_item_bytes(&self, idx: usize) -> usize {
        self.outputs[idx].shape.item_count() * self.outputs[idx].layout.dtype.size()
    }

    /// Bytes of the full output tensor `idx`.
    pub fn output_batch_bytes(&self, idx: usize) -> usize {
        self.outputs[idx].shape.elem_count() * self.outputs[idx].layout.dtype.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(batch: usize) -> ModelManifest {
        ModelManifest {
            name: "ident".into(),
            inputs: vec![TensorDesc {
                dims: vec![batch, 3, 8, 8],
                dtype: DataType::U8,
                order: DimOrder::Nchw,
            }],
            outputs: vec![TensorDesc {
                dims: vec![batch, 3, 8, 8],
                dtype: DataType::U8,
                order: DimOrder::Nchw,
            }],
        }
    }

    #[test]
    fn shape_and_byte_queries() {
        let model = Model::from_manifest(manifest(4)).expect("model");
        assert_eq!(model.batch_dim(), 4);
        assert_eq!(model.input_num(), 1);
        assert_eq!(model.input_shape(0).dims(), &[4, 3, 8, 8]);
        assert_eq!(model.input_item_bytes(0), 3 * 8 * 8);
        assert_eq!(model.input_batch_bytes(0), 4 * 3 * 8 * 8);
    }

    #[test]
    fn key_is_content_addressed() {
        let a = Model::from_manifest(manifest(4)).expect("model a");
        let b = Model::from_manifest(manifest(4)).expect("model b");
        let c = Model::from_manifest(manifest(8)).expect("model c");
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn inconsistent_batch_rejected() {
        let mut m = manifest(4);
        m.outputs[0].dims[0] = 2;
        assert!(matches!(
            Model::from_manifest(m),
            Err(ModelError::Invalid(_))
        ));
    }

    #[test]
    fn empty_io_rejected() {
        let mut m = manifest(4);
        m.inputs.clear();
        assert!(Model::from_manifest(m).is_err());
    }
}
