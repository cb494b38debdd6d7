//! On-disk manifest format of a model package.

use serde::{Deserialize, Serialize};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U8,
    F16,
    F32,
    I16,
    I32,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::F16 | DataType::I16 => 2,
            DataType::F32 | DataType::I32 => 4,
        }
    }
}

/// Dimension order of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DimOrder {
    Nchw,
    Nhwc,
    Hwcn,
    Tnc,
    Ntc,
    None,
}

/// One tensor of a model, as written in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorDesc {
    pub dims: Vec<usize>,
    pub dtype: DataType,
    pub order: DimOrder,
}

/// The manifest at the root of every model package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub name: String,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
}
