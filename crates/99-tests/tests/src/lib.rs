//! Cross-crate integration scenarios for the media-and-inference runtime.
//!
//! Shared fixtures live here; the scenario suites are test-only modules.

use std::sync::Arc;

use model::{DataType, DimOrder, Model, ModelManifest, TensorDesc};

#[cfg(test)]
mod pipeline_scenarios;
#[cfg(test)]
mod pool_scenarios;
#[cfg(test)]
mod server_scenarios;
#[cfg(test)]
mod transcode;

/// A u8 identity model: `batch` items of `item` bytes in and out.
pub fn identity_model(batch: usize, item: usize) -> Arc<Model> {
    Model::from_manifest(ModelManifest {
        name: "identity".into(),
        inputs: vec![TensorDesc {
            dims: vec![batch, item],
            dtype: DataType::U8,
            order: DimOrder::None,
        }],
        outputs: vec![TensorDesc {
            dims: vec![batch, item],
            dtype: DataType::U8,
            order: DimOrder::None,
        }],
    })
    .expect("identity model")
}

/// Binds the calling thread to device 0.
pub fn bind_device0() {
    device::DeviceContext::new(0)
        .expect("device 0 present")
        .bind()
        .expect("bind device 0");
}
