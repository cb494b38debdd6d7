//! Bundled postprocessors.

use infer_server::{InferData, InferValue, ModelIo, Postprocessor, Status};
use model::{DataType, Model};
use surface::{BoundingBox, Detection};

/// Classification postprocessor: reads the f32 score vector of each item,
/// takes the argmax, and attaches a single full-frame detection when the
/// best score clears the threshold.
pub struct ClassifyPostprocessor {
    pub threshold: f32,
}

impl ClassifyPostprocessor {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Postprocessor for ClassifyPostprocessor {
    fn on_postproc(&self, items: &mut [InferData], output: &ModelIo, model: &Model) -> Status {
        if model.output_num() != 1 || model.output_layout(0).dtype != DataType::F32 {
            log::error!("[Stages] [Classify] model output is not a single f32 tensor");
            return Status::WrongType;
        }
        for (idx, item) in items.iter_mut().enumerate() {
            let view = match output.item_view(0, idx) {
                Ok(view) => view,
                Err(err) => {
                    log::error!("[Stages] [Classify] output view failed: {err}");
                    return Status::ErrorMemory;
                }
            };
            let mut bytes = vec![0u8; view.len()];
            if let Err(err) = view.copy_to(&mut bytes) {
                log::error!("[Stages] [Classify] output read failed: {err}");
                return Status::ErrorMemory;
            }
            let scores: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let best = scores
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(label, &score)| (label, score));
            let mut detections = Vec::new();
            if let Some((label, score)) = best {
                if score >= self.threshold {
                    detections.push(Detection {
                        bbox: BoundingBox {
                            x: 0.0,
                            y: 0.0,
                            w: 1.0,
                            h: 1.0,
                        },
                        label: label as i32,
                        score,
                    });
                }
            }
            item.value = InferValue::Detections(detections);
        }
        Status::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{DimOrder, ModelManifest, TensorDesc};
    use std::sync::Arc;
    use surface::Buffer;

    fn score_model(classes: usize) -> Arc<Model> {
        Model::from_manifest(ModelManifest {
            name: "cls".into(),
            inputs: vec![TensorDesc {
                dims: vec![2, 4],
                dtype: DataType::U8,
                order: DimOrder::None,
            }],
            outputs: vec![TensorDesc {
                dims: vec![2, classes],
                dtype: DataType::F32,
                order: DimOrder::None,
            }],
        })
        .expect("model")
    }

    #[test]
    fn argmax_becomes_a_detection() {
        let model = score_model(3);
        let scores: Vec<f32> = vec![0.1, 0.7, 0.2, 0.9, 0.05, 0.05];
        let bytes: Vec<u8> = scores.iter().flat_map(|s| s.to_le_bytes()).collect();
        let buffer = Buffer::host(bytes.len());
        buffer.copy_from(&bytes).expect("fill");
        let output = ModelIo {
            buffers: vec![buffer],
            shapes: vec![model.output_shape(0).clone()],
            layouts: vec![model.output_layout(0)],
        };
        let mut items = vec![
            InferData::new(InferValue::Empty),
            InferData::new(InferValue::Empty),
        ];
        let status = ClassifyPostprocessor::new(0.5).on_postproc(&mut items, &output, &model);
        assert!(status.is_success());
        match &items[0].value {
            InferValue::Detections(d) => {
                assert_eq!(d.len(), 1);
                assert_eq!(d[0].label, 1);
                assert!((d[0].score - 0.7).abs() < 1e-6);
            }
            _ => panic!("expected detections"),
        }
        match &items[1].value {
            InferValue::Detections(d) => assert_eq!(d[0].label, 0),
            _ => panic!("expected detections"),
        }
    }

    #[test]
    fn below_threshold_yields_no_detection() {
        let model = score_model(2);
        let scores: Vec<f32> = vec![0.2, 0.3, 0.1, 0.4];
        let bytes: Vec<u8> = scores.iter().flat_map(|s| s.to_le_bytes()).collect();
        let buffer = Buffer::host(bytes.len());
        buffer.copy_from(&bytes).expect("fill");
        let output = ModelIo {
            buffers: vec![buffer],
            shapes: vec![model.output_shape(0).clone()],
            layouts: vec![model.output_layout(0)],
        };
        let mut items = vec![
            InferData::new(InferValue::Empty),
            InferData::new(InferValue::Empty),
        ];
        let status = ClassifyPostprocessor::new(0.5).on_postproc(&mut items, &output, &model);
        assert!(status.is_success());
        for item in &items {
            match &item.value {
                InferValue::Detections(d) => assert!(d.is_empty()),
                _ => panic!("expected empty detections"),
            }
        }
    }
}
