//! Inference engines: one executor slot per configured `engine_num`.
//!
//! Each engine owns one task queue (its device stream) and its model I/O
//! staging: a reusable device block per model input, and a pool of output
//! blocks so responses can keep views of their tensors while the engine
//! moves on to the next batch. The forward pass of the software device
//! copies input bytes to each output, truncating or zero-filling on size
//! mismatch, which makes identity models exact.

use std::sync::Arc;

use device::{DeviceId, TaskQueue};
use model::{Model, Shape, TensorLayout};
use surface::{Buffer, MemPool};

use crate::error::ServerResult;

/// Device tensors for a whole batch: one buffer per model input or output.
#[derive(Clone)]
pub struct ModelIo {
    pub buffers: Vec<Buffer>,
    pub shapes: Vec<Shape>,
    pub layouts: Vec<TensorLayout>,
}

impl ModelIo {
    /// Bytes of one batch item of tensor `idx`.
    pub fn item_bytes(&self, idx: usize) -> usize {
        self.shapes[idx].item_count() * self.layouts[idx].dtype.size()
    }

    /// View of batch item `item_idx` inside tensor `idx`.
    pub fn item_view(&self, idx: usize, item_idx: usize) -> ServerResult<Buffer> {
        let bytes = self.item_bytes(idx);
        Ok(self.buffers[idx].narrow(item_idx * bytes, bytes)?)
    }
}

pub(crate) fn input_staging(model: &Model) -> ServerResult<ModelIo> {
    let mut buffers = Vec::with_capacity(model.input_num());
    let mut shapes = Vec::with_capacity(model.input_num());
    let mut layouts = Vec::with_capacity(model.input_num());
    for idx in 0..model.input_num() {
        buffers.push(Buffer::device(model.input_batch_bytes(idx))?);
        shapes.push(model.input_shape(idx).clone());
        layouts.push(model.input_layout(idx));
    }
    Ok(ModelIo {
        buffers,
        shapes,
        layouts,
    })
}

const OUTPUT_POOL_DEPTH: usize = 8;

/// One executor slot: task queue plus staged model I/O.
pub(crate) struct Engine {
    model: Arc<Model>,
    queue: TaskQueue,
    input: ModelIo,
    output_pool: MemPool,
}

impl Engine {
    /// Creates a slot on `device`. Must run on a thread bound to it.
    pub(crate) fn new(model: Arc<Model>, device: DeviceId) -> ServerResult<Self> {
        let queue = TaskQueue::create(device)?;
        let input = input_staging(&model)?;
        let output_block: usize = (0..model.output_num())
            .map(|idx| model.output_batch_bytes(idx))
            .sum();
        let output_pool = MemPool::new(output_block, OUTPUT_POOL_DEPTH)?;
        Ok(Self {
            model,
            queue,
            input,
            output_pool,
        })
    }

    /// The reusable input staging, filled by the preprocessor.
    pub(crate) fn input(&self) -> &ModelIo {
        &self.input
    }

    /// Enqueues one forward pass and waits for it; returns the output
    /// tensors (pool backed) and the on-stream execution time.
    pub(crate) fn forward(&self) -> ServerResult<(ModelIo, f32)> {
        let block = self.output_pool.request();
        let mut buffers = Vec::with_capacity(self.model.output_num());
        let mut shapes = Vec::with_capacity(self.model.output_num());
        let mut layouts = Vec::with_capacity(self.model.output_num());
        let mut offset = 0usize;
        for idx in 0..self.model.output_num() {
            let bytes = self.model.output_batch_bytes(idx);
            buffers.push(block.narrow(offset, bytes)?);
            shapes.push(self.model.output_shape(idx).clone());
            layouts.push(self.model.output_layout(idx));
            offset += bytes;
        }

        let start = self.queue.place_mark()?;
        let in_ptr = self.input.buffers[0]
            .dev_ptr()
            .expect("input staging is device resident");
        let in_bytes = self.model.input_batch_bytes(0);
        for (idx, out) in buffers.iter().enumerate() {
            let out_ptr = out.dev_ptr().expect("output block is device resident");
            let out_bytes = self.model.output_batch_bytes(idx);
            let copy_bytes = in_bytes.min(out_bytes);
            self.queue.submit(move || {
                if out_bytes > copy_bytes {
                    if let Err(err) = device::mem::memset(out_ptr, 0, out_bytes) {
                        log::error!("[InferServer] [Engine] output clear failed: {err}");
                        return;
                    }
                }
                if let Err(err) = device::mem::copy_d2d(out_ptr, in_ptr, copy_bytes) {
                    log::error!("[InferServer] [Engine] forward copy failed: {err}");
                }
            })?;
        }
        let end = self.queue.place_mark()?;
        self.queue.sync()?;
        let elapsed = self.queue.elapsed(&start, &end)?;

        Ok((
            ModelIo {
                buffers,
                shapes,
                layouts,
            },
            elapsed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{DataType, DimOrder, ModelManifest, TensorDesc};

    fn identity_model(batch: usize, item: usize) -> Arc<Model> {
        Model::from_manifest(ModelManifest {
            name: "ident".into(),
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
        .expect("model")
    }

    fn bind0() {
        device::DeviceContext::new(0)
            .expect("device 0")
            .bind()
            .expect("bind");
    }

    #[test]
    fn identity_forward_copies_input() {
        bind0();
        let engine = Engine::new(identity_model(2, 8), 0).expect("engine");
        let payload: Vec<u8> = (0..16).collect();
        engine.input().buffers[0].copy_from(&payload).expect("fill");
        let (out, elapsed) = engine.forward().expect("forward");
        let mut got = vec![0u8; 16];
        out.buffers[0].copy_to(&mut got).expect("read");
        assert_eq!(got, payload);
        assert!(elapsed >= 0.0);
    }

    #[test]
    fn larger_output_is_zero_filled() {
        bind0();
        let model = Model::from_manifest(ModelManifest {
            name: "grow".into(),
            inputs: vec![TensorDesc {
                dims: vec![1, 4],
                dtype: DataType::U8,
                order: DimOrder::None,
            }],
            outputs: vec![TensorDesc {
                dims: vec![1, 8],
                dtype: DataType::U8,
                order: DimOrder::None,
            }],
        })
        .expect("model");
        let engine = Engine::new(model, 0).expect("engine");
        engine.input().buffers[0]
            .copy_from(&[9, 9, 9, 9])
            .expect("fill");
        let (out, _) = engine.forward().expect("forward");
        let mut got = vec![0xffu8; 8];
        out.buffers[0].copy_to(&mut got).expect("read");
        assert_eq!(got, vec![9, 9, 9, 9, 0, 0, 0, 0]);
    }

    #[test]
    fn item_views_partition_the_batch() {
        bind0();
        let engine = Engine::new(identity_model(4, 4), 0).expect("engine");
        let payload: Vec<u8> = (0..16).collect();
        engine.input().buffers[0].copy_from(&payload).expect("fill");
        let (out, _) = engine.forward().expect("forward");
        let view = out.item_view(0, 2).expect("view");
        let mut got = vec![0u8; 4];
        view.copy_to(&mut got).expect("read");
        assert_eq!(got, vec![8, 9, 10, 11]);
    }
}
