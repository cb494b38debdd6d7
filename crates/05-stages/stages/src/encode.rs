//! Sink stage: pipeline frames in, encoded packets out.
//!
//! One encoder instance per stream, created lazily when the stream's first
//! frame arrives. Packets are handed to a caller-supplied [`PacketSink`]
//! from the encoder's dispatcher thread; EOS frames forward `send_eos`.

use std::collections::HashMap;
use std::sync::Arc;

use codec::{CodecError, EncodeClient, EncodedPacket, Encoder, VencCreateParams};
use parking_lot::Mutex;
use pipeline::{Flow, Frame, Module, PipelineError, PipelineResult, Transmitter};

/// Consumer of encoded packets. Packet bytes are only valid inside the
/// callback and must be copied if retained.
pub trait PacketSink: Send + Sync + 'static {
    fn on_packet(&self, stream_id: u32, data: &[u8], pts: u64, keyframe: bool);
    fn on_eos(&self, stream_id: u32);
}

struct SinkClient {
    stream_id: u32,
    sink: Arc<dyn PacketSink>,
}

impl EncodeClient for SinkClient {
    fn on_packet(&self, pkt: &EncodedPacket<'_>) {
        self.sink
            .on_packet(self.stream_id, pkt.data, pkt.pts, pkt.keyframe);
    }

    fn on_eos(&self) {
        self.sink.on_eos(self.stream_id);
    }

    fn on_error(&self, err: CodecError) {
        log::error!("[Stages] [Encode] stream {}: {err}", self.stream_id);
    }
}

/// Encoding sink stage.
pub struct EncodeStage {
    name: String,
    params: VencCreateParams,
    sink: Arc<dyn PacketSink>,
    parallelism: usize,
    encoders: Mutex<HashMap<u32, Encoder>>,
}

impl EncodeStage {
    pub fn new(
        name: impl Into<String>,
        params: VencCreateParams,
        parallelism: usize,
        sink: Arc<dyn PacketSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            params,
            sink,
            parallelism,
            encoders: Mutex::new(HashMap::new()),
        })
    }
}

impl Module for EncodeStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn parallelism(&self) -> usize {
        self.parallelism
    }

    fn process(&self, frame: Option<Frame>, _tx: &Transmitter) -> PipelineResult<Flow> {
        let frame = frame.ok_or_else(|| {
            PipelineError::Module("encode stage is not a source".into())
        })?;

        if frame.eos {
            // Dropping the instance joins its dispatcher after the EOS
            // callback ran.
            if let Some(encoder) = self.encoders.lock().remove(&frame.stream_id) {
                if let Err(err) = encoder.send_eos() {
                    log::error!(
                        "[Stages] [Encode] eos for stream {} failed: {err}",
                        frame.stream_id
                    );
                }
            } else {
                // An empty stream still reports its end.
                self.sink.on_eos(frame.stream_id);
            }
            return Ok(Flow::Continue);
        }

        let Some(surf) = &frame.surface else {
            return Ok(Flow::Continue);
        };
        let mut encoders = self.encoders.lock();
        let encoder = match encoders.entry(frame.stream_id) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let client = Arc::new(SinkClient {
                    stream_id: frame.stream_id,
                    sink: Arc::clone(&self.sink),
                });
                let encoder = Encoder::new(self.params, client)
                    .map_err(|err| PipelineError::Module(format!("encoder: {err}")))?;
                entry.insert(encoder)
            }
        };
        if let Err(err) = encoder.send_frame(surf, frame.pts) {
            log::error!(
                "[Stages] [Encode] frame {} of stream {} rejected: {err}",
                frame.frame_idx,
                frame.stream_id
            );
        }
        Ok(Flow::Continue)
    }

    fn close(&self) {
        // Streams cut off without EOS still flush their dispatcher.
        self.encoders.lock().clear();
    }
}
