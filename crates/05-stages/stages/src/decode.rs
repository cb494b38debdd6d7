//! Source stage: compressed packets in, decoded pipeline frames out.
//!
//! The stage drives a decoder instance from its source loop: it pulls
//! packets from a [`PacketSource`] (demuxing stays outside the runtime),
//! feeds them to the decoder, and relays decoded surfaces — delivered on
//! the decoder's dispatcher thread — through an internal channel into the
//! pipeline. Decoder EOS becomes the stream's EOS frame; decoder errors
//! stop the stream after logging.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use codec::{CodecError, CodecResult, DecodeClient, Decoder, VdecCreateParams, VideoPacket};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use pipeline::{Flow, Frame, Module, PipelineError, PipelineResult, Transmitter};
use surface::{ColorFormat, Surface, SurfaceDesc, SurfacePool};

/// Supplier of compressed stream packets.
pub trait PacketSource: Send + Sync + 'static {
    /// The next packet `(bits, pts)`, or `None` at end of stream.
    fn next_packet(&self) -> Option<(Vec<u8>, u64)>;
}

struct StageClient {
    pool: SurfacePool,
    frame_tx: Sender<(Surface, u64)>,
    eos: AtomicBool,
    failed: AtomicBool,
}

impl DecodeClient for StageClient {
    fn get_buf_surface(
        &self,
        _width: u32,
        _height: u32,
        _format: ColorFormat,
        timeout: Duration,
    ) -> CodecResult<Surface> {
        Ok(self.pool.request_timeout(timeout)?)
    }

    fn on_frame(&self, surf: Surface, pts: u64) {
        // The pipeline side hung up; dropping the surface releases it.
        let _ = self.frame_tx.send((surf, pts));
    }

    fn on_eos(&self) {
        self.eos.store(true, Ordering::Release);
    }

    fn on_error(&self, err: CodecError) {
        log::error!("[Stages] [Decode] decoder reported: {err}");
        self.failed.store(true, Ordering::Release);
    }
}

struct Running {
    decoder: Decoder,
    client: Arc<StageClient>,
    frame_rx: Receiver<(Surface, u64)>,
    pending: Option<(Vec<u8>, u64)>,
    input_done: bool,
    next_idx: u64,
}

/// Self-driving decode stage for one stream.
pub struct DecodeStage {
    name: String,
    stream_id: u32,
    params: VdecCreateParams,
    pool_capacity: usize,
    source: Arc<dyn PacketSource>,
    closed: AtomicBool,
    running: Mutex<Option<Running>>,
}

const SEND_RETRY_WINDOW: Duration = Duration::from_millis(20);

impl DecodeStage {
    pub fn new(
        name: impl Into<String>,
        stream_id: u32,
        params: VdecCreateParams,
        pool_capacity: usize,
        source: Arc<dyn PacketSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            stream_id,
            params,
            pool_capacity,
            source,
            closed: AtomicBool::new(false),
            running: Mutex::new(None),
        })
    }

    fn drain_decoded(&self, running: &mut Running, tx: &Transmitter) -> PipelineResult<usize> {
        let mut drained = 0;
        while let Ok((surf, pts)) = running.frame_rx.try_recv() {
            let idx = running.next_idx;
            running.next_idx += 1;
            tx.transmit(Frame::new(self.stream_id, idx, surf, pts))?;
            drained += 1;
        }
        Ok(drained)
    }
}

impl Module for DecodeStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> PipelineResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let desc = SurfaceDesc {
            batch: 1,
            width: self.params.max_width,
            height: self.params.max_height,
            format: self.params.color_format,
            alignment: 0,
            mem_kind: surface::MemKind::PinnedHost,
            device_id: self.params.device_id,
        };
        let pool = SurfacePool::new(&desc, self.pool_capacity)
            .map_err(|err| PipelineError::Module(format!("decode pool: {err}")))?;
        let (frame_tx, frame_rx) = unbounded();
        let client = Arc::new(StageClient {
            pool,
            frame_tx,
            eos: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        });
        let decoder = Decoder::new(self.params, client.clone())
            .map_err(|err| PipelineError::Module(format!("decoder: {err}")))?;
        *running = Some(Running {
            decoder,
            client,
            frame_rx,
            pending: None,
            input_done: false,
            next_idx: 0,
        });
        Ok(())
    }

    fn process(&self, _frame: Option<Frame>, tx: &Transmitter) -> PipelineResult<Flow> {
        let mut guard = self.running.lock();
        let running = guard
            .as_mut()
            .ok_or_else(|| PipelineError::Module("decode stage not opened".into()))?;

        if running.client.failed.load(Ordering::Acquire) {
            // Terminal decoder error: stop this stream.
            self.drain_decoded(running, tx)?;
            running.decoder.abort();
            tx.transmit(Frame::eos(self.stream_id))?;
            return Ok(Flow::Eos);
        }

        if !running.input_done {
            if running.pending.is_none() && !self.closed.load(Ordering::Acquire) {
                running.pending = self.source.next_packet();
                if running.pending.is_none() {
                    self.closed.store(true, Ordering::Release);
                }
            }
            let packet = if self.closed.load(Ordering::Acquire) && running.pending.is_none() {
                VideoPacket {
                    bits: None,
                    pts: 0,
                    flags: 0,
                }
            } else {
                let (bits, pts) = running.pending.as_ref().expect("pending packet present");
                VideoPacket {
                    bits: Some(bits.as_slice()),
                    pts: *pts,
                    flags: 0,
                }
            };
            match running.decoder.send_stream(&packet, SEND_RETRY_WINDOW) {
                Ok(()) => {
                    if packet.bits.is_none() {
                        running.input_done = true;
                    } else {
                        running.pending = None;
                    }
                }
                // Backpressure: keep the packet and drain instead.
                Err(CodecError::Timeout { .. }) => {}
                Err(err) => {
                    log::error!("[Stages] [Decode] send failed: {err}");
                    running.input_done = true;
                }
            }
        }

        let drained = self.drain_decoded(running, tx)?;

        if running.client.eos.load(Ordering::Acquire) && running.frame_rx.is_empty() {
            tx.transmit(Frame::eos(self.stream_id))?;
            return Ok(Flow::Eos);
        }
        if drained == 0 {
            // Nothing moved this round; yield instead of spinning on the
            // decoder queue.
            std::thread::sleep(Duration::from_micros(500));
        }
        Ok(Flow::Continue)
    }

    fn close(&self) {
        // Producer-side interruption: stop pulling packets; the EOS marker
        // goes to the decoder on the next driver iteration.
        self.closed.store(true, Ordering::Release);
    }
}
