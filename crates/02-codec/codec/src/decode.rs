//! Decoder instances.
//!
//! For every decoded picture the dispatcher performs, in order:
//! 1. `get_buf_surface` on the client to obtain a destination surface,
//! 2. copy of the picture into the surface (stride-aware, device memory),
//! 3. `on_frame` exactly once.
//!
//! A packet without bits is the EOS marker: queued pictures drain, then
//! `on_eos` fires exactly once. Any failure is reported through `on_error`
//! and moves the instance into a terminal state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use device::{DeviceContext, DeviceId};
use parking_lot::Mutex;
use surface::{ColorFormat, Surface, SurfaceWeak};

use crate::bitstream::{parse_packet, Packet};
use crate::error::{CodecError, CodecResult};
use crate::CodecType;

/// One compressed stream packet. `bits: None` marks end of stream.
#[derive(Debug, Clone, Copy)]
pub struct VideoPacket<'a> {
    pub bits: Option<&'a [u8]>,
    pub pts: u64,
    pub flags: u32,
}

/// Parameters for creating a decoder instance.
#[derive(Debug, Clone, Copy)]
pub struct VdecCreateParams {
    pub device_id: DeviceId,
    pub codec: CodecType,
    pub max_width: u32,
    pub max_height: u32,
    /// Decoder-side pipeline depth; honoured on core generations where the
    /// codec does not own its frame buffers.
    pub frame_buf_num: u32,
    pub color_format: ColorFormat,
    /// Deadline passed to the client's `get_buf_surface`.
    pub surf_timeout: Duration,
}

/// Client half of the decode protocol. One surface delivered through
/// `on_frame` must eventually be released by dropping every handle to it.
pub trait DecodeClient: Send + Sync + 'static {
    /// Provides a destination surface for a `width`×`height` picture.
    fn get_buf_surface(
        &self,
        width: u32,
        height: u32,
        format: ColorFormat,
        timeout: Duration,
    ) -> CodecResult<Surface>;

    /// Delivers one decoded picture. Called exactly once per picture, in
    /// decode order.
    fn on_frame(&self, surf: Surface, pts: u64);

    /// Delivers the end-of-stream marker exactly once.
    fn on_eos(&self);

    /// Reports a terminal decoder error.
    fn on_error(&self, err: CodecError);
}

enum DecCmd {
    Stream { bits: Vec<u8>, pts: u64 },
    Eos,
}

struct DecShared {
    failed: AtomicBool,
    aborted: AtomicBool,
    eos_queued: AtomicBool,
    outstanding: Mutex<Vec<SurfaceWeak>>,
}

/// A decoder instance. Dropping it waits until the client has released
/// every delivered surface, unless [`Decoder::abort`] was called.
pub struct Decoder {
    tx: Option<Sender<DecCmd>>,
    dispatcher: Option<JoinHandle<()>>,
    shared: Arc<DecShared>,
    default_pipeline_depth: usize,
}

const DEFAULT_PIPELINE_DEPTH: usize = 8;

impl Decoder {
    /// Creates a decoder and its dispatcher thread.
    pub fn new(params: VdecCreateParams, client: Arc<dyn DecodeClient>) -> CodecResult<Self> {
        if params.max_width == 0 || params.max_height == 0 {
            return Err(CodecError::InvalidParam("zero max picture size"));
        }
        let ctx = DeviceContext::new(params.device_id)?;
        let depth = if ctx.core_version().codec_owns_frame_buffers() {
            DEFAULT_PIPELINE_DEPTH
        } else {
            params.frame_buf_num.max(1) as usize
        };
        let (tx, rx) = bounded::<DecCmd>(depth);
        let shared = Arc::new(DecShared {
            failed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            eos_queued: AtomicBool::new(false),
            outstanding: Mutex::new(Vec::new()),
        });
        let shared_worker = Arc::clone(&shared);
        let dispatcher = std::thread::Builder::new()
            .name(format!("vdec-{}", params.device_id))
            .spawn(move || {
                if let Err(err) = ctx.bind() {
                    shared_worker.failed.store(true, Ordering::Release);
                    client.on_error(err.into());
                    return;
                }
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        DecCmd::Stream { bits, pts } => {
                            if let Err(err) =
                                decode_one(&params, client.as_ref(), &shared_worker, &bits, pts)
                            {
                                log::error!("[Codec] [Decode] terminal error: {err}");
                                shared_worker.failed.store(true, Ordering::Release);
                                client.on_error(err);
                                return;
                            }
                        }
                        DecCmd::Eos => {
                            client.on_eos();
                            return;
                        }
                    }
                }
            })
            .expect("spawn decoder dispatcher");
        Ok(Self {
            tx: Some(tx),
            dispatcher: Some(dispatcher),
            shared,
            default_pipeline_depth: depth,
        })
    }

    /// Queue depth the instance was created with.
    pub fn pipeline_depth(&self) -> usize {
        self.default_pipeline_depth
    }

    /// Submits one stream packet. Blocks up to `timeout` when the decode
    /// queue is full.
    pub fn send_stream(&self, pkt: &VideoPacket<'_>, timeout: Duration) -> CodecResult<()> {
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(CodecError::Terminal);
        }
        if self.shared.eos_queued.load(Ordering::Acquire) {
            return Err(CodecError::AfterEos);
        }
        let tx = self.tx.as_ref().ok_or(CodecError::Terminal)?;
        let is_eos = pkt.bits.is_none();
        let cmd = match pkt.bits {
            Some(bits) => DecCmd::Stream {
                bits: bits.to_vec(),
                pts: pkt.pts,
            },
            None => DecCmd::Eos,
        };
        tx.send_timeout(cmd, timeout).map_err(|_| {
            if self.shared.failed.load(Ordering::Acquire) {
                CodecError::Terminal
            } else {
                CodecError::Timeout {
                    waited_ms: timeout.as_millis() as u64,
                }
            }
        })?;
        if is_eos {
            self.shared.eos_queued.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Gives up waiting for the client to release delivered surfaces;
    /// destruction then returns without the usual drain.
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::Release);
    }
}

fn decode_one(
    params: &VdecCreateParams,
    client: &dyn DecodeClient,
    shared: &DecShared,
    mut bits: &[u8],
    pts: u64,
) -> CodecResult<()> {
    while !bits.is_empty() {
        let (packet, consumed) = parse_packet(bits)?;
        bits = &bits[consumed..];
        let (header, planes) = match packet {
            // Stream-level config carries no picture.
            Packet::ParameterSet { .. } => continue,
            Packet::Frame { header, planes } => (header, planes),
        };
        if header.width > params.max_width || header.height > params.max_height {
            return Err(CodecError::OversizedPicture {
                width: header.width,
                height: header.height,
                max_width: params.max_width,
                max_height: params.max_height,
            });
        }
        let surf = client.get_buf_surface(
            header.width,
            header.height,
            params.color_format,
            params.surf_timeout,
        )?;
        fill_surface(&surf, &planes)?;
        surf.set_filled(1);
        shared.outstanding.lock().push(surf.downgrade());
        client.on_frame(surf, pts);
    }
    Ok(())
}

/// Copies tightly packed planes into image 0 of `surf`, applying strides.
fn fill_surface(surf: &Surface, planes: &[Vec<u8>]) -> CodecResult<()> {
    let layout = surf.layout().clone();
    if planes.len() != layout.planes.len() {
        return Err(CodecError::CorruptStream("plane count mismatch"));
    }
    for (idx, packed) in planes.iter().enumerate() {
        let plane = layout.planes[idx];
        let rows = plane.height as usize;
        if rows == 0 || packed.len() % rows != 0 {
            return Err(CodecError::CorruptStream("plane size mismatch"));
        }
        let row_bytes = packed.len() / rows;
        if row_bytes > plane.stride {
            return Err(CodecError::CorruptStream("row exceeds destination stride"));
        }
        // Stage the strided plane host side, then push it in one copy.
        let mut staged = vec![0u8; plane.stride * rows];
        for row in 0..rows {
            staged[row * plane.stride..row * plane.stride + row_bytes]
                .copy_from_slice(&packed[row * row_bytes..(row + 1) * row_bytes]);
        }
        device::mem::copy_h2d(surf.plane_dev_ptr(0, idx)?, &staged)?;
    }
    Ok(())
}

impl Drop for Decoder {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
        // Block until the client released every delivered surface, or the
        // client explicitly aborted.
        loop {
            if self.shared.aborted.load(Ordering::Acquire) {
                break;
            }
            let mut outstanding = self.shared.outstanding.lock();
            outstanding.retain(SurfaceWeak::alive);
            if outstanding.is_empty() {
                break;
            }
            drop(outstanding);
            std::thread::sleep(Duration::from_micros(200));
        }
    }
}
