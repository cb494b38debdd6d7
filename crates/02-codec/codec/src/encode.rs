//! Encoder instances.
//!
//! The encoder mirrors the decode protocol: surfaces go in through
//! [`Encoder::send_frame`], compressed packets come back through
//! [`EncodeClient::on_packet`] on the dispatcher thread. Packet bytes are
//! valid only inside the callback and must be consumed or copied before
//! returning. The first packet of a stream carries the parameter set in
//! front of the first picture.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use device::{DeviceContext, DeviceId};
use surface::{ColorFormat, Surface};

use crate::bitstream::{pack_frame, pack_parameter_set, FrameHeader};
use crate::error::{CodecError, CodecResult};
use crate::CodecType;

/// Parameters for creating an encoder instance.
#[derive(Debug, Clone, Copy)]
pub struct VencCreateParams {
    pub device_id: DeviceId,
    pub codec: CodecType,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bit_rate: u32,
    pub gop_size: u32,
    pub pixel_format: ColorFormat,
}

/// One encoded packet, borrowed for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct EncodedPacket<'a> {
    pub data: &'a [u8],
    pub pts: u64,
    pub keyframe: bool,
}

/// Client half of the encode protocol.
pub trait EncodeClient: Send + Sync + 'static {
    /// Delivers one encoded packet; `pkt.data` must not be retained.
    fn on_packet(&self, pkt: &EncodedPacket<'_>);

    /// Delivers the end-of-stream marker exactly once.
    fn on_eos(&self);

    /// Reports a terminal encoder error.
    fn on_error(&self, err: CodecError);
}

enum EncCmd {
    Frame(Surface, u64),
    Eos,
}

/// An encoder instance.
pub struct Encoder {
    tx: Option<Sender<EncCmd>>,
    dispatcher: Option<JoinHandle<()>>,
    failed: Arc<AtomicBool>,
    eos_queued: AtomicBool,
}

const ENCODE_QUEUE_DEPTH: usize = 8;

impl Encoder {
    /// Creates an encoder and its dispatcher thread.
    pub fn new(params: VencCreateParams, client: Arc<dyn EncodeClient>) -> CodecResult<Self> {
        if params.width == 0 || params.height == 0 {
            return Err(CodecError::InvalidParam("zero picture size"));
        }
        if params.gop_size == 0 {
            return Err(CodecError::InvalidParam("zero gop size"));
        }
        let ctx = DeviceContext::new(params.device_id)?;
        let (tx, rx) = bounded::<EncCmd>(ENCODE_QUEUE_DEPTH);
        let failed = Arc::new(AtomicBool::new(false));
        let failed_worker = Arc::clone(&failed);
        let dispatcher = std::thread::Builder::new()
            .name(format!("venc-{}", params.device_id))
            .spawn(move || {
                if let Err(err) = ctx.bind() {
                    failed_worker.store(true, Ordering::Release);
                    client.on_error(err.into());
                    return;
                }
                let mut frame_idx = 0u64;
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        EncCmd::Frame(surf, pts) => {
                            match encode_one(&params, &surf, frame_idx) {
                                Ok((data, keyframe)) => {
                                    client.on_packet(&EncodedPacket {
                                        data: &data,
                                        pts,
                                        keyframe,
                                    });
                                    frame_idx += 1;
                                }
                                Err(err) => {
                                    log::error!("[Codec] [Encode] terminal error: {err}");
                                    failed_worker.store(true, Ordering::Release);
                                    client.on_error(err);
                                    return;
                                }
                            }
                        }
                        EncCmd::Eos => {
                            client.on_eos();
                            return;
                        }
                    }
                }
            })
            .expect("spawn encoder dispatcher");
        Ok(Self {
            tx: Some(tx),
            dispatcher: Some(dispatcher),
            failed,
            eos_queued: AtomicBool::new(false),
        })
    }

    /// Submits one surface for encoding. The encoder holds a reference until
    /// the packet is delivered.
    pub fn send_frame(&self, surf: &Surface, pts: u64) -> CodecResult<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(CodecError::Terminal);
        }
        if self.eos_queued.load(Ordering::Acquire) {
            return Err(CodecError::AfterEos);
        }
        let tx = self.tx.as_ref().ok_or(CodecError::Terminal)?;
        tx.send(EncCmd::Frame(surf.clone(), pts))
            .map_err(|_| CodecError::Terminal)
    }

    /// Queues the end-of-stream marker; `on_eos` fires after queued frames.
    pub fn send_eos(&self) -> CodecResult<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(CodecError::Terminal);
        }
        if self.eos_queued.swap(true, Ordering::AcqRel) {
            return Err(CodecError::AfterEos);
        }
        let tx = self.tx.as_ref().ok_or(CodecError::Terminal)?;
        tx.send(EncCmd::Eos).map_err(|_| CodecError::Terminal)
    }
}

fn encode_one(
    params: &VencCreateParams,
    surf: &Surface,
    frame_idx: u64,
) -> CodecResult<(Vec<u8>, bool)> {
    let desc = surf.desc();
    if desc.format != params.pixel_format {
        return Err(CodecError::InvalidParam("surface format mismatch"));
    }
    if desc.width != params.width || desc.height != params.height {
        return Err(CodecError::InvalidParam("surface size mismatch"));
    }
    let layout = surf.layout().clone();
    let sample_bytes = params.pixel_format.luma_bytes();
    let mut planes: Vec<Vec<u8>> = Vec::with_capacity(layout.planes.len());
    for (idx, plane) in layout.planes.iter().enumerate() {
        let rows = plane.height as usize;
        let row_bytes = plane.width as usize * sample_bytes;
        let mut staged = vec![0u8; plane.stride * rows];
        device::mem::copy_d2h(&mut staged, surf.plane_dev_ptr(0, idx)?)?;
        let mut packed = vec![0u8; row_bytes * rows];
        for row in 0..rows {
            packed[row * row_bytes..(row + 1) * row_bytes]
                .copy_from_slice(&staged[row * plane.stride..row * plane.stride + row_bytes]);
        }
        planes.push(packed);
    }
    let plane_refs: Vec<&[u8]> = planes.iter().map(Vec::as_slice).collect();
    let frame_bits = pack_frame(
        FrameHeader {
            width: params.width,
            height: params.height,
            format: params.pixel_format,
        },
        &plane_refs,
    );
    let keyframe = frame_idx % params.gop_size as u64 == 0;
    if frame_idx == 0 {
        // The stream header travels in front of the first picture.
        let mut data = pack_parameter_set(
            params.width,
            params.height,
            params.pixel_format,
            params.frame_rate,
            params.bit_rate,
            params.gop_size,
        );
        data.extend_from_slice(&frame_bits);
        Ok((data, keyframe))
    } else {
        Ok((frame_bits, keyframe))
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
    }
}
