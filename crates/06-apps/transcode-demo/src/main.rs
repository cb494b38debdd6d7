//! End-to-end demo: synthetic compressed streams through
//! decode → inference → OSD → encode, with a per-stream packet summary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use codec::{CodecType, FrameHeader, VdecCreateParams, VencCreateParams};
use infer_server::SessionDesc;
use model::{DataType, DimOrder, Model, ModelManifest, TensorDesc};
use parking_lot::Mutex;
use pipeline::Pipeline;
use stages::{ClassifyPostprocessor, DecodeStage, EncodeStage, InferStage, OsdStage, PacketSink, PacketSource};
use surface::ColorFormat;

#[derive(Parser)]
#[command(about = "Transcode demo over the software device runtime")]
struct Args {
    /// Number of concurrent streams.
    #[arg(long, default_value_t = 2)]
    streams: u32,
    /// Frames per stream.
    #[arg(long, default_value_t = 30)]
    frames: u64,
    /// Picture width.
    #[arg(long, default_value_t = 320)]
    width: u32,
    /// Picture height.
    #[arg(long, default_value_t = 240)]
    height: u32,
    /// Device to run on.
    #[arg(long, default_value_t = 0)]
    device: u32,
}

/// Generates a BGR gradient "bitstream" of `frames` pictures.
struct SyntheticSource {
    width: u32,
    height: u32,
    frames: u64,
    next: AtomicU64,
}

impl PacketSource for SyntheticSource {
    fn next_packet(&self) -> Option<(Vec<u8>, u64)> {
        let idx = self.next.fetch_add(1, Ordering::SeqCst);
        if idx >= self.frames {
            return None;
        }
        let mut pixels = vec![0u8; (self.width * self.height * 3) as usize];
        for (at, px) in pixels.chunks_exact_mut(3).enumerate() {
            let x = at as u32 % self.width;
            let y = at as u32 / self.width;
            px[0] = (x + idx as u32) as u8;
            px[1] = (y + idx as u32) as u8;
            px[2] = idx as u8;
        }
        let bits = codec::pack_frame(
            FrameHeader {
                width: self.width,
                height: self.height,
                format: ColorFormat::Bgr24,
            },
            &[&pixels],
        );
        Some((bits, idx * 33))
    }
}

#[derive(Default)]
struct StreamTally {
    packets: u64,
    bytes: u64,
    keyframes: u64,
    first_pts: Option<u64>,
    last_pts: u64,
    eos: bool,
}

#[derive(Default)]
struct CollectSink {
    streams: Mutex<std::collections::HashMap<u32, StreamTally>>,
}

impl PacketSink for CollectSink {
    fn on_packet(&self, stream_id: u32, data: &[u8], pts: u64, keyframe: bool) {
        let mut streams = self.streams.lock();
        let tally = streams.entry(stream_id).or_default();
        tally.packets += 1;
        tally.bytes += data.len() as u64;
        tally.keyframes += keyframe as u64;
        tally.first_pts.get_or_insert(pts);
        tally.last_pts = pts;
    }

    fn on_eos(&self, stream_id: u32) {
        self.streams.lock().entry(stream_id).or_default().eos = true;
    }
}

fn classify_model(width: u32, height: u32) -> Result<Arc<Model>> {
    Model::from_manifest(ModelManifest {
        name: "demo-classify".into(),
        inputs: vec![TensorDesc {
            dims: vec![4, (width * height * 3) as usize],
            dtype: DataType::U8,
            order: DimOrder::None,
        }],
        outputs: vec![TensorDesc {
            dims: vec![4, 8],
            dtype: DataType::F32,
            order: DimOrder::None,
        }],
    })
    .context("building demo model")
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let model = classify_model(args.width, args.height)?;
    let mut session_desc = SessionDesc::new("demo", Arc::clone(&model));
    session_desc.engine_num = 2;
    session_desc.batch_timeout = std::time::Duration::from_millis(30);
    session_desc.show_perf = true;
    session_desc.postproc = Some(Arc::new(ClassifyPostprocessor::new(0.0)));
    session_desc.model_input_format = ColorFormat::Bgr24;

    let sink = Arc::new(CollectSink::default());
    let infer = InferStage::new("infer", args.device, session_desc);

    let mut pipe = Pipeline::new();
    for stream_id in 0..args.streams {
        pipe.add_source(DecodeStage::new(
            format!("decode-{stream_id}"),
            stream_id,
            VdecCreateParams {
                device_id: args.device,
                codec: CodecType::H264,
                max_width: args.width,
                max_height: args.height,
                frame_buf_num: 8,
                color_format: ColorFormat::Bgr24,
                surf_timeout: std::time::Duration::from_secs(5),
            },
            8,
            Arc::new(SyntheticSource {
                width: args.width,
                height: args.height,
                frames: args.frames,
                next: AtomicU64::new(0),
            }),
        ))
        .map_err(|err| anyhow::anyhow!("add decode: {err}"))?;
    }
    pipe.add_module(infer.clone())
        .map_err(|err| anyhow::anyhow!("add infer: {err}"))?;
    pipe.add_module(OsdStage::new("osd", args.device, args.streams.max(1) as usize))
        .map_err(|err| anyhow::anyhow!("add osd: {err}"))?;
    pipe.add_module(EncodeStage::new(
        "encode",
        VencCreateParams {
            device_id: args.device,
            codec: CodecType::H264,
            width: args.width,
            height: args.height,
            frame_rate: 30,
            bit_rate: 4_000_000,
            gop_size: 30,
            pixel_format: ColorFormat::Bgr24,
        },
        args.streams.max(1) as usize,
        sink.clone(),
    ))
    .map_err(|err| anyhow::anyhow!("add encode: {err}"))?;

    for stream_id in 0..args.streams {
        pipe.add_link(&format!("decode-{stream_id}"), "infer")
            .map_err(|err| anyhow::anyhow!("link decode: {err}"))?;
    }
    pipe.add_link("infer", "osd")
        .map_err(|err| anyhow::anyhow!("link infer: {err}"))?;
    pipe.add_link("osd", "encode")
        .map_err(|err| anyhow::anyhow!("link osd: {err}"))?;

    let started = std::time::Instant::now();
    pipe.start().map_err(|err| anyhow::anyhow!("start: {err}"))?;
    pipe.wait_for_stop();
    let elapsed = started.elapsed();
    let perf = infer.perf();

    println!(
        "transcoded {} streams x {} frames ({}x{}) in {:.2}s",
        args.streams,
        args.frames,
        args.width,
        args.height,
        elapsed.as_secs_f64()
    );
    let streams = sink.streams.lock();
    let mut ids: Vec<_> = streams.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        let tally = &streams[&id];
        println!(
            "  stream {id}: {} packets, {} bytes, {} keyframes, pts {}..{}, eos={}",
            tally.packets,
            tally.bytes,
            tally.keyframes,
            tally.first_pts.unwrap_or(0),
            tally.last_pts,
            tally.eos
        );
    }
    if let Some(snapshot) = perf {
        println!(
            "  inference: {} requests, {} units, latency avg {:.2} ms",
            snapshot.aggregate.request_count,
            snapshot.aggregate.unit_count,
            snapshot.aggregate.latency_avg_ms()
        );
    }
    Ok(())
}
