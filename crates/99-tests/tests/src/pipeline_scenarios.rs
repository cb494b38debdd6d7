//! Pipeline scenarios over real decoded frames: stream separation, worker
//! pinning, EOS completeness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use codec::{pack_frame, CodecType, FrameHeader, VdecCreateParams};
use parking_lot::Mutex;
use pipeline::{Flow, Frame, Module, Pipeline, PipelineResult, Transmitter};
use stages::{DecodeStage, PacketSource};
use surface::ColorFormat;

struct RawFrameSource {
    width: u32,
    height: u32,
    frames: u64,
    next: AtomicU64,
}

impl RawFrameSource {
    fn new(width: u32, height: u32, frames: u64) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            frames,
            next: AtomicU64::new(0),
        })
    }
}

impl PacketSource for RawFrameSource {
    fn next_packet(&self) -> Option<(Vec<u8>, u64)> {
        let idx = self.next.fetch_add(1, Ordering::SeqCst);
        if idx >= self.frames {
            return None;
        }
        let y = vec![idx as u8; (self.width * self.height) as usize];
        let uv = vec![0x80; (self.width * self.height / 2) as usize];
        let bits = pack_frame(
            FrameHeader {
                width: self.width,
                height: self.height,
                format: ColorFormat::Nv12,
            },
            &[&y, &uv],
        );
        Some((bits, idx * 33))
    }
}

fn vdec_params(width: u32, height: u32) -> VdecCreateParams {
    VdecCreateParams {
        device_id: 0,
        codec: CodecType::H264,
        max_width: width,
        max_height: height,
        frame_buf_num: 8,
        color_format: ColorFormat::Nv12,
        surf_timeout: Duration::from_secs(5),
    }
}

#[derive(Default)]
struct SinkState {
    counts: HashMap<u32, u64>,
    eos: HashMap<u32, u64>,
    threads: HashMap<u32, ThreadId>,
    pinned: bool,
    ordered: bool,
    last_idx: HashMap<u32, u64>,
}

struct CountingSink {
    name: String,
    parallelism: usize,
    state: Mutex<SinkState>,
}

impl CountingSink {
    fn new(name: &str, parallelism: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            parallelism,
            state: Mutex::new(SinkState {
                pinned: true,
                ordered: true,
                ..SinkState::default()
            }),
        })
    }
}

impl Module for CountingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn parallelism(&self) -> usize {
        self.parallelism
    }

    fn process(&self, frame: Option<Frame>, _tx: &Transmitter) -> PipelineResult<Flow> {
        let frame = frame.expect("sink receives frames");
        let mut state = self.state.lock();
        if frame.eos {
            *state.eos.entry(frame.stream_id).or_insert(0) += 1;
            return Ok(Flow::Continue);
        }
        assert!(frame.surface.is_some(), "data frames carry a surface");
        *state.counts.entry(frame.stream_id).or_insert(0) += 1;
        let thread = std::thread::current().id();
        match state.threads.get(&frame.stream_id) {
            Some(&seen) if seen != thread => state.pinned = false,
            None => {
                state.threads.insert(frame.stream_id, thread);
            }
            _ => {}
        }
        if let Some(&last) = state.last_idx.get(&frame.stream_id) {
            if frame.frame_idx <= last {
                state.ordered = false;
            }
        }
        state.last_idx.insert(frame.stream_id, frame.frame_idx);
        Ok(Flow::Continue)
    }

    fn close(&self) {}
}

/// Scenario S2: two decoded 5-frame streams land separated, ordered and
/// pinned at a two-worker sink, with one EOS marker each.
#[test]
fn two_streams_counted_ordered_and_pinned() {
    let sink = CountingSink::new("sink", 2);
    let mut pipe = Pipeline::new();
    for stream_id in 0..2 {
        pipe.add_source(DecodeStage::new(
            format!("decode-{stream_id}"),
            stream_id,
            vdec_params(64, 32),
            4,
            RawFrameSource::new(64, 32, 5),
        ))
        .expect("add source");
    }
    pipe.add_module(sink.clone()).expect("add sink");
    pipe.add_link("decode-0", "sink").expect("link 0");
    pipe.add_link("decode-1", "sink").expect("link 1");
    pipe.start().expect("start");
    pipe.wait_for_stop();

    let state = sink.state.lock();
    assert_eq!(state.counts.get(&0), Some(&5));
    assert_eq!(state.counts.get(&1), Some(&5));
    assert_eq!(state.eos.get(&0), Some(&1), "stream 0 EOS exactly once");
    assert_eq!(state.eos.get(&1), Some(&1), "stream 1 EOS exactly once");
    assert!(state.pinned, "frames of one stream share a worker thread");
    assert!(state.ordered, "per-stream frame order preserved");
}

/// Invariant 4 at scale: every injected EOS reaches the sink exactly once,
/// even with many short streams.
#[test]
fn eos_reaches_the_sink_for_every_stream() {
    const STREAMS: u32 = 6;
    let sink = CountingSink::new("sink", 3);
    let mut pipe = Pipeline::new();
    for stream_id in 0..STREAMS {
        pipe.add_source(DecodeStage::new(
            format!("decode-{stream_id}"),
            stream_id,
            vdec_params(64, 32),
            4,
            RawFrameSource::new(64, 32, 3),
        ))
        .expect("add source");
    }
    pipe.add_module(sink.clone()).expect("add sink");
    for stream_id in 0..STREAMS {
        pipe.add_link(&format!("decode-{stream_id}"), "sink")
            .expect("link");
    }
    pipe.start().expect("start");
    pipe.wait_for_stop();

    let state = sink.state.lock();
    for stream_id in 0..STREAMS {
        assert_eq!(state.counts.get(&stream_id), Some(&3));
        assert_eq!(state.eos.get(&stream_id), Some(&1));
    }
}

/// A resize stage between decode and sink rescales every frame.
#[test]
fn resize_stage_rescales_decoded_frames() {
    struct DimCheck {
        seen: Mutex<Vec<(u32, u32, u8)>>,
    }
    impl Module for DimCheck {
        fn name(&self) -> &str {
            "dim-check"
        }
        fn process(&self, frame: Option<Frame>, _tx: &Transmitter) -> PipelineResult<Flow> {
            let frame = frame.expect("frames");
            if let Some(surf) = &frame.surface {
                crate::bind_device0();
                surf.sync_to_host().expect("sync");
                let map = surf.map_host().expect("map");
                let desc = surf.desc();
                self.seen
                    .lock()
                    .push((desc.width, desc.height, map.bytes()[0]));
            }
            Ok(Flow::Continue)
        }
        fn close(&self) {}
    }

    let check = Arc::new(DimCheck {
        seen: Mutex::new(Vec::new()),
    });
    let mut pipe = Pipeline::new();
    pipe.add_source(DecodeStage::new(
        "decode",
        0,
        vdec_params(64, 32),
        4,
        RawFrameSource::new(64, 32, 3),
    ))
    .expect("add source");
    pipe.add_module(stages::ResizeStage::new("resize", 0, 32, 16, 4, 1))
        .expect("add resize");
    pipe.add_module(check.clone()).expect("add check");
    pipe.add_link("decode", "resize").expect("link decode");
    pipe.add_link("resize", "dim-check").expect("link resize");
    pipe.start().expect("start");
    pipe.wait_for_stop();

    let seen = check.seen.lock();
    assert_eq!(seen.len(), 3);
    for (idx, &(width, height, luma)) in seen.iter().enumerate() {
        assert_eq!((width, height), (32, 16), "frame {idx} rescaled");
        assert_eq!(luma, idx as u8, "frame {idx} kept its luma seed");
    }
}

/// Decoded pixel content survives the trip through the pipeline.
#[test]
fn decoded_content_reaches_the_sink() {
    struct PixelCheck {
        state: Mutex<Vec<u8>>,
    }
    impl Module for PixelCheck {
        fn name(&self) -> &str {
            "pixel-check"
        }
        fn process(&self, frame: Option<Frame>, _tx: &Transmitter) -> PipelineResult<Flow> {
            let frame = frame.expect("frames");
            if let Some(surf) = &frame.surface {
                crate::bind_device0();
                surf.sync_to_host().expect("sync");
                let map = surf.map_host().expect("map");
                self.state.lock().push(map.bytes()[0]);
            }
            Ok(Flow::Continue)
        }
        fn close(&self) {}
    }

    let check = Arc::new(PixelCheck {
        state: Mutex::new(Vec::new()),
    });
    let mut pipe = Pipeline::new();
    pipe.add_source(DecodeStage::new(
        "decode",
        0,
        vdec_params(64, 32),
        4,
        RawFrameSource::new(64, 32, 4),
    ))
    .expect("add source");
    pipe.add_module(check.clone()).expect("add check");
    pipe.add_link("decode", "pixel-check").expect("link");
    pipe.start().expect("start");
    pipe.wait_for_stop();

    assert_eq!(*check.state.lock(), vec![0, 1, 2, 3], "luma seeds in order");
}
