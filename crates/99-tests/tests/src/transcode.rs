//! Scenario S1: decode → identity inference → encode for one 10-frame
//! 1080p stream. Ten packets come out, the first carries the stream
//! header, pts survives untouched, and the pixels round-trip.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use codec::{
    pack_frame, parse_packet, CodecType, FrameHeader, Packet, VdecCreateParams, VencCreateParams,
};
use infer_server::SessionDesc;
use parking_lot::Mutex;
use pipeline::Pipeline;
use stages::{DecodeStage, EncodeStage, InferStage, PacketSink, PacketSource};
use surface::ColorFormat;

use crate::identity_model;

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;
const FRAMES: u64 = 10;

struct Source1080p {
    next: AtomicU64,
}

impl PacketSource for Source1080p {
    fn next_packet(&self) -> Option<(Vec<u8>, u64)> {
        let idx = self.next.fetch_add(1, Ordering::SeqCst);
        if idx >= FRAMES {
            return None;
        }
        let y = vec![idx as u8 + 1; (WIDTH * HEIGHT) as usize];
        let uv = vec![0x80; (WIDTH * HEIGHT / 2) as usize];
        let bits = pack_frame(
            FrameHeader {
                width: WIDTH,
                height: HEIGHT,
                format: ColorFormat::Nv12,
            },
            &[&y, &uv],
        );
        Some((bits, idx * 33))
    }
}

struct PacketRecord {
    pts: u64,
    has_header: bool,
    first_luma: u8,
}

#[derive(Default)]
struct RecordingSink {
    packets: Mutex<Vec<PacketRecord>>,
    eos: AtomicU64,
}

impl PacketSink for RecordingSink {
    fn on_packet(&self, _stream_id: u32, data: &[u8], pts: u64, _keyframe: bool) {
        let (first, consumed) = parse_packet(data).expect("parse packet");
        let (has_header, frame) = match first {
            Packet::ParameterSet { .. } => {
                let (second, _) = parse_packet(&data[consumed..]).expect("picture after header");
                (true, second)
            }
            frame => (false, frame),
        };
        let first_luma = match frame {
            Packet::Frame { planes, .. } => planes[0][0],
            Packet::ParameterSet { .. } => panic!("picture record expected"),
        };
        self.packets.lock().push(PacketRecord {
            pts,
            has_header,
            first_luma,
        });
    }

    fn on_eos(&self, _stream_id: u32) {
        self.eos.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn ten_frame_transcode_roundtrip() {
    let sink = Arc::new(RecordingSink::default());
    let surface_bytes = (WIDTH * HEIGHT * 3 / 2) as usize;
    let mut desc = SessionDesc::new("transcode", identity_model(4, surface_bytes));
    desc.batch_timeout = Duration::from_millis(30);
    desc.engine_num = 2;

    let mut pipe = Pipeline::new();
    pipe.add_source(DecodeStage::new(
        "decode",
        0,
        VdecCreateParams {
            device_id: 0,
            codec: CodecType::H264,
            max_width: WIDTH,
            max_height: HEIGHT,
            frame_buf_num: 6,
            color_format: ColorFormat::Nv12,
            surf_timeout: Duration::from_secs(10),
        },
        6,
        Arc::new(Source1080p {
            next: AtomicU64::new(0),
        }),
    ))
    .expect("add decode");
    pipe.add_module(InferStage::new("infer", 0, desc))
        .expect("add infer");
    pipe.add_module(EncodeStage::new(
        "encode",
        VencCreateParams {
            device_id: 0,
            codec: CodecType::H264,
            width: WIDTH,
            height: HEIGHT,
            frame_rate: 30,
            bit_rate: 8_000_000,
            gop_size: 30,
            pixel_format: ColorFormat::Nv12,
        },
        1,
        sink.clone(),
    ))
    .expect("add encode");
    pipe.add_link("decode", "infer").expect("link decode");
    pipe.add_link("infer", "encode").expect("link infer");

    pipe.start().expect("start");
    pipe.wait_for_stop();

    let packets = sink.packets.lock();
    assert_eq!(packets.len(), FRAMES as usize, "one packet per frame");
    assert!(packets[0].has_header, "first packet carries the stream header");
    assert!(
        packets[1..].iter().all(|p| !p.has_header),
        "header appears only once"
    );
    let pts: Vec<u64> = packets.iter().map(|p| p.pts).collect();
    assert_eq!(
        pts,
        (0..FRAMES).map(|i| i * 33).collect::<Vec<_>>(),
        "pts equals input pts"
    );
    for (idx, packet) in packets.iter().enumerate() {
        assert_eq!(
            packet.first_luma,
            idx as u8 + 1,
            "pixels round-trip through the identity model"
        );
    }
    assert_eq!(sink.eos.load(Ordering::SeqCst), 1, "encoder delivered EOS");
}
