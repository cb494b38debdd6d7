//! Inference-server scenarios: batching, ordering, cancellation, timeouts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use infer_server::{
    InferData, InferServer, Observer, Package, SessionDesc, Status, UserData,
};
use parking_lot::Mutex;
use surface::Buffer;

use crate::identity_model;

struct Collector {
    responses: Mutex<Vec<(Status, usize, Option<u64>)>>,
}

impl Collector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(Vec::new()),
        })
    }
}

impl Observer for Collector {
    fn response(&self, status: Status, package: Package, user_data: UserData) {
        let marker = user_data.and_then(|b| b.downcast::<u64>().ok()).map(|b| *b);
        self.responses
            .lock()
            .push((status, package.data.len(), marker));
    }
}

fn tensor_package(tag: &str, items: usize) -> Package {
    let mut package = Package::new(tag);
    for i in 0..items {
        let buf = Buffer::host(8);
        buf.copy_from(&[i as u8; 8]).expect("fill item");
        package.push(InferData::tensor(buf));
    }
    package
}

/// Scenario S3: one 10-item sync request against batch_dim 4 and a 200 ms
/// accumulation window dispatches 4+4 immediately and the trailing 2 on
/// timeout.
#[test]
fn sync_ten_items_split_four_four_two() {
    let server = InferServer::new(0).expect("server");
    let mut desc = SessionDesc::new("s3", identity_model(4, 8));
    desc.batch_timeout = Duration::from_millis(200);
    let session = server.create_sync_session(desc).expect("session");

    let start = Instant::now();
    let (status, response) = server
        .request_sync(&session, tensor_package("t", 10), None)
        .expect("request");
    let elapsed = start.elapsed();

    assert!(status.is_success());
    assert_eq!(response.expect("response").data.len(), 10);
    assert!(
        elapsed >= Duration::from_millis(200),
        "trailing partial batch waits out the window, took {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(2),
        "no second window was waited, took {elapsed:?}"
    );
}

/// Scenario S4: 1000 sequential async requests on one tag come back in
/// submission order.
#[test]
fn thousand_async_requests_in_order() {
    let observer = Collector::new();
    let server = InferServer::new(0).expect("server");
    let mut desc = SessionDesc::new("s4", identity_model(4, 8));
    desc.engine_num = 2;
    desc.batch_timeout = Duration::from_millis(2);
    let session = server
        .create_session(desc, observer.clone())
        .expect("session");

    for i in 0..1000u64 {
        server
            .request(&session, tensor_package("t", 1), Some(Box::new(i)))
            .expect("request");
    }
    server.wait_task_done(&session, "t");

    let responses = observer.responses.lock();
    assert_eq!(responses.len(), 1000);
    let markers: Vec<u64> = responses.iter().map(|r| r.2.expect("marker")).collect();
    assert_eq!(markers, (0..1000).collect::<Vec<_>>());
}

/// Per-tag ordering holds per tag even when tags interleave across a
/// multi-engine session.
#[test]
fn interleaved_tags_keep_their_own_order() {
    let observer = Collector::new();
    let server = InferServer::new(0).expect("server");
    let mut desc = SessionDesc::new("tags", identity_model(4, 8));
    desc.engine_num = 3;
    desc.batch_timeout = Duration::from_millis(2);
    let session = server
        .create_session(desc, observer.clone())
        .expect("session");

    // Marker encodes (tag, seq) as tag * 1000 + seq; package sizes vary to
    // shake the batch builders.
    let mut rng = rand::thread_rng();
    for seq in 0..100u64 {
        for tag in 0..4u64 {
            let items = rand::Rng::gen_range(&mut rng, 1..=3);
            server
                .request(
                    &session,
                    tensor_package(&format!("tag{tag}"), items),
                    Some(Box::new(tag * 1000 + seq)),
                )
                .expect("request");
        }
    }
    for tag in 0..4 {
        server.wait_task_done(&session, &format!("tag{tag}"));
    }

    let responses = observer.responses.lock();
    assert_eq!(responses.len(), 400);
    for tag in 0..4u64 {
        let seqs: Vec<u64> = responses
            .iter()
            .filter_map(|r| r.2)
            .filter(|m| m / 1000 == tag)
            .map(|m| m % 1000)
            .collect();
        assert_eq!(seqs, (0..100).collect::<Vec<_>>(), "tag {tag} reordered");
    }
}

/// Scenario S5: discarding a tag after queueing 20 requests still yields 20
/// responses, each SUCCESS or CANCELED.
#[test]
fn discard_yields_a_response_per_request() {
    let observer = Collector::new();
    let server = InferServer::new(0).expect("server");
    let mut desc = SessionDesc::new("s5", identity_model(4, 8));
    desc.batch_timeout = Duration::from_millis(50);
    let session = server
        .create_session(desc, observer.clone())
        .expect("session");

    for i in 0..20u64 {
        server
            .request(&session, tensor_package("X", 1), Some(Box::new(i)))
            .expect("request");
    }
    server.discard_task(&session, "X");
    server.wait_task_done(&session, "X");

    let responses = observer.responses.lock();
    assert_eq!(responses.len(), 20, "observer callback count equals 20");
    assert!(responses
        .iter()
        .all(|r| r.0.is_success() || r.0 == Status::Canceled));
}

/// Invariant 6: a sync request against an empty window returns within its
/// timeout plus a small epsilon.
#[test]
fn sync_timeout_is_honoured() {
    let server = InferServer::new(0).expect("server");
    let mut desc = SessionDesc::new("timeout", identity_model(4, 8));
    // A window far beyond the request timeout keeps the item queued.
    desc.batch_timeout = Duration::from_secs(10);
    let session = server.create_sync_session(desc).expect("session");

    let start = Instant::now();
    let (status, response) = server
        .request_sync(
            &session,
            tensor_package("t", 1),
            Some(Duration::from_millis(50)),
        )
        .expect("request");
    let elapsed = start.elapsed();

    assert_eq!(status, Status::Timeout);
    assert!(response.is_none(), "late result is discarded");
    assert!(elapsed >= Duration::from_millis(50));
    assert!(
        elapsed < Duration::from_millis(100),
        "returned {elapsed:?} after a 50 ms deadline"
    );
    session.discard_task("t");
}

/// Invariant 7: one isolated dynamic-batch item responds at roughly
/// submit + batch_timeout + execution.
#[test]
fn isolated_item_waits_exactly_one_window() {
    let server = InferServer::new(0).expect("server");
    let mut desc = SessionDesc::new("window", identity_model(4, 8));
    desc.batch_timeout = Duration::from_millis(120);
    let session = server.create_sync_session(desc).expect("session");

    let start = Instant::now();
    let (status, _) = server
        .request_sync(&session, tensor_package("t", 1), None)
        .expect("request");
    let elapsed = start.elapsed();

    assert!(status.is_success());
    assert!(elapsed >= Duration::from_millis(120));
    assert!(
        elapsed < Duration::from_millis(400),
        "response took {elapsed:?} for a 120 ms window"
    );
}

/// Invariant 5: destroying the session first drains every in-flight
/// request and then silences the observer for good.
#[test]
fn destroy_session_drains_then_silences() {
    let observer = Collector::new();
    let server = InferServer::new(0).expect("server");
    let mut desc = SessionDesc::new("drain", identity_model(4, 8));
    desc.batch_timeout = Duration::from_millis(5);
    desc.engine_num = 2;
    let session = server
        .create_session(desc, observer.clone())
        .expect("session");

    for i in 0..200u64 {
        server
            .request(&session, tensor_package("t", 2), Some(Box::new(i)))
            .expect("request");
    }
    server.destroy_session(session);

    let count = observer.responses.lock().len();
    assert_eq!(count, 200, "every request completed before destroy returned");
    assert!(observer
        .responses
        .lock()
        .iter()
        .all(|r| r.0.is_success() || r.0 == Status::Canceled));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(observer.responses.lock().len(), count, "observer is silent");
}

/// A session with the video preprocessor accepts image units and hands the
/// scaled pixels to the model.
#[test]
fn video_preprocessor_feeds_image_units() {
    use model::{DataType, DimOrder, Model, ModelManifest, TensorDesc};
    use surface::ColorFormat;

    let model = Model::from_manifest(ModelManifest {
        name: "video-ident".into(),
        inputs: vec![TensorDesc {
            dims: vec![4, 8, 8, 3],
            dtype: DataType::U8,
            order: DimOrder::Nhwc,
        }],
        outputs: vec![TensorDesc {
            dims: vec![4, 8 * 8 * 3],
            dtype: DataType::U8,
            order: DimOrder::None,
        }],
    })
    .expect("model");

    let server = InferServer::new(0).expect("server");
    let mut desc = SessionDesc::new("video", model);
    desc.batch_timeout = Duration::from_millis(20);
    desc.preproc = Some(Arc::new(stages::VideoPreprocessor::new()));
    desc.model_input_format = ColorFormat::Bgr24;
    let session = server.create_sync_session(desc).expect("session");

    crate::bind_device0();
    let surf = surface::Surface::alloc(&surface::SurfaceDesc {
        batch: 1,
        width: 16,
        height: 16,
        format: ColorFormat::Bgr24,
        alignment: 64,
        mem_kind: surface::MemKind::PinnedHost,
        device_id: 0,
    })
    .expect("surface");
    {
        let mut map = surf.map_host().expect("map");
        for px in map.bytes_mut().chunks_exact_mut(3) {
            px.copy_from_slice(&[11, 22, 33]);
        }
    }
    surf.sync_to_device().expect("sync");

    let mut package = Package::new("t");
    package.push(InferData::image(surf));
    let (status, response) = server
        .request_sync(&session, package, Some(Duration::from_secs(2)))
        .expect("request");
    assert!(status.is_success());
    let response = response.expect("response");
    match &response.data[0].value {
        infer_server::InferValue::Tensor(out) => {
            let mut bytes = vec![0u8; out.len()];
            out.copy_to(&mut bytes).expect("read");
            assert_eq!(&bytes[..3], &[11, 22, 33], "scaled pixels reached the model");
        }
        _ => panic!("expected a raw output tensor"),
    }
}

/// Higher-priority packages overtake lower ones at dispatch time.
#[test]
fn priority_overtakes_at_dispatch() {
    let observer = Collector::new();
    let server = InferServer::new(0).expect("server");
    let mut desc = SessionDesc::new("prio", identity_model(1, 8));
    desc.batch_timeout = Duration::from_millis(1);
    let session = server
        .create_session(desc, observer.clone())
        .expect("session");

    // Flood the queue with low-priority work, then inject one high package.
    for i in 0..200u64 {
        let mut package = tensor_package("low", 1);
        package.priority = Some(0);
        server
            .request(&session, package, Some(Box::new(i)))
            .expect("request");
    }
    let mut urgent = tensor_package("high", 1);
    urgent.priority = Some(9);
    server
        .request(&session, urgent, Some(Box::new(9999)))
        .expect("urgent request");
    server.wait_task_done(&session, "low");
    server.wait_task_done(&session, "high");

    let responses = observer.responses.lock();
    let position = responses
        .iter()
        .position(|r| r.2 == Some(9999))
        .expect("urgent completed");
    assert!(
        position < 150,
        "urgent response arrived near last ({position} of {})",
        responses.len()
    );
}
