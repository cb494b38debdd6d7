//! Surface pool scenarios: exhaustion, timeouts, reference conservation.

use std::time::Duration;

use surface::{ColorFormat, MemKind, SurfaceDesc, SurfaceError, SurfacePool};

fn pool_desc() -> SurfaceDesc {
    SurfaceDesc {
        batch: 1,
        width: 128,
        height: 64,
        format: ColorFormat::Nv12,
        alignment: 64,
        mem_kind: MemKind::Device,
        device_id: 0,
    }
}

/// Scenario S6: six holders exhaust a six-deep pool; the seventh request
/// fails fast, and succeeds once a holder releases.
#[test]
fn six_holders_starve_the_seventh() {
    let pool = SurfacePool::new(&pool_desc(), 6).expect("pool");
    let mut held: Vec<_> = (0..6).map(|_| pool.request()).collect();
    assert_eq!(pool.available(), 0);

    let err = pool
        .request_timeout(Duration::from_millis(10))
        .unwrap_err();
    assert!(matches!(err, SurfaceError::Unavailable { .. }));

    let releaser = {
        let surf = held.pop().expect("one holder");
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(surf);
        })
    };
    pool.request_timeout(Duration::from_millis(1000))
        .expect("request succeeds after a release");
    releaser.join().expect("join");
}

/// Invariant 3: every request takes a slot; the last unref of a surface
/// puts its slot back within a bounded delay.
#[test]
fn references_are_conserved() {
    let pool = SurfacePool::new(&pool_desc(), 4).expect("pool");
    let surf = pool.request();
    assert!(pool.available() < 4, "request consumed a slot");

    let also_held = surf.clone();
    drop(surf);
    assert_eq!(pool.available(), 3, "a live ref still pins the slot");

    drop(also_held);
    let deadline = std::time::Instant::now() + Duration::from_millis(100);
    while pool.available() != 4 {
        assert!(
            std::time::Instant::now() < deadline,
            "slot did not return after the last unref"
        );
        std::thread::yield_now();
    }
}

/// Many threads cycling surfaces through one pool leave it exactly full.
#[test]
fn concurrent_churn_reconciles() {
    use std::sync::Arc;
    let pool = Arc::new(SurfacePool::new(&pool_desc(), 4).expect("pool"));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let surf = pool.request();
                    surf.set_filled(1);
                    drop(surf);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("join");
    }
    assert_eq!(pool.available(), 4, "all slots reconciled after the churn");
}
