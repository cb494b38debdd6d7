//! Per-session performance counters.
//!
//! Counters accumulate per tag and in aggregate: request and unit counts,
//! a running latency min/max/total, and rolling request- and
//! unit-throughput over the last two seconds. Snapshots are published
//! through an `ArcSwap` so the perf reporter and API readers never contend
//! with the engine workers' record path.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

/// Width of the rolling throughput window.
pub(crate) const ROLLING_WINDOW: Duration = Duration::from_secs(2);

/// Point-in-time statistics of one tag or the whole session.
#[derive(Debug, Clone, Default)]
pub struct PerfStats {
    pub request_count: u64,
    pub unit_count: u64,
    pub latency_min_ms: f64,
    pub latency_max_ms: f64,
    pub latency_total_ms: f64,
    /// Requests per second over the rolling window.
    pub rps: f64,
    /// Units per second over the rolling window.
    pub ups: f64,
}

impl PerfStats {
    /// Mean response latency in milliseconds.
    pub fn latency_avg_ms(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.latency_total_ms / self.request_count as f64
        }
    }
}

#[derive(Default)]
struct Accum {
    requests: u64,
    units: u64,
    lat_min: Option<f64>,
    lat_max: f64,
    lat_total: f64,
    window: VecDeque<(Instant, u32)>,
}

impl Accum {
    fn record(&mut self, units: u32, latency_ms: f64, now: Instant) {
        self.requests += 1;
        self.units += units as u64;
        self.lat_min = Some(self.lat_min.map_or(latency_ms, |m| m.min(latency_ms)));
        self.lat_max = self.lat_max.max(latency_ms);
        self.lat_total += latency_ms;
        self.window.push_back((now, units));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.window.front() {
            if now.duration_since(at) > ROLLING_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn stats(&mut self, now: Instant) -> PerfStats {
        self.prune(now);
        let secs = ROLLING_WINDOW.as_secs_f64();
        let window_units: u64 = self.window.iter().map(|&(_, u)| u as u64).sum();
        PerfStats {
            request_count: self.requests,
            unit_count: self.units,
            latency_min_ms: self.lat_min.unwrap_or(0.0),
            latency_max_ms: self.lat_max,
            latency_total_ms: self.lat_total,
            rps: self.window.len() as f64 / secs,
            ups: window_units as f64 / secs,
        }
    }
}

/// Published view of a session's counters.
#[derive(Debug, Clone, Default)]
pub struct PerfSnapshot {
    pub aggregate: PerfStats,
    pub per_tag: HashMap<String, PerfStats>,
}

pub(crate) struct PerfCounters {
    aggregate: Mutex<Accum>,
    per_tag: Mutex<HashMap<String, Accum>>,
    snapshot: ArcSwap<PerfSnapshot>,
}

impl PerfCounters {
    pub(crate) fn new() -> Self {
        Self {
            aggregate: Mutex::new(Accum::default()),
            per_tag: Mutex::new(HashMap::new()),
            snapshot: ArcSwap::from_pointee(PerfSnapshot::default()),
        }
    }

    /// Records one delivered response.
    pub(crate) fn record(&self, tag: &str, units: u32, latency_ms: f64) {
        let now = Instant::now();
        self.aggregate.lock().record(units, latency_ms, now);
        self.per_tag
            .lock()
            .entry(tag.to_string())
            .or_default()
            .record(units, latency_ms, now);
    }

    /// Recomputes and publishes a snapshot, returning it.
    pub(crate) fn publish(&self) -> Arc<PerfSnapshot> {
        let now = Instant::now();
        let aggregate = self.aggregate.lock().stats(now);
        let per_tag = self
            .per_tag
            .lock()
            .iter_mut()
            .map(|(tag, accum)| (tag.clone(), accum.stats(now)))
            .collect();
        let snapshot = Arc::new(PerfSnapshot { aggregate, per_tag });
        self.snapshot.store(Arc::clone(&snapshot));
        snapshot
    }

    /// The most recently published snapshot.
    pub(crate) fn latest(&self) -> Arc<PerfSnapshot> {
        self.snapshot.load_full()
    }
}
