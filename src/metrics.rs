//! Metrics aggregator — rolling per-server samples and global counters
//!
//! Keeps a bounded sliding window of response-time samples per server plus
//! aggregate counters. A fixed-interval tick recomputes the derived
//! requests-per-second gauge independent of request volume. Health-based
//! selection reads exclusively from here.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

/// Response-time samples retained per server
const SAMPLE_WINDOW: usize = 100;

/// Derived per-server view consumed by health-based selection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServerMetrics {
    /// Average response time over the sample window, in milliseconds
    pub avg_response_ms: f64,
    /// Errors divided by requests (0.0 when no requests yet)
    pub error_rate: f64,
    /// Samples currently in the window
    pub sample_count: usize,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self {
            avg_response_ms: 0.0,
            error_rate: 0.0,
            sample_count: 0,
        }
    }
}

/// Aggregate point-in-time snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    /// Requests recorded since start
    pub total_requests: u64,
    /// Completed responses since start
    pub total_responses: u64,
    /// Failed responses since start
    pub total_errors: u64,
    /// Requests per second, recomputed on the last tick
    pub requests_per_second: f64,
    /// Average response time across all servers, in milliseconds
    pub avg_response_ms: f64,
}

#[derive(Debug, Default)]
struct ServerWindow {
    samples: VecDeque<u64>,
    requests: u64,
    errors: u64,
}

impl ServerWindow {
    fn push(&mut self, latency_ms: u64, failed: bool) {
        self.requests += 1;
        if failed {
            self.errors += 1;
        }
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    fn metrics(&self) -> ServerMetrics {
        let avg = if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
        };
        let error_rate = if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64
        };
        ServerMetrics {
            avg_response_ms: avg,
            error_rate,
            sample_count: self.samples.len(),
        }
    }
}

/// Rolling metrics store
pub struct MetricsAggregator {
    total_requests: AtomicU64,
    total_responses: AtomicU64,
    total_errors: AtomicU64,
    per_server: RwLock<HashMap<String, ServerWindow>>,
    // rps stored as f64 bits so reads stay lock-free
    requests_per_second: AtomicU64,
    last_tick: RwLock<Option<(Instant, u64)>>,
}

impl MetricsAggregator {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_responses: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            per_server: RwLock::new(HashMap::new()),
            requests_per_second: AtomicU64::new(0f64.to_bits()),
            last_tick: RwLock::new(None),
        }
    }

    /// Create the tracking entry for a new server
    pub fn register(&self, server_id: &str) {
        self.per_server
            .write()
            .unwrap()
            .entry(server_id.to_string())
            .or_default();
    }

    /// Drop tracking for a removed server
    pub fn remove(&self, server_id: &str) {
        self.per_server.write().unwrap().remove(server_id);
    }

    /// Count an accepted request (before dispatch)
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed response for a server
    pub fn record_response(&self, server_id: &str, latency_ms: u64, failed: bool) {
        self.total_responses.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        let mut per_server = self.per_server.write().unwrap();
        if let Some(window) = per_server.get_mut(server_id) {
            window.push(latency_ms, failed);
        }
    }

    /// Per-server derived metrics; `None` for unknown servers
    pub fn server_metrics(&self, server_id: &str) -> Option<ServerMetrics> {
        self.per_server
            .read()
            .unwrap()
            .get(server_id)
            .map(|w| w.metrics())
    }

    /// Current requests-per-second gauge (from the last tick)
    pub fn requests_per_second(&self) -> f64 {
        f64::from_bits(self.requests_per_second.load(Ordering::Relaxed))
    }

    /// Recompute derived gauges; called on a fixed interval regardless of
    /// request volume
    pub fn tick(&self, now: Instant) {
        let total = self.total_requests.load(Ordering::Relaxed);
        let mut last = self.last_tick.write().unwrap();
        if let Some((prev_at, prev_total)) = *last {
            let elapsed = now.saturating_duration_since(prev_at).as_secs_f64();
            if elapsed > 0.0 {
                let rps = (total - prev_total) as f64 / elapsed;
                self.requests_per_second
                    .store(rps.to_bits(), Ordering::Relaxed);
            }
        }
        *last = Some((now, total));
    }

    /// Aggregate snapshot
    pub fn snapshot(&self) -> AggregateSnapshot {
        let per_server = self.per_server.read().unwrap();
        let (sum, count) = per_server.values().fold((0u64, 0usize), |(s, c), w| {
            (s + w.samples.iter().sum::<u64>(), c + w.samples.len())
        });
        let avg = if count == 0 { 0.0 } else { sum as f64 / count as f64 };

        AggregateSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_responses: self.total_responses.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            requests_per_second: self.requests_per_second(),
            avg_response_ms: avg,
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
