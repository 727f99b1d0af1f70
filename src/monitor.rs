//! Lock-free-on-the-hot-path counter aggregator with a small locked ring
//! for response-time samples. Grounded on the original performance monitor
//! (exact JSON/Prometheus shapes, percentile formula, EMA update) and on
//! the teacher's CAS-loop idiom (`qos/token_bucket.rs`) and ring-buffer
//! idiom (`telemetry.rs::TelemetryHistory`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Which kind of deadline fired. Shared between the monitor (for counting)
/// and the timeout manager (for dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    Connection,
    Request,
}

const RING_CAPACITY: usize = 10_000;
const EMA_ALPHA: f64 = 0.1;

/// A consistent read of the monitor's counters plus derived rates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub total_requests: u64,
    pub active_requests: u64,
    pub average_response_time_ms: f64,
    pub connection_reuses: u64,
    pub total_connections: u64,
    pub connection_timeouts: u64,
    pub request_timeouts: u64,
    pub connection_reuse_rate: f64,
    pub requests_per_second: f64,
    pub p95_response_time_ms: u64,
    pub p99_response_time_ms: u64,
}

pub struct PerformanceMonitor {
    total_requests: AtomicU64,
    active_requests: AtomicU64,
    connection_reuses: AtomicU64,
    new_connections: AtomicU64,
    connection_timeouts: AtomicU64,
    request_timeouts: AtomicU64,
    /// f64 bit-pattern packed into an AtomicU64; updated via CAS retry loop.
    average_response_time_bits: AtomicU64,
    response_times: Mutex<VecDeque<u64>>,
    /// Guarded by a mutex (not an atomic) because `reset()` must replace it
    /// with a fresh `Instant::now()`, not just zero it.
    start_time: Mutex<Instant>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            active_requests: AtomicU64::new(0),
            connection_reuses: AtomicU64::new(0),
            new_connections: AtomicU64::new(0),
            connection_timeouts: AtomicU64::new(0),
            request_timeouts: AtomicU64::new(0),
            average_response_time_bits: AtomicU64::new(0f64.to_bits()),
            response_times: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            start_time: Mutex::new(Instant::now()),
        }
    }

    pub fn record_request_start(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Must only be called for a matching prior `record_request_start`.
    pub fn record_request_end(&self, duration_ms: u64) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        self.update_average_response_time(duration_ms as f64);

        if let Ok(mut samples) = self.response_times.lock() {
            if samples.len() >= RING_CAPACITY {
                samples.pop_front();
            }
            samples.push_back(duration_ms);
        }
    }

    pub fn record_new_connection(&self) {
        self.new_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_reuse(&self) {
        self.connection_reuses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self, kind: TimeoutKind) {
        match kind {
            TimeoutKind::Connection => {
                self.connection_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            TimeoutKind::Request => {
                self.request_timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// CAS-loop EMA update: read current average, compute the new value,
    /// attempt compare-and-swap, retry on contention with the freshly
    /// observed average. The first sample seeds the average directly.
    fn update_average_response_time(&self, sample_ms: f64) {
        loop {
            let current_bits = self.average_response_time_bits.load(Ordering::Acquire);
            let current = f64::from_bits(current_bits);

            let new_value = if current == 0.0 {
                sample_ms
            } else {
                EMA_ALPHA * sample_ms + (1.0 - EMA_ALPHA) * current
            };

            match self.average_response_time_bits.compare_exchange(
                current_bits,
                new_value.to_bits(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => continue,
            }
        }
    }

    /// Rank `⌊p · (N−1)⌋` of a sorted copy of the current samples.
    /// `N=0` yields zero; `p` outside `[0,1]` yields zero.
    pub fn percentile(&self, p: f64) -> u64 {
        if !(0.0..=1.0).contains(&p) {
            return 0;
        }
        let samples = match self.response_times.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return 0,
        };
        if samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = samples.into_iter().collect();
        sorted.sort_unstable();
        let index = (p * (sorted.len() - 1) as f64).floor() as usize;
        sorted[index.min(sorted.len() - 1)]
    }

    pub fn snapshot(&self) -> Snapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let active_requests = self.active_requests.load(Ordering::Relaxed);
        let connection_reuses = self.connection_reuses.load(Ordering::Relaxed);
        let new_connections = self.new_connections.load(Ordering::Relaxed);
        let connection_timeouts = self.connection_timeouts.load(Ordering::Relaxed);
        let request_timeouts = self.request_timeouts.load(Ordering::Relaxed);
        let average_response_time_ms =
            f64::from_bits(self.average_response_time_bits.load(Ordering::Acquire));

        let reuse_denominator = connection_reuses + new_connections;
        let connection_reuse_rate = if reuse_denominator == 0 {
            0.0
        } else {
            connection_reuses as f64 / reuse_denominator as f64
        };

        let elapsed_secs = self
            .start_time
            .lock()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let requests_per_second = if elapsed_secs == 0.0 {
            0.0
        } else {
            total_requests as f64 / elapsed_secs
        };

        Snapshot {
            total_requests,
            active_requests,
            average_response_time_ms,
            connection_reuses,
            total_connections: new_connections,
            connection_timeouts,
            request_timeouts,
            connection_reuse_rate,
            requests_per_second,
            p95_response_time_ms: self.percentile(0.95),
            p99_response_time_ms: self.percentile(0.99),
        }
    }

    /// Exact key set/order required by the spec.
    pub fn export_json(&self) -> String {
        let s = self.snapshot();
        serde_json::json!({
            "totalRequests": s.total_requests,
            "activeRequests": s.active_requests,
            "averageResponseTime": s.average_response_time_ms,
            "connectionReuses": s.connection_reuses,
            "totalConnections": s.total_connections,
            "connectionTimeouts": s.connection_timeouts,
            "requestTimeouts": s.request_timeouts,
            "connectionReuseRate": s.connection_reuse_rate,
            "requestsPerSecond": s.requests_per_second,
            "p95ResponseTime": s.p95_response_time_ms,
            "p99ResponseTime": s.p99_response_time_ms,
        })
        .to_string()
    }

    /// Exact metric names/types required by the spec, each preceded by
    /// `# HELP`/`# TYPE` lines, built with a single `format!` the way the
    /// teacher's `get_metrics` handler builds its own Prometheus text.
    pub fn export_prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            "# HELP http_requests_total Total number of HTTP requests processed\n\
             # TYPE http_requests_total counter\n\
             http_requests_total {}\n\
             # HELP http_requests_active Number of requests currently being processed\n\
             # TYPE http_requests_active gauge\n\
             http_requests_active {}\n\
             # HELP http_request_duration_ms Average request duration in milliseconds\n\
             # TYPE http_request_duration_ms gauge\n\
             http_request_duration_ms {}\n\
             # HELP http_connections_reused_total Total number of connections reused from the pool\n\
             # TYPE http_connections_reused_total counter\n\
             http_connections_reused_total {}\n\
             # HELP http_connections_total Total number of connections created\n\
             # TYPE http_connections_total counter\n\
             http_connections_total {}\n\
             # HELP http_connection_timeouts_total Total number of connection timeouts\n\
             # TYPE http_connection_timeouts_total counter\n\
             http_connection_timeouts_total {}\n\
             # HELP http_request_timeouts_total Total number of request timeouts\n\
             # TYPE http_request_timeouts_total counter\n\
             http_request_timeouts_total {}\n\
             # HELP http_connection_reuse_rate Fraction of connections served via reuse\n\
             # TYPE http_connection_reuse_rate gauge\n\
             http_connection_reuse_rate {}\n\
             # HELP http_requests_per_second Requests processed per second since start\n\
             # TYPE http_requests_per_second gauge\n\
             http_requests_per_second {}\n\
             # HELP http_request_duration_p95_ms 95th percentile request duration in milliseconds\n\
             # TYPE http_request_duration_p95_ms gauge\n\
             http_request_duration_p95_ms {}\n\
             # HELP http_request_duration_p99_ms 99th percentile request duration in milliseconds\n\
             # TYPE http_request_duration_p99_ms gauge\n\
             http_request_duration_p99_ms {}\n",
            s.total_requests,
            s.active_requests,
            s.average_response_time_ms,
            s.connection_reuses,
            s.total_connections,
            s.connection_timeouts,
            s.request_timeouts,
            s.connection_reuse_rate,
            s.requests_per_second,
            s.p95_response_time_ms,
            s.p99_response_time_ms,
        )
    }

    /// Zero all counters, clear the ring, and reset the start timestamp so
    /// `requests_per_second` is computed against this reset, not the
    /// monitor's original construction.
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.active_requests.store(0, Ordering::Relaxed);
        self.connection_reuses.store(0, Ordering::Relaxed);
        self.new_connections.store(0, Ordering::Relaxed);
        self.connection_timeouts.store(0, Ordering::Relaxed);
        self.request_timeouts.store(0, Ordering::Relaxed);
        self.average_response_time_bits
            .store(0f64.to_bits(), Ordering::Release);
        if let Ok(mut samples) = self.response_times.lock() {
            samples.clear();
        }
        if let Ok(mut start) = self.start_time.lock() {
            *start = Instant::now();
        }
    }
}
