use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Receives progress events from running nodes
pub trait ProgressObserver: Send + Sync {
    /// Called after each successful flush or generation step
    fn on_records_processed(&self, node: &str, count: u64);
}

/// Progress observer that emits `tracing` debug events
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressObserver for LogProgress {
    fn on_records_processed(&self, node: &str, count: u64) {
        debug!(node, count, "records processed");
    }
}

/// Flush latencies kept in a sliding window
#[derive(Debug, Clone)]
struct FlushLatency {
    window: Arc<Mutex<VecDeque<Duration>>>,
    limit: usize,
}

impl FlushLatency {
    fn new(limit: usize) -> Self {
        Self {
            window: Arc::new(Mutex::new(VecDeque::with_capacity(limit))),
            limit,
        }
    }

    fn record(&self, elapsed: Duration) {
        let mut window = self.window.lock();
        if window.len() == self.limit {
            window.pop_front();
        }
        window.push_back(elapsed);
    }

    /// Nearest-rank quantile; zero when nothing was recorded
    fn quantile(&self, q: f64) -> Duration {
        let mut sorted: Vec<Duration> = self.window.lock().iter().copied().collect();
        if sorted.is_empty() {
            return Duration::ZERO;
        }
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64 * q).ceil() as usize).clamp(1, sorted.len());
        sorted[rank - 1]
    }
}

fn as_micros(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000_000.0
}

/// Number of recent flushes the latency percentiles cover
const FLUSH_WINDOW: usize = 1000;

/// Per-node counters, shared between the running node and the run handle
#[derive(Clone)]
pub struct NodeMetrics {
    node: Arc<str>,
    records_processed: Arc<AtomicU64>,
    records_redirected: Arc<AtomicU64>,
    flushes: Arc<AtomicU64>,
    /// Flush latency (p50, p99)
    flush_latency: FlushLatency,
    observer: Arc<dyn ProgressObserver>,
    start_time: Instant,
}

impl fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeMetrics")
            .field("node", &self.node)
            .field("records_processed", &self.total_processed())
            .field("records_redirected", &self.total_redirected())
            .field("flushes", &self.total_flushes())
            .finish()
    }
}

impl NodeMetrics {
    /// Create a metrics collector that logs progress through `tracing`
    pub fn new(node: &str) -> Self {
        Self::with_observer(node, Arc::new(LogProgress))
    }

    /// Create a metrics collector reporting progress to `observer`
    pub fn with_observer(node: &str, observer: Arc<dyn ProgressObserver>) -> Self {
        Self {
            node: Arc::from(node),
            records_processed: Arc::new(AtomicU64::new(0)),
            records_redirected: Arc::new(AtomicU64::new(0)),
            flushes: Arc::new(AtomicU64::new(0)),
            flush_latency: FlushLatency::new(FLUSH_WINDOW),
            observer,
            start_time: Instant::now(),
        }
    }

    /// Name of the node these metrics belong to
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Record `count` processed records and notify the progress observer
    pub fn record_processed(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.records_processed.fetch_add(count, Ordering::Relaxed);
        self.observer.on_records_processed(&self.node, count);
    }

    /// Record records that were sent to the error output
    pub fn record_redirected(&self, count: u64) {
        self.records_redirected.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a completed flush and how long it took
    pub fn record_flush(&self, elapsed: Duration) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.flush_latency.record(elapsed);
    }

    pub fn total_processed(&self) -> u64 {
        self.records_processed.load(Ordering::Relaxed)
    }

    pub fn total_redirected(&self) -> u64 {
        self.records_redirected.load(Ordering::Relaxed)
    }

    pub fn total_flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Calculate current throughput in records per second
    pub fn throughput_rps(&self) -> f64 {
        let elapsed = self.start_time.elapsed();
        if elapsed.as_secs_f64() == 0.0 {
            0.0
        } else {
            self.total_processed() as f64 / elapsed.as_secs_f64()
        }
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            node: self.node.to_string(),
            total_processed: self.total_processed(),
            total_redirected: self.total_redirected(),
            total_flushes: self.total_flushes(),
            throughput_rps: self.throughput_rps(),
            flush_p50_us: as_micros(self.flush_latency.quantile(0.50)),
            flush_p99_us: as_micros(self.flush_latency.quantile(0.99)),
            elapsed: self.start_time.elapsed(),
        }
    }
}

/// A snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub node: String,
    pub total_processed: u64,
    pub total_redirected: u64,
    pub total_flushes: u64,
    pub throughput_rps: f64,
    pub flush_p50_us: f64,
    pub flush_p99_us: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "{}: Processed: {}, Redirected: {}, Flushes: {}, Throughput: {:.2} rec/s, \
             Flush P50: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.node,
            self.total_processed,
            self.total_redirected,
            self.total_flushes,
            self.throughput_rps,
            self.flush_p50_us,
            self.flush_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}
