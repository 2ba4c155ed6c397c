//! Metrics Collection for the NTunnel Relay
//!
//! Atomic counters, a publish-latency histogram and a
//! Prometheus-compatible /metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Relay-wide metrics
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    /// Publishes accepted and stored
    published: AtomicU64,
    /// Publishes of an already stored message
    duplicates: AtomicU64,
    /// Publishes refused (bad encoding, oversize)
    rejected: AtomicU64,
    /// Copies handed to live subscribers, backlog replay included
    delivered: AtomicU64,
    /// Copies dropped because a subscriber fell behind
    dropped: AtomicU64,
    active_connections: AtomicU64,
    active_subscriptions: AtomicU64,
    /// Sealed payload bytes accepted
    bytes_in: AtomicU64,
    /// Publish handling time
    latencies: Mutex<LatencyHistogram>,
}

/// Latency histogram for percentile calculation
struct LatencyHistogram {
    /// Recent latencies (ring buffer, microseconds)
    values: Vec<u64>,
    pos: usize,
    count: u64,
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum += latency_us;
    }

    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.min(self.values.len() as u64) as usize;
        if count == 0 {
            return 0;
        }

        let mut sorted = self.values[..count].to_vec();
        sorted.sort_unstable();

        let idx = ((count as f64 * p / 100.0) as usize).min(count - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                published: AtomicU64::new(0),
                duplicates: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                active_connections: AtomicU64::new(0),
                active_subscriptions: AtomicU64::new(0),
                bytes_in: AtomicU64::new(0),
                latencies: Mutex::new(LatencyHistogram::new(10000)),
            }),
        }
    }

    /// Record an accepted publish
    pub async fn record_publish(&self, bytes: u64, latency_us: u64) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_in.fetch_add(bytes, Ordering::Relaxed);
        self.inner.latencies.lock().await.record(latency_us);
    }

    pub fn record_duplicate(&self) {
        self.inner.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, copies: u64) {
        self.inner.delivered.fetch_add(copies, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn subscription_opened(&self) {
        self.inner.active_subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriptions_closed(&self, n: u64) {
        self.inner.active_subscriptions.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.inner.duplicates.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }

    pub fn active_subscriptions(&self) -> u64 {
        self.inner.active_subscriptions.load(Ordering::Relaxed)
    }

    /// Generate Prometheus-format metrics text
    pub async fn to_prometheus(&self, stored: usize) -> String {
        let lat = self.inner.latencies.lock().await;
        let p50 = lat.percentile(50.0);
        let p95 = lat.percentile(95.0);
        let p99 = lat.percentile(99.0);
        let avg = lat.average();
        drop(lat);

        format!(
r#"# HELP ntunnel_messages_total Publishes by outcome
# TYPE ntunnel_messages_total counter
ntunnel_messages_total{{outcome="accepted"}} {}
ntunnel_messages_total{{outcome="duplicate"}} {}
ntunnel_messages_total{{outcome="rejected"}} {}

# HELP ntunnel_deliveries_total Message copies sent to subscribers
# TYPE ntunnel_deliveries_total counter
ntunnel_deliveries_total{{result="sent"}} {}
ntunnel_deliveries_total{{result="dropped"}} {}

# HELP ntunnel_active_connections Open client connections
# TYPE ntunnel_active_connections gauge
ntunnel_active_connections {}

# HELP ntunnel_active_subscriptions Open subscriptions
# TYPE ntunnel_active_subscriptions gauge
ntunnel_active_subscriptions {}

# HELP ntunnel_stored_messages Messages held for replay
# TYPE ntunnel_stored_messages gauge
ntunnel_stored_messages {}

# HELP ntunnel_bytes_in_total Sealed payload bytes accepted
# TYPE ntunnel_bytes_in_total counter
ntunnel_bytes_in_total {}

# HELP ntunnel_publish_latency_us Publish handling latency in microseconds
# TYPE ntunnel_publish_latency_us summary
ntunnel_publish_latency_us{{quantile="0.5"}} {}
ntunnel_publish_latency_us{{quantile="0.95"}} {}
ntunnel_publish_latency_us{{quantile="0.99"}} {}
ntunnel_publish_latency_us_avg {}
"#,
            self.inner.published.load(Ordering::Relaxed),
            self.inner.duplicates.load(Ordering::Relaxed),
            self.inner.rejected.load(Ordering::Relaxed),
            self.inner.delivered.load(Ordering::Relaxed),
            self.inner.dropped.load(Ordering::Relaxed),
            self.inner.active_connections.load(Ordering::Relaxed),
            self.inner.active_subscriptions.load(Ordering::Relaxed),
            stored,
            self.inner.bytes_in.load(Ordering::Relaxed),
            p50, p95, p99, avg,
        )
    }
}
