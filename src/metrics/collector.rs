//! Metrics collector implementation.
//!
//! Collects the mandatory series of spec.md §4.2. Counters/gauges are plain atomics;
//! label-partitioned series use `DashMap<label-key, AtomicU64>` the way the teacher's
//! collector partitions per-streamer counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Metrics collector for the orchestration core.
#[derive(Debug)]
pub struct MetricsCollector {
    streams_active: AtomicU64,
    stream_listeners: DashMap<String, AtomicU64>,
    queue_size: DashMap<String, AtomicU64>,
    queue_operations_total: DashMap<(String, String), AtomicU64>,
    tracks_played_total: AtomicU64,
    auto_end_triggered_total: DashMap<(String, String), AtomicU64>,
    websocket_connections: AtomicU64,
    http_requests_total: DashMap<(String, String, String), AtomicU64>,
    http_request_duration_total_ms: DashMap<(String, String), AtomicU64>,
    http_request_duration_count: DashMap<(String, String), AtomicU64>,
    rate_limiter_rejections_total: DashMap<String, AtomicU64>,
    rate_limiter_fallback_total: AtomicU64,
    hub_drops_total: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            streams_active: AtomicU64::new(0),
            stream_listeners: DashMap::new(),
            queue_size: DashMap::new(),
            queue_operations_total: DashMap::new(),
            tracks_played_total: AtomicU64::new(0),
            auto_end_triggered_total: DashMap::new(),
            websocket_connections: AtomicU64::new(0),
            http_requests_total: DashMap::new(),
            http_request_duration_total_ms: DashMap::new(),
            http_request_duration_count: DashMap::new(),
            rate_limiter_rejections_total: DashMap::new(),
            rate_limiter_fallback_total: AtomicU64::new(0),
            hub_drops_total: AtomicU64::new(0),
        }
    }

    pub fn stream_started(&self) {
        self.streams_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_stopped(&self) {
        self.streams_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set_stream_listeners(&self, channel_id: impl Into<String>, count: u64) {
        self.stream_listeners
            .entry(channel_id.into())
            .or_insert_with(|| AtomicU64::new(0))
            .store(count, Ordering::Relaxed);
    }

    pub fn set_queue_size(&self, channel_id: impl Into<String>, size: u64) {
        self.queue_size
            .entry(channel_id.into())
            .or_insert_with(|| AtomicU64::new(0))
            .store(size, Ordering::Relaxed);
    }

    pub fn record_queue_operation(&self, channel_id: impl Into<String>, op: impl Into<String>) {
        self.queue_operations_total
            .entry((channel_id.into(), op.into()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_track_played(&self) {
        self.tracks_played_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auto_end_triggered(&self, channel_id: impl Into<String>, reason: impl Into<String>) {
        self.auto_end_triggered_total
            .entry((channel_id.into(), reason.into()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_connected(&self) {
        self.websocket_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_disconnected(&self) {
        self.websocket_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_hub_drop(&self) {
        self.hub_drops_total.fetch_add(1, Ordering::Relaxed);
    }

    /// `status_class` is the first digit of the HTTP status, e.g. `"2xx"`.
    pub fn record_http_request(
        &self,
        method: impl Into<String>,
        path_template: impl Into<String>,
        status_class: impl Into<String>,
        duration_ms: u64,
    ) {
        let method = method.into();
        let path_template = path_template.into();
        self.http_requests_total
            .entry((method.clone(), path_template.clone(), status_class.into()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        self.http_request_duration_total_ms
            .entry((method.clone(), path_template.clone()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.http_request_duration_count
            .entry((method, path_template))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_rejection(&self, bucket: impl Into<String>) {
        self.rate_limiter_rejections_total
            .entry(bucket.into())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limiter_fallback(&self) {
        self.rate_limiter_fallback_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn streams_active(&self) -> u64 {
        self.streams_active.load(Ordering::Relaxed)
    }

    pub fn queue_size_for(&self, channel_id: &str) -> u64 {
        self.queue_size
            .get(channel_id)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn listeners_for(&self, channel_id: &str) -> u64 {
        self.stream_listeners
            .get(channel_id)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            streams_active: self.streams_active.load(Ordering::Relaxed),
            stream_listeners: map_u64(&self.stream_listeners),
            queue_size: map_u64(&self.queue_size),
            queue_operations_total: map_pair_u64(&self.queue_operations_total),
            tracks_played_total: self.tracks_played_total.load(Ordering::Relaxed),
            auto_end_triggered_total: map_pair_u64(&self.auto_end_triggered_total),
            websocket_connections: self.websocket_connections.load(Ordering::Relaxed),
            http_requests_total: map_triple_u64(&self.http_requests_total),
            http_request_duration_avg_ms: self.avg_http_request_duration_ms(),
            rate_limiter_rejections_total: map_u64(&self.rate_limiter_rejections_total),
            rate_limiter_fallback_total: self.rate_limiter_fallback_total.load(Ordering::Relaxed),
            hub_drops_total: self.hub_drops_total.load(Ordering::Relaxed),
        }
    }

    fn avg_http_request_duration_ms(&self) -> HashMap<(String, String), f64> {
        self.http_request_duration_count
            .iter()
            .map(|e| {
                let key = e.key().clone();
                let count = e.value().load(Ordering::Relaxed);
                let total = self
                    .http_request_duration_total_ms
                    .get(&key)
                    .map(|v| v.load(Ordering::Relaxed))
                    .unwrap_or(0);
                let avg = if count > 0 { total as f64 / count as f64 } else { 0.0 };
                (key, avg)
            })
            .collect()
    }
}

fn map_u64(dm: &DashMap<String, AtomicU64>) -> HashMap<String, u64> {
    dm.iter().map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed))).collect()
}

fn map_pair_u64(dm: &DashMap<(String, String), AtomicU64>) -> HashMap<(String, String), u64> {
    dm.iter().map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed))).collect()
}

fn map_triple_u64(
    dm: &DashMap<(String, String, String), AtomicU64>,
) -> HashMap<(String, String, String), u64> {
    dm.iter().map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed))).collect()
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub streams_active: u64,
    pub stream_listeners: HashMap<String, u64>,
    pub queue_size: HashMap<String, u64>,
    pub queue_operations_total: HashMap<(String, String), u64>,
    pub tracks_played_total: u64,
    pub auto_end_triggered_total: HashMap<(String, String), u64>,
    pub websocket_connections: u64,
    pub http_requests_total: HashMap<(String, String, String), u64>,
    pub http_request_duration_avg_ms: HashMap<(String, String), f64>,
    pub rate_limiter_rejections_total: HashMap<String, u64>,
    pub rate_limiter_fallback_total: u64,
    pub hub_drops_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_lifecycle_counts() {
        let collector = MetricsCollector::new();
        collector.stream_started();
        collector.stream_started();
        collector.stream_stopped();
        assert_eq!(collector.streams_active(), 1);
    }

    #[test]
    fn queue_metrics_partition_by_channel() {
        let collector = MetricsCollector::new();
        collector.set_queue_size("ch-1", 3);
        collector.set_queue_size("ch-2", 7);
        collector.record_queue_operation("ch-1", "add");
        collector.record_queue_operation("ch-1", "add");
        collector.record_queue_operation("ch-1", "remove");

        assert_eq!(collector.queue_size_for("ch-1"), 3);
        assert_eq!(collector.queue_size_for("ch-2"), 7);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.queue_operations_total.get(&("ch-1".to_string(), "add".to_string())), Some(&2));
    }

    #[test]
    fn http_duration_average() {
        let collector = MetricsCollector::new();
        collector.record_http_request("GET", "/channels/:id", "2xx", 100);
        collector.record_http_request("GET", "/channels/:id", "2xx", 300);
        let snapshot = collector.snapshot();
        let key = ("GET".to_string(), "/channels/:id".to_string());
        assert_eq!(snapshot.http_request_duration_avg_ms.get(&key), Some(&200.0));
    }

    #[test]
    fn rate_limiter_rejections_partition_by_bucket() {
        let collector = MetricsCollector::new();
        collector.record_rate_limit_rejection("strict");
        collector.record_rate_limit_rejection("strict");
        collector.record_rate_limiter_fallback();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.rate_limiter_rejections_total.get("strict"), Some(&2));
        assert_eq!(snapshot.rate_limiter_fallback_total, 1);
    }
}
