//! Prometheus text-format exporter.

use std::sync::Arc;

use super::collector::MetricsCollector;

pub struct PrometheusExporter {
    collector: Arc<MetricsCollector>,
    namespace: String,
}

impl PrometheusExporter {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self { collector, namespace: "telecast".to_string() }
    }

    pub fn with_namespace(collector: Arc<MetricsCollector>, namespace: impl Into<String>) -> Self {
        Self { collector, namespace: namespace.into() }
    }

    /// Export metrics in Prometheus text format, matching the mandatory series table
    /// of spec.md §4.2 name-for-name — these names are a stable external contract.
    pub fn export(&self) -> String {
        let snapshot = self.collector.snapshot();
        let mut output = String::new();

        self.write_gauge(&mut output, "streams_active", "Number of currently active streams", snapshot.streams_active as f64);

        for (channel_id, count) in &snapshot.stream_listeners {
            self.write_gauge_with_labels(&mut output, "stream_listeners", "Listener count per channel", *count as f64, &[("channel_id", channel_id)]);
        }

        for (channel_id, size) in &snapshot.queue_size {
            self.write_gauge_with_labels(&mut output, "queue_size", "Queue length per channel", *size as f64, &[("channel_id", channel_id)]);
        }

        for ((channel_id, op), count) in &snapshot.queue_operations_total {
            self.write_counter_with_labels(&mut output, "queue_operations_total", "Total queue mutations by operation", *count as f64, &[("channel_id", channel_id), ("op", op)]);
        }

        self.write_counter(&mut output, "tracks_played_total", "Total tracks that finished playing", snapshot.tracks_played_total as f64);

        for ((channel_id, reason), count) in &snapshot.auto_end_triggered_total {
            self.write_counter_with_labels(&mut output, "auto_end_triggered_total", "Total auto-end firings by reason", *count as f64, &[("channel_id", channel_id), ("reason", reason)]);
        }

        self.write_gauge(&mut output, "websocket_connections", "Currently open WebSocket connections", snapshot.websocket_connections as f64);

        for ((method, path_template, status_class), count) in &snapshot.http_requests_total {
            self.write_counter_with_labels(&mut output, "http_requests_total", "Total HTTP requests", *count as f64, &[("method", method), ("path_template", path_template), ("status_class", status_class)]);
        }

        for ((method, path_template), avg_ms) in &snapshot.http_request_duration_avg_ms {
            self.write_gauge_with_labels(&mut output, "http_request_duration_seconds", "Average HTTP request duration", avg_ms / 1000.0, &[("method", method), ("path_template", path_template)]);
        }

        for (bucket, count) in &snapshot.rate_limiter_rejections_total {
            self.write_counter_with_labels(&mut output, "rate_limiter_rejections_total", "Total rate-limit rejections by bucket", *count as f64, &[("bucket", bucket)]);
        }

        self.write_counter(&mut output, "rate_limiter_fallback_total", "Total admissions granted via fail-open fallback", snapshot.rate_limiter_fallback_total as f64);
        self.write_counter(&mut output, "hub_drops_total", "Total event-hub subscriber buffer overflows", snapshot.hub_drops_total as f64);

        output
    }

    fn write_gauge(&self, output: &mut String, name: &str, help: &str, value: f64) {
        let full_name = format!("{}_{}", self.namespace, name);
        output.push_str(&format!("# HELP {full_name} {help}\n"));
        output.push_str(&format!("# TYPE {full_name} gauge\n"));
        output.push_str(&format!("{full_name} {value}\n"));
    }

    fn write_gauge_with_labels(&self, output: &mut String, name: &str, help: &str, value: f64, labels: &[(&str, &str)]) {
        let full_name = format!("{}_{}", self.namespace, name);
        output.push_str(&format!("# HELP {full_name} {help}\n"));
        output.push_str(&format!("# TYPE {full_name} gauge\n"));
        let labels_str = labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect::<Vec<_>>().join(",");
        output.push_str(&format!("{full_name}{{{labels_str}}} {value}\n"));
    }

    fn write_counter(&self, output: &mut String, name: &str, help: &str, value: f64) {
        let full_name = format!("{}_{}", self.namespace, name);
        output.push_str(&format!("# HELP {full_name} {help}\n"));
        output.push_str(&format!("# TYPE {full_name} counter\n"));
        output.push_str(&format!("{full_name} {value}\n"));
    }

    fn write_counter_with_labels(&self, output: &mut String, name: &str, help: &str, value: f64, labels: &[(&str, &str)]) {
        let full_name = format!("{}_{}", self.namespace, name);
        output.push_str(&format!("# HELP {full_name} {help}\n"));
        output.push_str(&format!("# TYPE {full_name} counter\n"));
        let labels_str = labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect::<Vec<_>>().join(",");
        output.push_str(&format!("{full_name}{{{labels_str}}} {value}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_default_namespace() {
        let collector = Arc::new(MetricsCollector::new());
        let exporter = PrometheusExporter::new(collector);
        let output = exporter.export();
        assert!(output.contains("# HELP telecast_streams_active"));
        assert!(output.contains("telecast_streams_active 0"));
    }

    #[test]
    fn exports_labeled_series() {
        let collector = Arc::new(MetricsCollector::new());
        collector.set_queue_size("ch-1", 4);
        collector.record_rate_limit_rejection("strict");

        let exporter = PrometheusExporter::new(collector);
        let output = exporter.export();

        assert!(output.contains("telecast_queue_size{channel_id=\"ch-1\"} 4"));
        assert!(output.contains("telecast_rate_limiter_rejections_total{bucket=\"strict\"} 1"));
    }

    #[test]
    fn custom_namespace_replaces_default() {
        let collector = Arc::new(MetricsCollector::new());
        let exporter = PrometheusExporter::with_namespace(collector, "custom");
        let output = exporter.export();
        assert!(output.contains("custom_streams_active"));
        assert!(!output.contains("telecast_"));
    }
}
