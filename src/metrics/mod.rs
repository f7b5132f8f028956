//! Metrics and health-check module (C2 of spec.md §4.2).
//!
//! Collects the mandatory series table (streams_active, queue_size, rate limiter
//! rejections, HTTP request counters, ...), exports it in Prometheus text format, and
//! aggregates component health checks plus the per-worker `HealthSummary` read model.

mod collector;
mod health;
mod prometheus;

pub use collector::{MetricsCollector, MetricsSnapshot};
pub use health::{ComponentHealth, HealthChecker, HealthStatus, HealthSummary, SystemHealth};
pub use prometheus::PrometheusExporter;
