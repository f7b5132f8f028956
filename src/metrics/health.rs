//! Health check implementation.
//!
//! Component health registration/aggregation, plus the `HealthSummary` read model
//! SPEC_FULL §4.2 specifies for C8's per-worker health endpoint (spec.md §4.8).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Health status of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub last_check: Option<String>,
    pub check_duration_ms: Option<u64>,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            last_check: Some(chrono::Utc::now().to_rfc3339()),
            check_duration_ms: None,
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            last_check: Some(chrono::Utc::now().to_rfc3339()),
            check_duration_ms: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            last_check: Some(chrono::Utc::now().to_rfc3339()),
            check_duration_ms: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.check_duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub version: String,
    pub uptime_secs: u64,
    pub timestamp: String,
}

impl SystemHealth {
    pub fn is_ready(&self) -> bool {
        matches!(self.status, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Per-worker health read model (spec.md §4.8): `{status, uptime, current_track?,
/// queue_size, metrics}`, assembled from the metrics collector rather than by
/// re-querying the worker process directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub current_track: Option<String>,
    pub queue_size: u64,
    pub listeners: u64,
}

pub type HealthCheckFn = Arc<dyn Fn() -> ComponentHealth + Send + Sync>;

pub struct HealthChecker {
    checks: RwLock<HashMap<String, HealthCheckFn>>,
    start_time: Instant,
    version: String,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            checks: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub async fn register(&self, name: impl Into<String>, check: HealthCheckFn) {
        self.checks.write().await.insert(name.into(), check);
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.checks.write().await.remove(name).is_some()
    }

    pub async fn check_all(&self) -> SystemHealth {
        let checks = self.checks.read().await;
        let mut components = HashMap::new();
        let mut overall_status = HealthStatus::Healthy;

        for (name, check) in checks.iter() {
            let start = Instant::now();
            let mut health = check();
            health.check_duration_ms = Some(start.elapsed().as_millis() as u64);

            match health.status {
                HealthStatus::Unhealthy => overall_status = HealthStatus::Unhealthy,
                HealthStatus::Degraded if overall_status == HealthStatus::Healthy => {
                    overall_status = HealthStatus::Degraded;
                }
                _ => {}
            }

            components.insert(name.clone(), health);
        }

        SystemHealth {
            status: overall_status,
            components,
            version: self.version.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub async fn check_ready(&self) -> bool {
        self.check_all().await.is_ready()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_default_is_unknown() {
        assert_eq!(HealthStatus::default(), HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn check_all_is_healthy_with_no_registrations() {
        let checker = HealthChecker::new();
        let health = checker.check_all().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn one_unhealthy_component_degrades_overall_status() {
        let checker = HealthChecker::new();
        checker.register("queue", Arc::new(|| ComponentHealth::healthy("queue"))).await;
        checker
            .register("database", Arc::new(|| ComponentHealth::unhealthy("database", "pool exhausted")))
            .await;

        let health = checker.check_all().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.components.len(), 2);
    }

    #[tokio::test]
    async fn unregister_removes_a_check() {
        let checker = HealthChecker::new();
        checker.register("queue", Arc::new(|| ComponentHealth::healthy("queue"))).await;
        assert!(checker.unregister("queue").await);
        assert!(!checker.unregister("queue").await);
    }
}
