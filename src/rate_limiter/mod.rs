//! Rate Limiter (C1, spec.md §4.1).
//!
//! A request-admission layer with per-identity fixed-window counters shared across
//! API instances via [`SharedStore`]. Grounded on the teacher's
//! `monitor/rate_limiter.rs` manager-of-per-key-limiters shape, with the algorithm
//! swapped from token-bucket to fixed-window per spec.md §4.1.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::BucketConfig;
use crate::metrics::MetricsCollector;
use crate::shared_store::SharedStore;

/// Outcome of an [`RateLimiter::admit`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub reset_after_ms: u64,
}

/// Uniform admission control across all external-facing operations (spec.md §4.1).
///
/// Algorithm: fixed-window counter, key = `(bucket, identity, floor(now / window))`.
/// If the shared store is unreachable the limiter fails **open** (spec.md's explicit,
/// non-negotiable design choice, spec.md §9) — availability dominates precision.
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    metrics: Arc<MetricsCollector>,
    buckets: std::collections::HashMap<String, BucketConfig>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn SharedStore>,
        metrics: Arc<MetricsCollector>,
        buckets: std::collections::HashMap<String, BucketConfig>,
    ) -> Self {
        Self { store, metrics, buckets }
    }

    /// Admits or rejects a request for `(identity, bucket)`. Unrecognized buckets are
    /// rejected with `validation_error` at the facade layer, not here — this type only
    /// implements the closed set it is configured with.
    pub async fn admit(&self, identity: &str, bucket: &str) -> Admission {
        let Some(cfg) = self.buckets.get(bucket) else {
            // No configuration for this bucket: fail open rather than silently deny
            // traffic the operator never configured a limit for.
            return Admission { allowed: true, reset_after_ms: 0 };
        };

        let window = Duration::from_secs(cfg.window_seconds);
        let now_secs = now_unix_seconds();
        let window_index = now_secs / cfg.window_seconds.max(1);
        let key = format!("rate:{bucket}:{identity}:{window_index}");

        match self.store.incr(&key, window).await {
            Ok(count) => {
                let reset_after_ms = self.ttl_remaining_ms(&key).await;
                if count <= cfg.limit as i64 {
                    Admission { allowed: true, reset_after_ms }
                } else {
                    self.metrics.record_rate_limit_rejection(bucket);
                    warn!(bucket, identity_hash = %stable_hash(identity), "rate limit rejected request");
                    Admission { allowed: false, reset_after_ms }
                }
            }
            Err(err) => {
                warn!(bucket, error = %err, "shared store unavailable, rate limiter failing open");
                self.metrics.record_rate_limiter_fallback();
                Admission { allowed: true, reset_after_ms: 0 }
            }
        }
    }

    async fn ttl_remaining_ms(&self, key: &str) -> u64 {
        self.store
            .ttl_remaining(key)
            .await
            .ok()
            .flatten()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

fn now_unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A stable, non-reversible hash of the caller identity for log lines — we never log
/// the raw identity string, per SPEC_FULL §4.1's bound on unbounded-cardinality keys.
fn stable_hash(identity: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    identity.hash(&mut hasher);
    hasher.finish()
}
