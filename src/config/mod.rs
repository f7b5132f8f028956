//! Process-wide configuration (spec.md §6.5), loaded once at startup from environment
//! variables. There is no runtime reload path for these values — only the logging
//! filter (`logging::LoggingConfig`) supports that.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    pub limit: u32,
    pub window_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rate_limit_defaults: HashMap<String, BucketConfig>,
    pub auto_end_timeout_default_seconds: u64,
    pub auto_end_warning_points_seconds: Vec<u64>,
    pub queue_max_length_default: usize,
    pub worker_graceful_stop_seconds: u64,
    pub worker_restart_backoff_seconds: u64,
    pub worker_restart_attempts_before_error: u32,
    /// Bound on `transport_transient` retries within a single playback attempt
    /// (spec.md §4.7.3 says "up to 2x"; left configurable per spec.md §9's Open
    /// Question on whether 2 or 3 is correct).
    pub worker_transient_retry_attempts: u32,
    pub session_recovery_initial_seconds: u64,
    pub session_recovery_max_seconds: u64,
    pub session_recovery_give_up_after_attempts: u32,
    pub placeholder_media_path: Option<String>,
    pub shared_store_url: Option<String>,
    pub relational_store_url: String,
    pub metrics_bind_addr: String,
    pub data_encryption_key: String,
}

fn default_rate_limit_buckets() -> HashMap<String, BucketConfig> {
    let mut m = HashMap::new();
    m.insert("standard".to_string(), BucketConfig { limit: 100, window_seconds: 60 });
    m.insert("elevated".to_string(), BucketConfig { limit: 200, window_seconds: 60 });
    m.insert("strict".to_string(), BucketConfig { limit: 10, window_seconds: 60 });
    m.insert("external_api".to_string(), BucketConfig { limit: 10, window_seconds: 60 });
    m
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rate_limit_defaults: default_rate_limit_buckets(),
            auto_end_timeout_default_seconds: 300,
            auto_end_warning_points_seconds: vec![60, 30, 10],
            queue_max_length_default: 100,
            worker_graceful_stop_seconds: 10,
            worker_restart_backoff_seconds: 10,
            worker_restart_attempts_before_error: 5,
            worker_transient_retry_attempts: 2,
            session_recovery_initial_seconds: 60,
            session_recovery_max_seconds: 600,
            session_recovery_give_up_after_attempts: 5,
            placeholder_media_path: None,
            shared_store_url: None,
            relational_store_url: "sqlite://telecast.db".to_string(),
            metrics_bind_addr: "0.0.0.0:9090".to_string(),
            data_encryption_key: String::new(),
        }
    }
}

impl Config {
    /// Loads config from environment variables, falling back to defaults for anything
    /// unset or malformed (malformed values are logged and skipped, not fatal, except
    /// `DATA_ENCRYPTION_KEY` which is required once session storage is touched).
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("RATE_LIMIT_DEFAULTS") {
            match serde_json::from_str::<HashMap<String, BucketConfig>>(&raw) {
                Ok(parsed) => config.rate_limit_defaults = parsed,
                Err(err) => tracing::warn!(error = %err, "RATE_LIMIT_DEFAULTS is not valid JSON, using defaults"),
            }
        }

        set_from_env_parsed(&mut config.auto_end_timeout_default_seconds, "AUTO_END_TIMEOUT_DEFAULT_SECONDS");

        if let Ok(raw) = std::env::var("AUTO_END_WARNING_POINTS_SECONDS") {
            match serde_json::from_str::<Vec<u64>>(&raw) {
                Ok(parsed) => config.auto_end_warning_points_seconds = parsed,
                Err(err) => tracing::warn!(error = %err, "AUTO_END_WARNING_POINTS_SECONDS is not valid JSON, using defaults"),
            }
        }

        set_from_env_parsed(&mut config.queue_max_length_default, "QUEUE_MAX_LENGTH_DEFAULT");
        set_from_env_parsed(&mut config.worker_graceful_stop_seconds, "WORKER_GRACEFUL_STOP_SECONDS");
        set_from_env_parsed(&mut config.worker_restart_backoff_seconds, "WORKER_RESTART_BACKOFF_SECONDS");
        set_from_env_parsed(&mut config.worker_restart_attempts_before_error, "WORKER_RESTART_ATTEMPTS_BEFORE_ERROR");
        set_from_env_parsed(&mut config.worker_transient_retry_attempts, "WORKER_TRANSIENT_RETRY_ATTEMPTS");
        set_from_env_parsed(&mut config.session_recovery_initial_seconds, "SESSION_RECOVERY_INITIAL_SECONDS");
        set_from_env_parsed(&mut config.session_recovery_max_seconds, "SESSION_RECOVERY_MAX_SECONDS");
        set_from_env_parsed(
            &mut config.session_recovery_give_up_after_attempts,
            "SESSION_RECOVERY_GIVE_UP_AFTER_ATTEMPTS",
        );

        if let Ok(path) = std::env::var("PLACEHOLDER_MEDIA_PATH") {
            if !path.trim().is_empty() {
                config.placeholder_media_path = Some(path);
            }
        }
        if let Ok(url) = std::env::var("SHARED_STORE_URL") {
            if !url.trim().is_empty() {
                config.shared_store_url = Some(url);
            }
        }
        if let Ok(url) = std::env::var("RELATIONAL_STORE_URL") {
            if !url.trim().is_empty() {
                config.relational_store_url = url;
            }
        }
        if let Ok(addr) = std::env::var("METRICS_BIND_ADDR") {
            if !addr.trim().is_empty() {
                config.metrics_bind_addr = addr;
            }
        }
        if let Ok(key) = std::env::var("DATA_ENCRYPTION_KEY") {
            config.data_encryption_key = key;
        }

        config
    }

    pub fn auto_end_timeout_default(&self) -> Duration {
        Duration::from_secs(self.auto_end_timeout_default_seconds)
    }

    pub fn worker_graceful_stop(&self) -> Duration {
        Duration::from_secs(self.worker_graceful_stop_seconds)
    }

    /// Decoded envelope-encryption root key, required before any `SessionMaterial` is
    /// persisted. Returns `Configuration` error rather than panicking, since the
    /// facade may be wired up before any account is ever created.
    pub fn data_encryption_key_bytes(&self) -> Result<Vec<u8>> {
        use base64::Engine;
        if self.data_encryption_key.trim().is_empty() {
            return Err(Error::config("DATA_ENCRYPTION_KEY is not set"));
        }
        base64::engine::general_purpose::STANDARD
            .decode(self.data_encryption_key.trim())
            .map_err(|err| Error::config(format!("DATA_ENCRYPTION_KEY is not valid base64: {err}")))
    }
}

fn set_from_env_parsed<T: std::str::FromStr>(slot: &mut T, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var, "failed to parse environment override, using default"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_all_four_buckets() {
        let config = Config::default();
        for bucket in ["standard", "elevated", "strict", "external_api"] {
            assert!(config.rate_limit_defaults.contains_key(bucket), "missing {bucket}");
        }
    }

    #[test]
    fn missing_encryption_key_is_a_config_error() {
        let config = Config::default();
        assert!(config.data_encryption_key_bytes().is_err());
    }
}
