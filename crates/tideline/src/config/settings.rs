//! Engine-wide settings carried by the `Settings` resource.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment variable overriding `refreshIntervalSecs`.
pub const ENV_REFRESH_INTERVAL: &str = "TIDELINE_REFRESH_INTERVAL_SECS";
/// Environment variable overriding `maxConcurrentReconciles`.
pub const ENV_MAX_CONCURRENT: &str = "TIDELINE_MAX_CONCURRENT_RECONCILES";

/// Largest accepted retry count, for the engine default and per Application.
pub const MAX_RETRY_LIMIT: u32 = 10;
/// Largest accepted backoff in milliseconds, base or cap.
pub const MAX_BACKOFF_MS: u64 = 300_000;

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Default polling interval for Applications that do not set their own.
    pub refresh_interval_secs: u64,

    /// Deadline for one source resolve or tree read.
    pub poll_timeout_secs: u64,

    /// Deadline for one cluster write.
    pub apply_timeout_secs: u64,

    /// Default retry budget for source and cluster calls.
    pub retry: RetrySettings,

    /// Consecutive failed polls before health turns Unknown.
    pub unknown_after_failures: u32,

    /// Retained snapshots per Application, the rollback window.
    pub history_limit: usize,

    /// Retained sync results per Application. The oldest is evicted first.
    pub result_history_limit: usize,

    /// Reconciliation cycles allowed to run at once across Applications.
    pub max_concurrent_reconciles: usize,

    /// How long a resolved revision is shared between Applications.
    pub source_cache_ttl_secs: u64,

    /// Where git mirrors are cloned.
    pub repository_cache_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff.
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2000,
            max_delay_ms: 60_000,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 180,
            poll_timeout_secs: 30,
            apply_timeout_secs: 30,
            retry: RetrySettings::default(),
            unknown_after_failures: 3,
            history_limit: 10,
            result_history_limit: 100,
            max_concurrent_reconciles: num_cpus::get().max(1),
            source_cache_ttl_secs: 5,
            repository_cache_dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tideline")
        .join("repositories")
}

impl EngineSettings {
    /// Applies `TIDELINE_*` overrides. Unparsable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Some(secs) = env_number::<u64>(ENV_REFRESH_INTERVAL) {
            self.refresh_interval_secs = secs;
        }
        if let Some(n) = env_number::<usize>(ENV_MAX_CONCURRENT) {
            self.max_concurrent_reconciles = n.max(1);
        }
    }

    /// Checks ranges, returning one message per problem.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.refresh_interval_secs == 0 {
            errors.push("refreshIntervalSecs must be greater than 0".to_string());
        }
        if self.poll_timeout_secs == 0 {
            errors.push("pollTimeoutSecs must be greater than 0".to_string());
        }
        if self.apply_timeout_secs == 0 {
            errors.push("applyTimeoutSecs must be greater than 0".to_string());
        }
        if self.retry.max_retries > MAX_RETRY_LIMIT {
            errors.push(format!("retry.maxRetries must be at most {}", MAX_RETRY_LIMIT));
        }
        if self.retry.max_delay_ms == 0 || self.retry.max_delay_ms > MAX_BACKOFF_MS {
            errors.push(format!(
                "retry.maxDelayMs must be between 1 and {}",
                MAX_BACKOFF_MS
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.baseDelayMs must not exceed retry.maxDelayMs".to_string());
        }
        if self.unknown_after_failures == 0 {
            errors.push("unknownAfterFailures must be at least 1".to_string());
        }
        if self.history_limit == 0 {
            errors.push("historyLimit must be at least 1".to_string());
        }
        if self.result_history_limit == 0 {
            errors.push("resultHistoryLimit must be at least 1".to_string());
        }
        if self.max_concurrent_reconciles == 0 {
            errors.push("maxConcurrentReconciles must be at least 1".to_string());
        }
        errors
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {}={:?}: not a number", name, raw);
            None
        }
    }
}
