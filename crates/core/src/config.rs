//! Runtime knobs read from `FERRY_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

/// Per-cluster cache and registry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub queue_cap: usize,
    pub flush_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    pub stale_secs: u64,
    pub idle_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { queue_cap: 2048, flush_ms: 8, backoff_base_ms: 500, backoff_max_secs: 30, stale_secs: 120, idle_secs: 1800 }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            queue_cap: env_or("FERRY_QUEUE_CAP", d.queue_cap).max(1),
            flush_ms: env_or("FERRY_FLUSH_MS", d.flush_ms).max(1),
            backoff_base_ms: env_or("FERRY_WATCH_BACKOFF_BASE_MS", d.backoff_base_ms),
            backoff_max_secs: env_or("FERRY_WATCH_BACKOFF_MAX_SECS", d.backoff_max_secs),
            stale_secs: env_or("FERRY_STALE_SECS", d.stale_secs),
            idle_secs: env_or("FERRY_CACHE_IDLE_SECS", d.idle_secs),
        }
    }

    pub fn flush_interval(&self) -> Duration { Duration::from_millis(self.flush_ms) }
    pub fn backoff_base(&self) -> Duration { Duration::from_millis(self.backoff_base_ms) }
    pub fn backoff_max(&self) -> Duration { Duration::from_secs(self.backoff_max_secs) }
    pub fn stale_after(&self) -> Duration { Duration::from_secs(self.stale_secs) }
    pub fn idle_retention(&self) -> Duration { Duration::from_secs(self.idle_secs) }
}

/// Reconciliation engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub compare_parallelism: usize,
}

impl Default for EngineConfig {
    fn default() -> Self { Self { concurrency: 8, timeout_secs: 60, compare_parallelism: 4 } }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            concurrency: env_or("FERRY_RECONCILE_CONCURRENCY", d.concurrency).max(1),
            timeout_secs: env_or("FERRY_RECONCILE_TIMEOUT_SECS", d.timeout_secs),
            compare_parallelism: env_or("FERRY_COMPARE_PARALLELISM", d.compare_parallelism).max(1),
        }
    }

    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("FERRY_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_or("FERRY_TEST_GARBAGE", 7usize), 7);
        std::env::set_var("FERRY_TEST_GARBAGE", "11");
        assert_eq!(env_or("FERRY_TEST_GARBAGE", 7usize), 11);
    }
}
