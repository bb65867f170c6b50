//! Collector tuning, with environment overrides.

use std::time::Duration;

use crate::scheduler::QueueConfig;

/// Worker count, queue bound and per-fetch timeout for a collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    pub workers: usize,
    pub max_queue_size: usize,
    pub fetch_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_queue_size: 1000,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

impl CollectorConfig {
    /// Defaults overridden by `TELEMETRY_WORKERS`, `TELEMETRY_MAX_QUEUE` and
    /// `TELEMETRY_FETCH_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: read_env_usize("TELEMETRY_WORKERS", defaults.workers).max(1),
            max_queue_size: read_env_usize("TELEMETRY_MAX_QUEUE", defaults.max_queue_size),
            fetch_timeout: Duration::from_secs(read_env_u64(
                "TELEMETRY_FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout.as_secs(),
            )),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            concurrency: self.workers,
            max_size: self.max_queue_size,
        }
    }
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_usize(name: &str, default_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides() {
        std::env::set_var("TELEMETRY_WORKERS", "0");
        std::env::set_var("TELEMETRY_MAX_QUEUE", "12");
        std::env::set_var("TELEMETRY_FETCH_TIMEOUT_SECS", "not-a-number");
        let config = CollectorConfig::from_env();
        std::env::remove_var("TELEMETRY_WORKERS");
        std::env::remove_var("TELEMETRY_MAX_QUEUE");
        std::env::remove_var("TELEMETRY_FETCH_TIMEOUT_SECS");

        assert_eq!(config.workers, 1);
        assert_eq!(config.max_queue_size, 12);
        assert_eq!(config.fetch_timeout, Duration::from_secs(30));
        assert_eq!(config.queue_config().max_size, 12);
    }
}
