//! Scheduler configuration.

use std::time::Duration;

pub const DEFAULT_MAX_PAYLOAD_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of slots, i.e. maximum concurrent workers.
    pub pool_size: usize,
    /// Spawn attempts per request before it fails.
    pub max_spawn_attempts: u32,
    pub spawn_retry_delay: Duration,
    pub reap_interval: Duration,
    /// Time an aborted worker gets between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    pub max_payload_len: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_spawn_attempts: 3,
            spawn_retry_delay: Duration::from_millis(100),
            reap_interval: Duration::from_millis(500),
            kill_grace: Duration::from_secs(2),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `THUMBPOOL_WORKERS` and `THUMBPOOL_MAX_PAYLOAD`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = read_env("THUMBPOOL_WORKERS", |n: &usize| *n > 0) {
            config.pool_size = n;
        }
        if let Some(n) = read_env("THUMBPOOL_MAX_PAYLOAD", |n: &u64| *n > 0) {
            config.max_payload_len = n;
        }
        config
    }

    pub fn with_pool_size(mut self, n: usize) -> Self {
        self.pool_size = n.max(1);
        self
    }

    pub fn with_max_spawn_attempts(mut self, n: u32) -> Self {
        self.max_spawn_attempts = n.max(1);
        self
    }

    pub fn with_spawn_retry_delay(mut self, delay: Duration) -> Self {
        self.spawn_retry_delay = delay;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_max_payload_len(mut self, len: u64) -> Self {
        self.max_payload_len = len;
        self
    }
}

fn read_env<T: std::str::FromStr>(name: &str, valid: impl Fn(&T) -> bool) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => Some(value),
        _ => {
            tracing::warn!(var = name, value = %raw, "Ignoring invalid environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.max_spawn_attempts, 3);
        assert_eq!(config.spawn_retry_delay, Duration::from_millis(100));
        assert_eq!(config.kill_grace, Duration::from_secs(2));
        assert_eq!(config.max_payload_len, 64 * 1024 * 1024);
    }

    #[test]
    fn builder_clamps_zero_pool_size() {
        let config = SchedulerConfig::new().with_pool_size(0).with_max_spawn_attempts(0);
        assert_eq!(config.pool_size, 1);
        assert_eq!(config.max_spawn_attempts, 1);
    }

    #[test]
    fn env_values_are_validated() {
        assert_eq!(read_env::<usize>("THUMBPOOL_TEST_UNSET_VAR", |_| true), None);
        // Safety: only this test touches this variable.
        unsafe { std::env::set_var("THUMBPOOL_TEST_WORKERS", "zero") };
        assert_eq!(read_env::<usize>("THUMBPOOL_TEST_WORKERS", |_| true), None);
        unsafe { std::env::set_var("THUMBPOOL_TEST_WORKERS", " 8 ") };
        assert_eq!(read_env::<usize>("THUMBPOOL_TEST_WORKERS", |n| *n > 0), Some(8));
        unsafe { std::env::set_var("THUMBPOOL_TEST_WORKERS", "0") };
        assert_eq!(read_env::<usize>("THUMBPOOL_TEST_WORKERS", |n| *n > 0), None);
        unsafe { std::env::remove_var("THUMBPOOL_TEST_WORKERS") };
    }
}
