//! Engine configuration.

use crate::policy::Isolation;
use std::time::Duration;

/// Smallest accepted lock escalation threshold.
pub const MIN_ESCALATION_THRESHOLD: usize = 100;

/// Default lock escalation threshold.
pub const DEFAULT_ESCALATION_THRESHOLD: usize = 5000;

/// Configuration for a storage engine context.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a timed lock request waits before failing.
    pub lock_wait_timeout: Duration,

    /// Number of locks a transaction may hold before escalation is tried.
    pub escalation_threshold: usize,

    /// Whether user transactions flush the log when they commit.
    pub flush_log_on_commit: bool,

    /// Isolation of the default (record level) locking policy.
    pub default_isolation: Isolation,

    /// Whether the reference log forces the device after every append.
    pub sync_on_write: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_wait_timeout: Duration::from_secs(60),
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
            flush_log_on_commit: true,
            default_isolation: Isolation::Serializable,
            sync_on_write: false,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lock wait timeout.
    #[must_use]
    pub const fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    /// Sets the escalation threshold, clamped to [`MIN_ESCALATION_THRESHOLD`].
    #[must_use]
    pub const fn escalation_threshold(mut self, threshold: usize) -> Self {
        self.escalation_threshold = if threshold < MIN_ESCALATION_THRESHOLD {
            MIN_ESCALATION_THRESHOLD
        } else {
            threshold
        };
        self
    }

    /// Sets whether commits flush the log.
    #[must_use]
    pub const fn flush_log_on_commit(mut self, value: bool) -> Self {
        self.flush_log_on_commit = value;
        self
    }

    /// Sets the isolation used for new transactions' default policy.
    #[must_use]
    pub const fn default_isolation(mut self, isolation: Isolation) -> Self {
        self.default_isolation = isolation;
        self
    }

    /// Sets whether every log append is forced.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.escalation_threshold, 5000);
        assert!(config.flush_log_on_commit);
        assert_eq!(config.default_isolation, Isolation::Serializable);
        assert!(!config.sync_on_write);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .lock_wait_timeout(Duration::from_millis(50))
            .flush_log_on_commit(false)
            .default_isolation(Isolation::ReadCommitted);
        assert_eq!(config.lock_wait_timeout, Duration::from_millis(50));
        assert!(!config.flush_log_on_commit);
        assert_eq!(config.default_isolation, Isolation::ReadCommitted);
    }

    #[test]
    fn escalation_threshold_is_clamped() {
        assert_eq!(Config::new().escalation_threshold(10).escalation_threshold, 100);
        assert_eq!(Config::new().escalation_threshold(250).escalation_threshold, 250);
    }
}
