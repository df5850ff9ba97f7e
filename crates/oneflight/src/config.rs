use std::time::Duration;

use serde::Deserialize;

/// Fine-tuning for a [`Resolver`](crate::Resolver).
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ResolverConfig {
    /// How long computed values are retained as fallback data (item age).
    ///
    /// This is a coarse garbage-collection window, independent of any
    /// per-call lifetime: entries past it are dropped entirely, while
    /// younger entries stay available as stale fallbacks.
    #[serde(with = "humantime_serde")]
    pub retain_for: Duration,

    /// Maximum number of entries held in memory.
    pub capacity: u64,

    /// Maximum number of concurrently running stale-triggered refreshes.
    ///
    /// Explicitly requested refreshes are not counted against this.
    pub max_stale_refreshes: isize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            retain_for: Duration::from_secs(3600 * 6),
            capacity: 100 * 1024,
            max_stale_refreshes: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: ResolverConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ResolverConfig::default());
        assert_eq!(config.retain_for, Duration::from_secs(6 * 3600));
    }

    #[test]
    fn test_humantime_durations() {
        let config: ResolverConfig = serde_json::from_str(
            r#"{"retain_for": "15min", "capacity": 64, "max_stale_refreshes": 1}"#,
        )
        .unwrap();
        assert_eq!(config.retain_for, Duration::from_secs(15 * 60));
        assert_eq!(config.capacity, 64);
        assert_eq!(config.max_stale_refreshes, 1);
    }
}
