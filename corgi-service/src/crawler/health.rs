//! Per-instance crawl health
//!
//! Tracks consecutive failures per instance; at the configured threshold
//! the instance is marked unhealthy for a cool-down period and crawl
//! cycles skip it until the cool-down lapses.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::config::CrawlerConfig;

/// Health record for one instance
#[derive(Debug, Clone, Default)]
pub struct InstanceHealth {
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// When the instance last answered successfully
    pub last_success_at: Option<DateTime<Utc>>,
    /// Until when the instance is considered unhealthy
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Registry of instance health records
pub struct HealthRegistry {
    entries: DashMap<String, InstanceHealth>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl HealthRegistry {
    /// Build from crawler configuration
    pub fn new(config: &CrawlerConfig) -> Self {
        Self {
            entries: DashMap::new(),
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::seconds(config.cooldown_secs.min(i64::MAX as u64) as i64),
        }
    }

    /// Whether the instance may be crawled right now
    pub fn is_healthy(&self, instance: &str) -> bool {
        match self.entries.get(instance) {
            Some(health) => match health.cooldown_until {
                Some(until) => until <= Utc::now(),
                None => true,
            },
            None => true,
        }
    }

    /// Record a successful request, clearing failure state
    pub fn record_success(&self, instance: &str) {
        let mut entry = self.entries.entry(instance.to_string()).or_default();
        entry.consecutive_failures = 0;
        entry.last_success_at = Some(Utc::now());
        entry.cooldown_until = None;
    }

    /// Record a failed request. Returns `true` when this failure pushed the
    /// instance over the threshold into cool-down.
    pub fn record_failure(&self, instance: &str) -> bool {
        let mut entry = self.entries.entry(instance.to_string()).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.failure_threshold && entry.cooldown_until.is_none() {
            entry.cooldown_until = Some(Utc::now() + self.cooldown);
            tracing::warn!(
                instance,
                failures = entry.consecutive_failures,
                cooldown_secs = self.cooldown.num_seconds(),
                "instance marked unhealthy"
            );
            return true;
        }
        false
    }

    /// Current record for an instance
    pub fn snapshot(&self, instance: &str) -> InstanceHealth {
        self.entries
            .get(instance)
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> HealthRegistry {
        HealthRegistry::new(&CrawlerConfig::default())
    }

    #[test]
    fn unknown_instances_are_healthy() {
        assert!(registry().is_healthy("mastodon.social"));
    }

    #[test]
    fn threshold_failures_trigger_cooldown() {
        let registry = registry();
        assert!(!registry.record_failure("m.s"));
        assert!(!registry.record_failure("m.s"));
        // Third consecutive failure crosses the default threshold.
        assert!(registry.record_failure("m.s"));
        assert!(!registry.is_healthy("m.s"));

        let health = registry.snapshot("m.s");
        assert_eq!(health.consecutive_failures, 3);
        assert!(health.cooldown_until.is_some());
    }

    #[test]
    fn success_resets_failures_and_cooldown() {
        let registry = registry();
        for _ in 0..3 {
            registry.record_failure("m.s");
        }
        assert!(!registry.is_healthy("m.s"));

        registry.record_success("m.s");
        assert!(registry.is_healthy("m.s"));
        let health = registry.snapshot("m.s");
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_success_at.is_some());
    }
}
