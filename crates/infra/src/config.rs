//! Queue runtime configuration.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

/// Tunables for a [`JobQueue`](crate::jobs::JobQueue).
///
/// `Default` gives production values. `from_env` overlays `COURIER_*`
/// environment variables on top of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Owner id written to `locked_by` on claimed rows.
    pub claimant_id: String,
    pub enqueue_workers: usize,
    /// Bound of the enqueue request channel; a full channel blocks producers.
    pub enqueue_capacity: usize,
    /// Insert attempts beyond the first before a request is dropped.
    pub enqueue_max_retries: u32,
    /// Workers per job type.
    pub processor_workers: usize,
    /// Pending wake count that triggers an immediate claim.
    pub prefetch_threshold: usize,
    pub prefetch_flush_interval: Duration,
    pub catch_up_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Maximum rows this claimant may hold in `running` at once.
    pub claim_capacity: usize,
    /// Bound of the wake channel and cap of the pending counter.
    pub wake_capacity: usize,
    /// `None` disables the stale-job reaper.
    pub reaper_interval: Option<Duration>,
    pub stale_after: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_secs(30);
        Self {
            claimant_id: format!("courier-{}", Uuid::now_v7()),
            enqueue_workers: 50,
            enqueue_capacity: 10_000,
            enqueue_max_retries: 15,
            processor_workers: 100,
            prefetch_threshold: 500,
            prefetch_flush_interval: Duration::from_secs(5),
            catch_up_interval: Duration::from_secs(60),
            heartbeat_interval,
            claim_capacity: 500,
            wake_capacity: 10_000,
            reaper_interval: None,
            stale_after: heartbeat_interval * 2,
        }
    }
}

impl QueueConfig {
    /// Defaults overlaid with `COURIER_*` environment variables.
    ///
    /// The claimant id falls back to `HOSTNAME` when `COURIER_CLAIMANT_ID` is
    /// unset. Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(id) = lookup("COURIER_CLAIMANT_ID")
            .or_else(|| lookup("HOSTNAME"))
            .filter(|id| !id.trim().is_empty())
        {
            config.claimant_id = id;
        }

        set_parsed(&lookup, "COURIER_ENQUEUE_WORKERS", &mut config.enqueue_workers);
        set_parsed(&lookup, "COURIER_ENQUEUE_CAPACITY", &mut config.enqueue_capacity);
        set_parsed(&lookup, "COURIER_ENQUEUE_MAX_RETRIES", &mut config.enqueue_max_retries);
        set_parsed(&lookup, "COURIER_PROCESSOR_WORKERS", &mut config.processor_workers);
        set_parsed(&lookup, "COURIER_PREFETCH_THRESHOLD", &mut config.prefetch_threshold);
        set_parsed(&lookup, "COURIER_CLAIM_CAPACITY", &mut config.claim_capacity);
        set_parsed(&lookup, "COURIER_WAKE_CAPACITY", &mut config.wake_capacity);

        if let Some(ms) = parsed::<u64>(&lookup, "COURIER_PREFETCH_FLUSH_MS") {
            config.prefetch_flush_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "COURIER_CATCH_UP_SECS") {
            config.catch_up_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "COURIER_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs);
            config.stale_after = config.heartbeat_interval * 2;
        }
        if let Some(secs) = parsed::<u64>(&lookup, "COURIER_STALE_AFTER_SECS") {
            config.stale_after = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "COURIER_REAPER_SECS") {
            config.reaper_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config
    }

    pub fn with_claimant_id(mut self, id: impl Into<String>) -> Self {
        self.claimant_id = id.into();
        self
    }

    pub fn with_enqueue_workers(mut self, workers: usize) -> Self {
        self.enqueue_workers = workers;
        self
    }

    pub fn with_enqueue_capacity(mut self, capacity: usize) -> Self {
        self.enqueue_capacity = capacity;
        self
    }

    pub fn with_enqueue_max_retries(mut self, retries: u32) -> Self {
        self.enqueue_max_retries = retries;
        self
    }

    pub fn with_processor_workers(mut self, workers: usize) -> Self {
        self.processor_workers = workers;
        self
    }

    pub fn with_prefetch_threshold(mut self, threshold: usize) -> Self {
        self.prefetch_threshold = threshold;
        self
    }

    pub fn with_prefetch_flush_interval(mut self, interval: Duration) -> Self {
        self.prefetch_flush_interval = interval;
        self
    }

    pub fn with_catch_up_interval(mut self, interval: Duration) -> Self {
        self.catch_up_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_claim_capacity(mut self, capacity: usize) -> Self {
        self.claim_capacity = capacity;
        self
    }

    pub fn with_wake_capacity(mut self, capacity: usize) -> Self {
        self.wake_capacity = capacity;
        self
    }

    pub fn with_reaper(mut self, interval: Duration, stale_after: Duration) -> Self {
        self.reaper_interval = Some(interval);
        self.stale_after = stale_after;
        self
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}

fn set_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(value) = parsed(lookup, key) {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = QueueConfig::default();
        assert!(config.claimant_id.starts_with("courier-"));
        assert_eq!(config.enqueue_workers, 50);
        assert_eq!(config.enqueue_capacity, 10_000);
        assert_eq!(config.enqueue_max_retries, 15);
        assert_eq!(config.processor_workers, 100);
        assert_eq!(config.prefetch_threshold, 500);
        assert_eq!(config.prefetch_flush_interval, Duration::from_secs(5));
        assert_eq!(config.catch_up_interval, Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.claim_capacity, 500);
        assert_eq!(config.reaper_interval, None);
        assert_eq!(config.stale_after, Duration::from_secs(60));
    }

    #[test]
    fn env_overrides_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("COURIER_CLAIMANT_ID", "worker-7"),
            ("COURIER_PREFETCH_THRESHOLD", "100"),
            ("COURIER_PREFETCH_FLUSH_MS", "250"),
            ("COURIER_HEARTBEAT_SECS", "10"),
            ("COURIER_REAPER_SECS", "15"),
        ]));

        assert_eq!(config.claimant_id, "worker-7");
        assert_eq!(config.prefetch_threshold, 100);
        assert_eq!(config.prefetch_flush_interval, Duration::from_millis(250));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.stale_after, Duration::from_secs(20));
        assert_eq!(config.reaper_interval, Some(Duration::from_secs(15)));
    }

    #[test]
    fn hostname_is_the_claimant_fallback() {
        let config = QueueConfig::from_lookup(lookup(&[("HOSTNAME", "box-1")]));
        assert_eq!(config.claimant_id, "box-1");
    }

    #[test]
    fn unparsable_values_keep_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("COURIER_ENQUEUE_WORKERS", "many"),
            ("COURIER_REAPER_SECS", "0"),
        ]));
        assert_eq!(config.enqueue_workers, 50);
        assert_eq!(config.reaper_interval, None);
    }
}
