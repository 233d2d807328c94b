use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_IMAGE: &str = "memcached:1.6.26-alpine3.19";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Image used when a resource does not name one.
    pub image: String,
    /// Delay before re-checking a freshly created child.
    pub create_requeue: Duration,
    /// Re-read attempts per write after an optimistic-concurrency conflict.
    pub conflict_retries: u32,
    pub error_backoff_initial: Duration,
    pub error_backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            create_requeue: Duration::from_secs(60),
            conflict_retries: 3,
            error_backoff_initial: Duration::from_secs(1),
            error_backoff_max: Duration::from_secs(300),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> { std::env::var(key).ok().and_then(|s| s.trim().parse().ok()) }

impl ControllerConfig {
    /// Defaults overridden by `TETHER_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            image: std::env::var("TETHER_MEMCACHED_IMAGE").ok().filter(|s| !s.trim().is_empty()).unwrap_or(d.image),
            create_requeue: env_parse("TETHER_CREATE_REQUEUE_SECS").map(Duration::from_secs).unwrap_or(d.create_requeue),
            conflict_retries: env_parse("TETHER_CONFLICT_RETRIES").unwrap_or(d.conflict_retries),
            error_backoff_initial: env_parse("TETHER_ERROR_BACKOFF_INITIAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.error_backoff_initial),
            error_backoff_max: env_parse("TETHER_ERROR_BACKOFF_MAX_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.error_backoff_max),
        }
    }
}
