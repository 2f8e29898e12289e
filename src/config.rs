//! Engine configuration
//!
//! Every timing constant in the posting and routing protocols is tunable.
//! The defaults reproduce the values the algorithms were originally tuned
//! with, but they are policy, not protocol: deployments with different
//! backend GC behavior are expected to adjust them.

use serde::Deserialize;
use std::time::Duration;

/// Tuning for the FIFO posting retry loop.
///
/// `max_post_duration_secs` must stay below the minimum message TTL the
/// deployment accepts, so retries can never outlive the window in which the
/// colliding messages would have expired and been collected.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostingConfig {
    /// Maximum number of insert attempts before reporting a conflict.
    pub max_attempts: usize,
    /// Upper bound of the linear backoff ramp, in milliseconds.
    pub max_retry_sleep_ms: u64,
    /// Upper bound of the random jitter added to each backoff, in
    /// milliseconds.
    pub max_retry_jitter_ms: u64,
    /// Hard wall-clock ceiling on one post operation, in seconds.
    pub max_post_duration_secs: i64,
    /// How long the counter must sit unchanged before a competing producer
    /// may force-increment it to break a stall, in seconds.
    pub counter_stall_window_secs: i64,
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1000,
            max_retry_sleep_ms: 100,
            max_retry_jitter_ms: 5,
            max_post_duration_secs: 45,
            counter_stall_window_secs: 5,
        }
    }
}

impl PostingConfig {
    pub fn max_retry_sleep(&self) -> Duration {
        Duration::from_millis(self.max_retry_sleep_ms)
    }

    pub fn max_retry_jitter(&self) -> Duration {
        Duration::from_millis(self.max_retry_jitter_ms)
    }
}

/// Tuning for the pool catalog's routing layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// TTL of the (project, queue) -> pool lookup cache, in seconds. A
    /// queue deleted and recreated within this window may transiently route
    /// to the old pool.
    pub lookup_cache_ttl_secs: u64,
    /// When enabled, lookups for unmapped queues fall back to
    /// `default_pool_uri` instead of reporting the queue as unrouted.
    pub enable_virtual_pool: bool,
    pub default_pool_uri: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            lookup_cache_ttl_secs: 10,
            enable_virtual_pool: false,
            default_pool_uri: None,
        }
    }
}

impl CatalogConfig {
    pub fn lookup_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.lookup_cache_ttl_secs)
    }
}

/// Tuning for the queue registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// TTL of the positive-only queue-exists cache, in seconds.
    pub exists_cache_ttl_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            exists_cache_ttl_secs: 5,
        }
    }
}

impl RegistryConfig {
    pub fn exists_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.exists_cache_ttl_secs)
    }
}

/// Tuning for connection-loss retries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> crate::core::retry::RetryPolicy {
        crate::core::retry::RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }
}

/// Aggregate configuration for the whole engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub posting: PostingConfig,
    pub catalog: CatalogConfig,
    pub registry: RegistryConfig,
    pub retry: RetryConfig,
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}
