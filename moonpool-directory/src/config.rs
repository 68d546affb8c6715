//! Directory configuration.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use moonpool_directory::{CacheStrategy, DirectoryConfig};
//!
//! let config = DirectoryConfig::builder()
//!     .replication_factor(2)
//!     .cache_strategy(CacheStrategy::Adaptive)
//!     .retry_delay(Duration::from_millis(100))
//!     .build()
//!     .expect("valid config");
//! assert_eq!(config.replication_factor(), 2);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DirectoryConfigError;
use crate::types::NodeAddress;

/// Which cache implementation the directory uses for remote lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStrategy {
    /// Never cache; every non-local lookup goes to the owner.
    None,
    /// Bounded LRU without freshness tracking.
    Lru,
    /// Bounded LRU whose entries are revalidated on an adaptive schedule.
    Adaptive,
}

/// Tunables of one node's grain directory.
///
/// Deserialized configurations go through the same validation as
/// [`DirectoryConfigBuilder::build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedConfig")]
pub struct DirectoryConfig {
    replication_factor: usize,
    cache_strategy: CacheStrategy,
    cache_size: usize,
    initial_cache_ttl: Duration,
    max_cache_ttl: Duration,
    cache_ttl_growth_factor: f64,
    cache_refresh_period: Duration,
    retries: u32,
    retry_delay: Duration,
    call_timeout: Duration,
    replication_period: Duration,
    replication_chunk_size: usize,
    full_replication_cycle: Option<u64>,
    lazy_deregistration_delay: Duration,
    activation_race_delay: Duration,
    anti_entropy_period: Option<Duration>,
    seed: Option<NodeAddress>,
}

/// Wire shape of [`DirectoryConfig`] before validation.
#[derive(Deserialize)]
struct UncheckedConfig {
    replication_factor: usize,
    cache_strategy: CacheStrategy,
    cache_size: usize,
    initial_cache_ttl: Duration,
    max_cache_ttl: Duration,
    cache_ttl_growth_factor: f64,
    cache_refresh_period: Duration,
    retries: u32,
    retry_delay: Duration,
    call_timeout: Duration,
    replication_period: Duration,
    replication_chunk_size: usize,
    full_replication_cycle: Option<u64>,
    lazy_deregistration_delay: Duration,
    activation_race_delay: Duration,
    anti_entropy_period: Option<Duration>,
    seed: Option<NodeAddress>,
}

impl TryFrom<UncheckedConfig> for DirectoryConfig {
    type Error = DirectoryConfigError;

    fn try_from(raw: UncheckedConfig) -> Result<Self, Self::Error> {
        DirectoryConfigBuilder {
            config: DirectoryConfig {
                replication_factor: raw.replication_factor,
                cache_strategy: raw.cache_strategy,
                cache_size: raw.cache_size,
                initial_cache_ttl: raw.initial_cache_ttl,
                max_cache_ttl: raw.max_cache_ttl,
                cache_ttl_growth_factor: raw.cache_ttl_growth_factor,
                cache_refresh_period: raw.cache_refresh_period,
                retries: raw.retries,
                retry_delay: raw.retry_delay,
                call_timeout: raw.call_timeout,
                replication_period: raw.replication_period,
                replication_chunk_size: raw.replication_chunk_size,
                full_replication_cycle: raw.full_replication_cycle,
                lazy_deregistration_delay: raw.lazy_deregistration_delay,
                activation_race_delay: raw.activation_race_delay,
                anti_entropy_period: raw.anti_entropy_period,
                seed: raw.seed,
            },
        }
        .build()
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            replication_factor: 1,
            cache_strategy: CacheStrategy::Adaptive,
            cache_size: 1_000_000,
            initial_cache_ttl: Duration::from_secs(30),
            max_cache_ttl: Duration::from_secs(240),
            cache_ttl_growth_factor: 2.0,
            cache_refresh_period: Duration::from_secs(10),
            retries: 3,
            retry_delay: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            replication_period: Duration::from_secs(10),
            replication_chunk_size: 500,
            full_replication_cycle: None,
            lazy_deregistration_delay: Duration::ZERO,
            activation_race_delay: Duration::from_secs(1),
            anti_entropy_period: None,
            seed: None,
        }
    }
}

impl DirectoryConfig {
    /// Start building a directory configuration from the defaults.
    pub fn builder() -> DirectoryConfigBuilder {
        DirectoryConfigBuilder {
            config: DirectoryConfig::default(),
        }
    }

    /// Number of ring neighbours holding a replica of each partition.
    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Cache implementation.
    pub fn cache_strategy(&self) -> CacheStrategy {
        self.cache_strategy
    }

    /// Maximum number of cached grains.
    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    /// Freshness timer given to a newly cached entry.
    pub fn initial_cache_ttl(&self) -> Duration {
        self.initial_cache_ttl
    }

    /// Upper bound of the freshness timer.
    pub fn max_cache_ttl(&self) -> Duration {
        self.max_cache_ttl
    }

    /// Factor applied to the timer each time an entry is confirmed fresh.
    pub fn cache_ttl_growth_factor(&self) -> f64 {
        self.cache_ttl_growth_factor
    }

    /// How often expired cache entries are revalidated.
    pub fn cache_refresh_period(&self) -> Duration {
        self.cache_refresh_period
    }

    /// Retry budget of a routed directory call.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Pause between two attempts of a routed call.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Deadline of a single call to a peer.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Interval between two replication rounds.
    pub fn replication_period(&self) -> Duration {
        self.replication_period
    }

    /// Maximum number of entries per replication message.
    pub fn replication_chunk_size(&self) -> usize {
        self.replication_chunk_size
    }

    /// Every how many rounds a full replica is shipped (`None`: only when
    /// forced by membership changes).
    pub fn full_replication_cycle(&self) -> Option<u64> {
        self.full_replication_cycle
    }

    /// Window during which a conditional unregister is honoured.
    pub fn lazy_deregistration_delay(&self) -> Duration {
        self.lazy_deregistration_delay
    }

    /// Pause before rerunning the cross-cluster creation protocol after a
    /// race, and deadline of anti-entropy fan-out calls.
    pub fn activation_race_delay(&self) -> Duration {
        self.activation_race_delay
    }

    /// Interval of the anti-entropy loop on the cluster gateway, if enabled.
    pub fn anti_entropy_period(&self) -> Option<Duration> {
        self.anti_entropy_period
    }

    /// Seed node hosting well-known singleton grains.
    pub fn seed(&self) -> Option<&NodeAddress> {
        self.seed.as_ref()
    }
}

/// Builder for [`DirectoryConfig`].
#[derive(Debug, Clone)]
pub struct DirectoryConfigBuilder {
    config: DirectoryConfig,
}

impl DirectoryConfigBuilder {
    /// Set the replication factor (0 disables replication).
    pub fn replication_factor(mut self, factor: usize) -> Self {
        self.config.replication_factor = factor;
        self
    }

    /// Set the cache implementation.
    pub fn cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.config.cache_strategy = strategy;
        self
    }

    /// Set the maximum number of cached grains.
    pub fn cache_size(mut self, size: usize) -> Self {
        self.config.cache_size = size;
        self
    }

    /// Set the initial and maximum freshness timers.
    pub fn cache_ttl(mut self, initial: Duration, max: Duration) -> Self {
        self.config.initial_cache_ttl = initial;
        self.config.max_cache_ttl = max;
        self
    }

    /// Set the freshness timer growth factor.
    pub fn cache_ttl_growth_factor(mut self, factor: f64) -> Self {
        self.config.cache_ttl_growth_factor = factor;
        self
    }

    /// Set the cache revalidation period.
    pub fn cache_refresh_period(mut self, period: Duration) -> Self {
        self.config.cache_refresh_period = period;
        self
    }

    /// Set the retry budget of routed calls.
    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    /// Set the pause between two attempts of a routed call.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Set the per-call deadline.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Set the replication round interval.
    pub fn replication_period(mut self, period: Duration) -> Self {
        self.config.replication_period = period;
        self
    }

    /// Set the replication chunk size.
    pub fn replication_chunk_size(mut self, size: usize) -> Self {
        self.config.replication_chunk_size = size;
        self
    }

    /// Ship a full replica every `cycle` rounds.
    pub fn full_replication_cycle(mut self, cycle: u64) -> Self {
        self.config.full_replication_cycle = Some(cycle);
        self
    }

    /// Set the lazy deregistration window.
    pub fn lazy_deregistration_delay(mut self, delay: Duration) -> Self {
        self.config.lazy_deregistration_delay = delay;
        self
    }

    /// Set the cross-cluster race delay.
    pub fn activation_race_delay(mut self, delay: Duration) -> Self {
        self.config.activation_race_delay = delay;
        self
    }

    /// Enable the anti-entropy loop on the cluster gateway.
    pub fn anti_entropy_period(mut self, period: Duration) -> Self {
        self.config.anti_entropy_period = Some(period);
        self
    }

    /// Set the seed node.
    pub fn seed(mut self, seed: NodeAddress) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<DirectoryConfig, DirectoryConfigError> {
        let config = self.config;
        let growth = config.cache_ttl_growth_factor;
        if !growth.is_finite() || growth < 1.0 {
            return Err(DirectoryConfigError::InvalidGrowthFactor(
                config.cache_ttl_growth_factor,
            ));
        }
        if config.initial_cache_ttl > config.max_cache_ttl {
            return Err(DirectoryConfigError::InitialTtlAboveMax);
        }
        if config.replication_chunk_size == 0 {
            return Err(DirectoryConfigError::EmptyReplicationChunk);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DirectoryConfig::default();
        assert_eq!(config.retries(), 3);
        assert_eq!(config.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.replication_chunk_size(), 500);
        assert_eq!(config.cache_strategy(), CacheStrategy::Adaptive);
        assert!(config.full_replication_cycle().is_none());
        assert!(config.seed().is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let config = DirectoryConfig::builder()
            .replication_factor(0)
            .cache_strategy(CacheStrategy::Lru)
            .cache_size(16)
            .retries(5)
            .full_replication_cycle(10)
            .build()
            .expect("valid config");

        assert_eq!(config.replication_factor(), 0);
        assert_eq!(config.cache_strategy(), CacheStrategy::Lru);
        assert_eq!(config.cache_size(), 16);
        assert_eq!(config.retries(), 5);
        assert_eq!(config.full_replication_cycle(), Some(10));
    }

    #[test]
    fn test_rejects_shrinking_growth_factor() {
        let result = DirectoryConfig::builder()
            .cache_ttl_growth_factor(0.5)
            .build();
        assert_eq!(result, Err(DirectoryConfigError::InvalidGrowthFactor(0.5)));
    }

    #[test]
    fn test_rejects_non_finite_growth_factor() {
        for growth in [f64::INFINITY, f64::NAN] {
            let result = DirectoryConfig::builder()
                .cache_ttl_growth_factor(growth)
                .build();
            assert!(
                matches!(result, Err(DirectoryConfigError::InvalidGrowthFactor(_))),
                "growth {growth} accepted"
            );
        }
    }

    #[test]
    fn test_huge_finite_growth_factor_is_accepted() {
        // the cache caps the grown timer at the maximum TTL
        let config = DirectoryConfig::builder()
            .cache_ttl_growth_factor(1e300)
            .build()
            .expect("valid config");
        assert_eq!(config.cache_ttl_growth_factor(), 1e300);
    }

    #[test]
    fn test_rejects_initial_ttl_above_max() {
        let result = DirectoryConfig::builder()
            .cache_ttl(Duration::from_secs(10), Duration::from_secs(1))
            .build();
        assert_eq!(result, Err(DirectoryConfigError::InitialTtlAboveMax));
    }

    #[test]
    fn test_rejects_empty_chunks() {
        let result = DirectoryConfig::builder().replication_chunk_size(0).build();
        assert_eq!(result, Err(DirectoryConfigError::EmptyReplicationChunk));
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = DirectoryConfig::builder()
            .anti_entropy_period(Duration::from_secs(5))
            .build()
            .expect("valid config");
        let json = serde_json::to_string(&config).expect("serialize");
        let decoded: DirectoryConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(config, decoded);
    }

    #[test]
    fn test_deserialize_validates() {
        let json = serde_json::to_string(&DirectoryConfig::default()).expect("serialize");

        let empty_chunks = json.replace(
            "\"replication_chunk_size\":500",
            "\"replication_chunk_size\":0",
        );
        assert_ne!(empty_chunks, json);
        let error = serde_json::from_str::<DirectoryConfig>(&empty_chunks)
            .expect_err("empty chunks rejected");
        assert!(
            error.to_string().contains("replication chunk size"),
            "{error}"
        );

        let shrinking = json.replace(
            "\"cache_ttl_growth_factor\":2.0",
            "\"cache_ttl_growth_factor\":0.5",
        );
        assert_ne!(shrinking, json);
        assert!(serde_json::from_str::<DirectoryConfig>(&shrinking).is_err());
    }
}
