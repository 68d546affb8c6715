//! Caches of directory entries owned by other nodes.
//!
//! A node that does not own a grain's directory entry remembers the answer
//! of the last remote lookup so the next call can be routed without a round
//! trip. Entries carry the owner's [`VersionTag`], which lets the
//! background maintainer revalidate them cheaply.
//!
//! Three implementations are available, picked by [`create_cache`] from
//! [`CacheStrategy`]:
//!
//! | Strategy | Type | Revalidation |
//! |---|---|---|
//! | `None` | [`NullCache`] | n/a |
//! | `Lru` | [`LruDirectoryCache`] | never |
//! | `Adaptive` | [`AdaptiveCache`] | expiration timer grows while the owner confirms |

mod adaptive;
mod lru_cache;
pub(crate) mod maintainer;

use std::fmt;

pub use adaptive::AdaptiveCache;
pub use lru_cache::{LruDirectoryCache, NullCache};

use crate::config::{CacheStrategy, DirectoryConfig};
use crate::types::{ActivationId, GrainId, NodeAddress, VersionTag};

/// Cached activations of one grain.
pub type CachedActivations = Vec<(NodeAddress, ActivationId)>;

/// Cache of remote directory entries.
///
/// Lookups never check staleness; stale entries are found and refreshed by
/// the cache maintainer, or invalidated by the directory on unregister.
pub trait DirectoryCache: fmt::Debug {
    /// Insert or replace an entry. Resets its freshness timer.
    fn add_or_update(&mut self, grain: GrainId, value: CachedActivations, etag: VersionTag);

    /// Remove an entry. Returns `true` if it existed.
    fn remove(&mut self, grain: &GrainId) -> bool;

    /// Drop one activation from an entry; the entry goes away with its last
    /// activation. Returns `true` if the activation was cached.
    fn remove_activation(&mut self, grain: &GrainId, activation: &ActivationId) -> bool;

    /// Remove every entry.
    fn clear(&mut self);

    /// Cached activations of `grain`, marking the entry as recently used.
    fn lookup(&mut self, grain: &GrainId) -> Option<CachedActivations>;

    /// Snapshot of every entry with its tag.
    fn key_values(&self) -> Vec<(GrainId, CachedActivations, VersionTag)>;

    /// Record that the owner confirmed the entry is still current.
    /// Returns `false` if the entry is gone.
    fn mark_as_fresh(&mut self, grain: &GrainId) -> bool;

    /// Entries whose freshness timer ran out.
    fn expired_entries(&self) -> Vec<(GrainId, CachedActivations, VersionTag)>;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Whether the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the cache selected by `config`.
pub fn create_cache(config: &DirectoryConfig) -> Box<dyn DirectoryCache> {
    match config.cache_strategy() {
        CacheStrategy::None => Box::new(NullCache),
        CacheStrategy::Lru => Box::new(LruDirectoryCache::new(config.cache_size())),
        CacheStrategy::Adaptive => Box::new(AdaptiveCache::new(
            config.cache_size(),
            config.initial_cache_ttl(),
            config.max_cache_ttl(),
            config.cache_ttl_growth_factor(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GrainType;

    #[test]
    fn test_factory_honours_strategy() {
        let grain = GrainId::new(GrainType(1), "g");
        for (strategy, keeps) in [
            (CacheStrategy::None, false),
            (CacheStrategy::Lru, true),
            (CacheStrategy::Adaptive, true),
        ] {
            let config = DirectoryConfig::builder()
                .cache_strategy(strategy)
                .cache_size(4)
                .build()
                .expect("valid config");
            let mut cache = create_cache(&config);
            cache.add_or_update(grain.clone(), Vec::new(), VersionTag(1));
            assert_eq!(cache.lookup(&grain).is_some(), keeps, "{strategy:?}");
        }
    }
}
