use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use super::{CachedActivations, DirectoryCache};
use crate::types::{ActivationId, GrainId, VersionTag};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedActivations,
    etag: VersionTag,
    created: Instant,
    last_refreshed: Instant,
    expiration_timer: Duration,
    num_accesses: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.last_refreshed + self.expiration_timer
    }
}

/// Bounded LRU whose entries carry a freshness timer.
///
/// A new or replaced entry gets `initial_ttl`. Each time the owner confirms
/// the entry is unchanged, the timer is multiplied by `growth` and capped
/// at `max_ttl`, so stable entries are revalidated less and less often.
pub struct AdaptiveCache {
    entries: LruCache<GrainId, CacheEntry>,
    initial_ttl: Duration,
    max_ttl: Duration,
    growth: f64,
    accesses: u64,
    hits: u64,
}

impl AdaptiveCache {
    /// Create a cache holding at most `capacity` grains (at least one).
    pub fn new(capacity: usize, initial_ttl: Duration, max_ttl: Duration, growth: f64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            initial_ttl,
            max_ttl,
            growth,
            accesses: 0,
            hits: 0,
        }
    }

    /// Current freshness timer of an entry.
    #[cfg(test)]
    pub(crate) fn expiration_timer(&self, grain: &GrainId) -> Option<Duration> {
        self.entries.peek(grain).map(|entry| entry.expiration_timer)
    }

    /// Number of lookups that hit this entry since it was inserted.
    #[cfg(test)]
    pub(crate) fn entry_accesses(&self, grain: &GrainId) -> Option<u64> {
        self.entries.peek(grain).map(|entry| entry.num_accesses)
    }

    /// When the entry was first inserted.
    #[cfg(test)]
    pub(crate) fn entry_created(&self, grain: &GrainId) -> Option<Instant> {
        self.entries.peek(grain).map(|entry| entry.created)
    }

    /// `(lookups, hits)` since creation.
    #[cfg(test)]
    pub(crate) fn stats(&self) -> (u64, u64) {
        (self.accesses, self.hits)
    }
}

impl fmt::Debug for AdaptiveCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.entries.cap())
            .field("accesses", &self.accesses)
            .field("hits", &self.hits)
            .finish()
    }
}

impl DirectoryCache for AdaptiveCache {
    fn add_or_update(&mut self, grain: GrainId, value: CachedActivations, etag: VersionTag) {
        let now = Instant::now();
        let created = self
            .entries
            .peek(&grain)
            .map_or(now, |existing| existing.created);
        self.entries.put(
            grain,
            CacheEntry {
                value,
                etag,
                created,
                last_refreshed: now,
                expiration_timer: self.initial_ttl,
                num_accesses: 0,
            },
        );
    }

    fn remove(&mut self, grain: &GrainId) -> bool {
        self.entries.pop(grain).is_some()
    }

    fn remove_activation(&mut self, grain: &GrainId, activation: &ActivationId) -> bool {
        let Some(entry) = self.entries.peek_mut(grain) else {
            return false;
        };
        let before = entry.value.len();
        entry.value.retain(|(_, cached)| cached != activation);
        let removed = entry.value.len() != before;
        if entry.value.is_empty() {
            self.entries.pop(grain);
        }
        removed
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn lookup(&mut self, grain: &GrainId) -> Option<CachedActivations> {
        self.accesses += 1;
        let entry = self.entries.get_mut(grain)?;
        self.hits += 1;
        entry.num_accesses += 1;
        Some(entry.value.clone())
    }

    fn key_values(&self) -> Vec<(GrainId, CachedActivations, VersionTag)> {
        self.entries
            .iter()
            .map(|(grain, entry)| (grain.clone(), entry.value.clone(), entry.etag))
            .collect()
    }

    fn mark_as_fresh(&mut self, grain: &GrainId) -> bool {
        let (growth, max_ttl) = (self.growth, self.max_ttl);
        match self.entries.peek_mut(grain) {
            Some(entry) => {
                entry.expiration_timer =
                    Duration::try_from_secs_f64(entry.expiration_timer.as_secs_f64() * growth)
                        .ok()
                        .map_or(max_ttl, |grown| grown.min(max_ttl));
                entry.last_refreshed = Instant::now();
                true
            }
            None => false,
        }
    }

    fn expired_entries(&self) -> Vec<(GrainId, CachedActivations, VersionTag)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(grain, entry)| (grain.clone(), entry.value.clone(), entry.etag))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GrainType;

    fn grain(key: &str) -> GrainId {
        GrainId::new(GrainType(1), key)
    }

    fn cache() -> AdaptiveCache {
        AdaptiveCache::new(16, Duration::from_secs(30), Duration::from_secs(240), 2.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_as_fresh_grows_timer_up_to_max() {
        let mut cache = cache();
        let g = grain("a");
        cache.add_or_update(g.clone(), Vec::new(), VersionTag(1));
        assert_eq!(cache.expiration_timer(&g), Some(Duration::from_secs(30)));

        for k in 1..=5u32 {
            assert!(cache.mark_as_fresh(&g));
            let expected = Duration::from_secs(30 * 2u64.pow(k)).min(Duration::from_secs(240));
            assert_eq!(
                cache.expiration_timer(&g),
                Some(expected),
                "after {k} refreshes"
            );
        }
        assert!(!cache.mark_as_fresh(&grain("missing")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_growth_caps_at_max() {
        for growth in [f64::INFINITY, f64::NAN, 1e300] {
            let mut cache =
                AdaptiveCache::new(4, Duration::from_secs(30), Duration::from_secs(240), growth);
            let g = grain("a");
            cache.add_or_update(g.clone(), Vec::new(), VersionTag(1));
            assert!(cache.mark_as_fresh(&g));
            assert_eq!(
                cache.expiration_timer(&g),
                Some(Duration::from_secs(240)),
                "growth {growth}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_or_update_resets_timer() {
        let mut cache = cache();
        let g = grain("a");
        cache.add_or_update(g.clone(), Vec::new(), VersionTag(1));
        cache.mark_as_fresh(&g);
        cache.mark_as_fresh(&g);
        cache.add_or_update(g.clone(), Vec::new(), VersionTag(2));
        assert_eq!(cache.expiration_timer(&g), Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_follows_timer() {
        let mut cache = cache();
        let g = grain("a");
        cache.add_or_update(g.clone(), Vec::new(), VersionTag(9));
        assert!(cache.expired_entries().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            cache.expired_entries(),
            vec![(g.clone(), Vec::new(), VersionTag(9))]
        );

        // lookup ignores staleness
        assert!(cache.lookup(&g).is_some());

        cache.mark_as_fresh(&g);
        assert!(cache.expired_entries().is_empty());
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.expired_entries().is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.expired_entries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_statistics() {
        let mut cache = cache();
        let g = grain("a");
        cache.add_or_update(g.clone(), Vec::new(), VersionTag(1));
        cache.lookup(&g);
        cache.lookup(&g);
        cache.lookup(&grain("missing"));
        assert_eq!(cache.stats(), (3, 2));
        assert_eq!(cache.entry_accesses(&g), Some(2));
        assert!(cache.entry_created(&g).is_some());
    }
}
