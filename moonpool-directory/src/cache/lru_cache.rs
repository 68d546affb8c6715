use std::num::NonZeroUsize;

use lru::LruCache;

use super::{CachedActivations, DirectoryCache};
use crate::types::{ActivationId, GrainId, VersionTag};

/// Cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

impl DirectoryCache for NullCache {
    fn add_or_update(&mut self, _grain: GrainId, _value: CachedActivations, _etag: VersionTag) {}

    fn remove(&mut self, _grain: &GrainId) -> bool {
        false
    }

    fn remove_activation(&mut self, _grain: &GrainId, _activation: &ActivationId) -> bool {
        false
    }

    fn clear(&mut self) {}

    fn lookup(&mut self, _grain: &GrainId) -> Option<CachedActivations> {
        None
    }

    fn key_values(&self) -> Vec<(GrainId, CachedActivations, VersionTag)> {
        Vec::new()
    }

    fn mark_as_fresh(&mut self, _grain: &GrainId) -> bool {
        false
    }

    fn expired_entries(&self) -> Vec<(GrainId, CachedActivations, VersionTag)> {
        Vec::new()
    }

    fn len(&self) -> usize {
        0
    }
}

/// Bounded LRU without freshness tracking.
///
/// Entries only leave through eviction or explicit invalidation.
#[derive(Debug)]
pub struct LruDirectoryCache {
    entries: LruCache<GrainId, (CachedActivations, VersionTag)>,
}

impl LruDirectoryCache {
    /// Create a cache holding at most `capacity` grains (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }
}

impl DirectoryCache for LruDirectoryCache {
    fn add_or_update(&mut self, grain: GrainId, value: CachedActivations, etag: VersionTag) {
        self.entries.put(grain, (value, etag));
    }

    fn remove(&mut self, grain: &GrainId) -> bool {
        self.entries.pop(grain).is_some()
    }

    fn remove_activation(&mut self, grain: &GrainId, activation: &ActivationId) -> bool {
        let Some((value, _)) = self.entries.peek_mut(grain) else {
            return false;
        };
        let before = value.len();
        value.retain(|(_, cached)| cached != activation);
        let removed = value.len() != before;
        if value.is_empty() {
            self.entries.pop(grain);
        }
        removed
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn lookup(&mut self, grain: &GrainId) -> Option<CachedActivations> {
        self.entries.get(grain).map(|(value, _)| value.clone())
    }

    fn key_values(&self) -> Vec<(GrainId, CachedActivations, VersionTag)> {
        self.entries
            .iter()
            .map(|(grain, (value, etag))| (grain.clone(), value.clone(), *etag))
            .collect()
    }

    fn mark_as_fresh(&mut self, grain: &GrainId) -> bool {
        self.entries.contains(grain)
    }

    fn expired_entries(&self) -> Vec<(GrainId, CachedActivations, VersionTag)> {
        Vec::new()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
