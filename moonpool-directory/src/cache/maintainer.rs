//! Background revalidation of expired cache entries.
//!
//! Every `cache_refresh_period` the maintainer collects the entries whose
//! freshness timer ran out and asks their owners, one batched
//! `lookup_many` per owner, whether the cached tag is still current.
//!
//! | Owner answer | Cache action |
//! |---|---|
//! | same tag | `mark_as_fresh` (timer grows) |
//! | new tag + activations | `add_or_update` (timer resets) |
//! | no entry | `remove` |
//!
//! Entries for grains this node now owns, or pointing at nodes that are no
//! longer valid, are dropped without asking.

use std::collections::HashMap;
use std::rc::Rc;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::CachedActivations;
use crate::context::DirectoryContext;
use crate::providers::Providers;
use crate::transport::LookupManyEntry;
use crate::types::{GrainId, NodeAddress, VersionTag};

pub(crate) struct CacheMaintainer<P: Providers> {
    ctx: Rc<DirectoryContext<P>>,
}

impl<P: Providers> CacheMaintainer<P> {
    pub(crate) fn new(ctx: Rc<DirectoryContext<P>>) -> Self {
        Self { ctx }
    }

    pub(crate) async fn run(self: Rc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.ctx.config.cache_refresh_period();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.ctx.sleep(period) => {
                    self.refresh_once().await;
                }
            }
        }
        debug!(node = %self.ctx.me, "cache maintainer stopped");
    }

    /// One revalidation pass over the expired entries.
    pub(crate) async fn refresh_once(&self) {
        let expired = self.ctx.cache.borrow().expired_entries();
        if expired.is_empty() {
            return;
        }

        let mut by_owner: HashMap<NodeAddress, Vec<(GrainId, VersionTag)>> = HashMap::new();
        let mut dropped = 0usize;
        for (grain, cached, tag) in expired {
            let owner = match self.ctx.owner(&grain) {
                Ok(owner) if owner != self.ctx.me && self.all_valid(&cached) => owner,
                _ => {
                    self.ctx.cache.borrow_mut().remove(&grain);
                    dropped += 1;
                    continue;
                }
            };
            by_owner.entry(owner).or_default().push((grain, tag));
        }
        debug!(
            node = %self.ctx.me,
            owners = by_owner.len(),
            dropped,
            "refreshing expired cache entries"
        );

        let requests = by_owner.into_iter().map(|(owner, batch)| async move {
            let result = match self.ctx.peer(&owner) {
                Ok(peer) => self.ctx.call(&owner, peer.lookup_many(batch)).await,
                Err(error) => Err(error),
            };
            (owner, result)
        });
        for (owner, result) in join_all(requests).await {
            match result {
                Ok(entries) => self.apply(entries),
                // retried on the next pass
                Err(error) => debug!(owner = %owner, %error, "cache refresh failed"),
            }
        }
    }

    fn all_valid(&self, cached: &CachedActivations) -> bool {
        cached.iter().all(|(node, _)| self.ctx.is_valid(node))
    }

    fn apply(&self, entries: Vec<LookupManyEntry>) {
        let mut cache = self.ctx.cache.borrow_mut();
        for entry in entries {
            match (entry.version_tag, entry.activations) {
                (None, _) => {
                    trace!(grain = %entry.grain, "owner forgot grain, dropping cache entry");
                    cache.remove(&entry.grain);
                }
                (Some(_), None) => {
                    cache.mark_as_fresh(&entry.grain);
                }
                (Some(tag), Some(activations)) => {
                    let value: CachedActivations = activations
                        .into_iter()
                        .filter(|address| self.ctx.is_valid(&address.node))
                        .map(|address| (address.node, address.activation))
                        .collect();
                    if value.is_empty() {
                        cache.remove(&entry.grain);
                    } else {
                        cache.add_or_update(entry.grain, value, tag);
                    }
                }
            }
        }
    }
}
