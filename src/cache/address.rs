use super::async_cache::{
    AsyncCache, CacheEntry, CacheLookup, CacheStats, FetchObserver, FetchOutcome, PendingFetch,
};
use crate::config::CacheConfig;
use crate::core::{AddressSet, PartitionKeyRangeIdentity, Result};
use crate::reader::MetadataReader;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy)]
struct RefreshFailure {
    consecutive: u32,
    last_failed_at: Instant,
}

type RefreshFailures = Arc<Mutex<HashMap<PartitionKeyRangeIdentity, RefreshFailure>>>;

/// Partition key range identity -> replica addresses.
///
/// Entries younger than the refresh TTL are served as is. Past the TTL and
/// within the grace period the last known good set keeps being served while a
/// background refresh runs; failed background refreshes back off. Past the
/// grace period a lookup waits for a fresh set.
pub struct AddressCache {
    reader: Arc<dyn MetadataReader>,
    refresh_ttl: Duration,
    grace_period: Duration,
    config: CacheConfig,
    addresses: AsyncCache<PartitionKeyRangeIdentity, AddressSet>,
    failures: RefreshFailures,
}

impl AddressCache {
    pub fn new(reader: Arc<dyn MetadataReader>, config: &CacheConfig) -> Self {
        let failures: RefreshFailures = Arc::new(Mutex::new(HashMap::new()));
        let observer: FetchObserver<PartitionKeyRangeIdentity, AddressSet> = {
            let failures = Arc::clone(&failures);
            Arc::new(
                move |identity: &PartitionKeyRangeIdentity, outcome: &FetchOutcome<AddressSet>| {
                    let mut failures = failures.lock().unwrap_or_else(PoisonError::into_inner);
                    match outcome {
                        Ok(_) => {
                            failures.remove(identity);
                        }
                        Err(_) => {
                            let now = Instant::now();
                            let failure = failures.entry(identity.clone()).or_insert(RefreshFailure {
                                consecutive: 0,
                                last_failed_at: now,
                            });
                            failure.consecutive = failure.consecutive.saturating_add(1);
                            failure.last_failed_at = now;
                        }
                    }
                },
            )
        };

        Self {
            reader,
            refresh_ttl: config.address_refresh_ttl_duration(),
            grace_period: config.address_grace_period_duration(),
            config: config.clone(),
            addresses: AsyncCache::with_observer(
                "address",
                config.fetch_timeout_duration(),
                observer,
            ),
            failures,
        }
    }

    /// Returns the replica set of `identity`.
    ///
    /// With `force_refresh` the set is always re-fetched and a failure is
    /// returned to the caller; the previous set stays cached either way.
    pub async fn resolve_addresses(
        &self,
        identity: &PartitionKeyRangeIdentity,
        force_refresh: bool,
    ) -> Result<Arc<AddressSet>> {
        if !force_refresh {
            let servable_for = self.refresh_ttl.saturating_add(self.grace_period);
            match self.addresses.lookup(identity, self.refresh_ttl, servable_for) {
                CacheLookup::Hit(entry) => {
                    self.addresses.record_hit();
                    return Ok(Arc::clone(entry.value()));
                }
                CacheLookup::Stale(entry) => {
                    self.serve_stale(identity, &entry);
                    return Ok(Arc::clone(entry.value()));
                }
                CacheLookup::Miss => {}
            }
        }

        self.addresses.record_miss();
        let entry = self.start_refresh(identity).await?;
        Ok(Arc::clone(entry.value()))
    }

    /// Drops the cached replica set of one range.
    pub fn invalidate(&self, identity: &PartitionKeyRangeIdentity) -> bool {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity);
        let removed = self.addresses.remove(identity).is_some();
        if removed {
            event!(Level::INFO, identity = %identity, "replica addresses invalidated");
        }
        removed
    }

    /// Drops every cached replica set of a collection.
    pub fn invalidate_collection(&self, collection_rid: &str) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|identity, _| identity.collection_rid != collection_rid);
        self.addresses
            .remove_where(|identity| identity.collection_rid == collection_rid)
    }

    /// Returns the cached replica set without fetching, however old it is.
    pub fn cached(&self, identity: &PartitionKeyRangeIdentity) -> Option<Arc<AddressSet>> {
        self.addresses
            .get(identity)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns true while a refresh for `identity` is running.
    pub fn is_refreshing(&self, identity: &PartitionKeyRangeIdentity) -> bool {
        self.addresses.is_fetching(identity)
    }

    pub fn stats(&self) -> CacheStats {
        self.addresses.stats()
    }

    fn serve_stale(&self, identity: &PartitionKeyRangeIdentity, entry: &CacheEntry<AddressSet>) {
        self.addresses.record_stale_served();
        event!(
            Level::WARN,
            identity = %identity,
            age_ms = entry.age().as_millis() as u64,
            "serving last known good replica addresses"
        );

        if self.addresses.is_fetching(identity) || !self.backoff_elapsed(identity) {
            return;
        }
        // The refresh task runs detached; its outcome lands in the cache.
        drop(self.start_refresh(identity));
    }

    fn backoff_elapsed(&self, identity: &PartitionKeyRangeIdentity) -> bool {
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        match failures.get(identity) {
            None => true,
            Some(failure) => {
                let backoff = self.config.refresh_backoff_after(failure.consecutive);
                failure.last_failed_at.elapsed() >= backoff
            }
        }
    }

    fn start_refresh(
        &self,
        identity: &PartitionKeyRangeIdentity,
    ) -> PendingFetch<AddressSet> {
        let reader = Arc::clone(&self.reader);
        let fetch_identity = identity.clone();
        self.addresses.refresh(identity.clone(), move || async move {
            let replicas = reader.fetch_replica_addresses(&fetch_identity).await?;
            let set = AddressSet::new(fetch_identity, replicas, Utc::now())?;
            event!(
                Level::DEBUG,
                identity = %set.identity(),
                replicas = set.replicas().len(),
                "replica addresses fetched"
            );
            Ok(set)
        })
    }
}
