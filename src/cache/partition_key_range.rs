use super::async_cache::{AsyncCache, CacheStats};
use crate::config::CacheConfig;
use crate::core::{EffectiveKey, EffectiveKeyRange, PartitionKeyRange, Result, RoutingError};
use crate::reader::MetadataReader;
use crate::routing_map::RoutingMap;
use futures::future::{BoxFuture, FutureExt, try_join_all};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{Instrument, Level, event, info_span};

/// A refresh can be overtaken by invalidations that arrive while it runs;
/// this bounds how many follow-up refreshes one lookup performs.
const MAX_REFRESH_ROUNDS: usize = 3;

type GoneRanges = Arc<Mutex<HashMap<String, HashSet<String>>>>;

/// Collection resource id -> routing map of its partition key ranges.
///
/// Maps are loaded whole on first use and afterwards only spliced: a range
/// reported gone is re-fetched over its own interval and replaced by whatever
/// the service now reports there.
pub struct PartitionKeyRangeCache {
    reader: Arc<dyn MetadataReader>,
    maps: AsyncCache<String, RoutingMap>,
    gone: GoneRanges,
}

impl PartitionKeyRangeCache {
    pub fn new(reader: Arc<dyn MetadataReader>, config: &CacheConfig) -> Self {
        Self {
            reader,
            maps: AsyncCache::new("partition_key_range", config.fetch_timeout_duration()),
            gone: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the routing map of `collection_rid`, refreshing it when it is
    /// missing, when a range of it was reported gone, or when forced.
    pub async fn routing_map(
        &self,
        collection_rid: &str,
        force_refresh: bool,
    ) -> Result<Arc<RoutingMap>> {
        let key = collection_rid.to_string();
        let mut force = force_refresh;
        for _ in 0..MAX_REFRESH_ROUNDS {
            if !force && !self.has_gone_ranges(collection_rid) {
                if let Some(entry) = self.maps.get(&key) {
                    self.maps.record_hit();
                    return Ok(Arc::clone(entry.value()));
                }
            }

            self.maps.record_miss();
            let work = self.refresh_work(collection_rid);
            let entry = self.maps.refresh(key.clone(), move || work).await?;
            force = false;
            if !self.has_gone_ranges(collection_rid) {
                return Ok(Arc::clone(entry.value()));
            }
        }

        Err(RoutingError::TransientFetchFailure(format!(
            "Partition key ranges of collection '{}' kept changing during refresh",
            collection_rid
        )))
    }

    /// Returns the ranges overlapping `range`, in key order. The result is
    /// contiguous and covers `range` because published maps cover the whole
    /// key space.
    pub async fn get_overlapping_ranges(
        &self,
        collection_rid: &str,
        range: &EffectiveKeyRange,
        force_refresh: bool,
    ) -> Result<Vec<PartitionKeyRange>> {
        let map = self.routing_map(collection_rid, force_refresh).await?;
        Ok(map.overlapping(range))
    }

    /// Returns the single range containing `key`.
    pub async fn get_range_by_effective_key(
        &self,
        collection_rid: &str,
        key: &EffectiveKey,
        force_refresh: bool,
    ) -> Result<PartitionKeyRange> {
        let map = self.routing_map(collection_rid, force_refresh).await?;
        map.range_for_key(key).cloned().ok_or_else(|| {
            RoutingError::InvalidRequest(format!(
                "Effective key {} is outside the key space of collection '{}'",
                key, collection_rid
            ))
        })
    }

    /// Returns the range with id `range_id`, or `None` if the current map
    /// does not contain it.
    pub async fn get_range_by_id(
        &self,
        collection_rid: &str,
        range_id: &str,
        force_refresh: bool,
    ) -> Result<Option<PartitionKeyRange>> {
        let map = self.routing_map(collection_rid, force_refresh).await?;
        if map.is_gone(range_id) {
            return Err(RoutingError::partition_key_range_gone(collection_rid, range_id));
        }
        Ok(map.range_by_id(range_id).cloned())
    }

    /// Records that `range_id` was split or merged away. The next lookup for
    /// the collection re-fetches that range's interval only.
    ///
    /// Does nothing when the cached map no longer contains the range, so a
    /// burst of callers reporting the same split causes one refresh.
    pub fn invalidate_range(&self, collection_rid: &str, range_id: &str) -> bool {
        let Some(entry) = self.maps.get(&collection_rid.to_string()) else {
            return false;
        };
        if !entry.value().contains_id(range_id) {
            return false;
        }
        let inserted = self
            .gone
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(collection_rid.to_string())
            .or_default()
            .insert(range_id.to_string());
        if inserted {
            event!(
                Level::INFO,
                collection_rid = %collection_rid,
                range_id = %range_id,
                "partition key range invalidated"
            );
        }
        inserted
    }

    /// Drops the whole routing map of a collection.
    pub fn invalidate_collection(&self, collection_rid: &str) -> bool {
        self.gone
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(collection_rid);
        self.maps.remove(&collection_rid.to_string()).is_some()
    }

    /// Returns the cached map without fetching.
    pub fn cached(&self, collection_rid: &str) -> Option<Arc<RoutingMap>> {
        self.maps
            .get(&collection_rid.to_string())
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn stats(&self) -> CacheStats {
        self.maps.stats()
    }

    fn has_gone_ranges(&self, collection_rid: &str) -> bool {
        self.gone
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection_rid)
            .is_some_and(|ids| !ids.is_empty())
    }

    fn refresh_work(&self, collection_rid: &str) -> BoxFuture<'static, Result<RoutingMap>> {
        let reader = Arc::clone(&self.reader);
        let maps = self.maps.clone();
        let gone = Arc::clone(&self.gone);
        let collection_rid = collection_rid.to_string();
        let span = info_span!("partition_key_range.refresh", collection_rid = %collection_rid);

        async move {
            let previous = maps.get(&collection_rid).map(|entry| Arc::clone(entry.value()));
            let gone_ids: Vec<String> = gone
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&collection_rid)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default();

            let next = match previous {
                Some(previous) if !gone_ids.is_empty() => {
                    match splice_gone_ranges(reader.as_ref(), &previous, &gone_ids).await? {
                        Some(next) => next,
                        None => full_fetch(reader.as_ref(), Some(&previous), &collection_rid).await?,
                    }
                }
                previous => {
                    full_fetch(reader.as_ref(), previous.as_deref(), &collection_rid).await?
                }
            };

            {
                let mut gone = gone.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(ids) = gone.get_mut(&collection_rid) {
                    for id in &gone_ids {
                        ids.remove(id);
                    }
                    if ids.is_empty() {
                        gone.remove(&collection_rid);
                    }
                }
            }
            event!(
                Level::DEBUG,
                ranges = next.len(),
                version = next.version(),
                "routing map refreshed"
            );
            Ok(next)
        }
        .instrument(span)
        .boxed()
    }
}

/// Re-fetches the interval of every gone range still present in `previous`
/// and splices the results in. Returns `None` when the listings do not fit
/// the current map, in which case the caller reloads the whole map.
async fn splice_gone_ranges(
    reader: &dyn MetadataReader,
    previous: &RoutingMap,
    gone_ids: &[String],
) -> Result<Option<RoutingMap>> {
    let targets: Vec<PartitionKeyRange> = gone_ids
        .iter()
        .filter_map(|id| previous.range_by_id(id).cloned())
        .collect();

    let listings = try_join_all(targets.iter().map(|target| {
        reader.fetch_partition_key_ranges(previous.collection_rid(), &target.range)
    }))
    .await?;

    let mut next = previous.clone();
    for (target, replacements) in targets.iter().zip(listings) {
        if !next.contains_id(&target.id) {
            // Already displaced by an earlier merge in this batch.
            continue;
        }
        next = match next.splice(&target.id, replacements) {
            Ok(spliced) => spliced,
            Err(err) => {
                event!(
                    Level::WARN,
                    range_id = %target.id,
                    error = %err,
                    "replacement ranges do not fit, reloading routing map"
                );
                return Ok(None);
            }
        };
        event!(
            Level::INFO,
            range_id = %target.id,
            replacements = next.overlapping(&target.range).len(),
            "gone partition key range replaced"
        );
    }
    Ok(Some(next))
}

async fn full_fetch(
    reader: &dyn MetadataReader,
    previous: Option<&RoutingMap>,
    collection_rid: &str,
) -> Result<RoutingMap> {
    let ranges = reader
        .fetch_partition_key_ranges(collection_rid, &EffectiveKeyRange::full())
        .await?;
    match previous {
        Some(previous) => previous.rebuild(ranges),
        None => RoutingMap::try_new(collection_rid.to_string(), ranges),
    }
}
