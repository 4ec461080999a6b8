use super::async_cache::{AsyncCache, CacheStats};
use crate::config::CacheConfig;
use crate::core::{CollectionMetadata, Result, RoutingError, normalize_collection_link};
use crate::reader::MetadataReader;
use std::sync::Arc;
use tracing::{Level, event};

/// Collection link -> collection metadata.
pub struct CollectionCache {
    reader: Arc<dyn MetadataReader>,
    collections: AsyncCache<String, CollectionMetadata>,
}

impl CollectionCache {
    pub fn new(reader: Arc<dyn MetadataReader>, config: &CacheConfig) -> Self {
        Self {
            reader,
            collections: AsyncCache::new("collection", config.fetch_timeout_duration()),
        }
    }

    /// Resolves the metadata of the collection named by `link`.
    ///
    /// After the request layer observes a "collection gone" signal it calls
    /// [`invalidate`](Self::invalidate) and resolves again with
    /// `force_refresh` set, which picks up a collection recreated under the
    /// same name with a new resource id.
    pub async fn resolve_collection(
        &self,
        link: &str,
        force_refresh: bool,
    ) -> Result<Arc<CollectionMetadata>> {
        let link = normalize_collection_link(link)?;
        let reader = Arc::clone(&self.reader);
        let fetch_link = link.clone();

        let entry = self
            .collections
            .get_or_fetch(link, force_refresh, move || async move {
                let metadata = reader.fetch_collection(&fetch_link).await?;
                if metadata.resource_id.trim().is_empty() {
                    return Err(RoutingError::TransientFetchFailure(format!(
                        "Metadata for collection '{}' has no resource id",
                        fetch_link
                    )));
                }
                metadata.partition_key.validate()?;
                event!(
                    Level::DEBUG,
                    link = %fetch_link,
                    resource_id = %metadata.resource_id,
                    "collection metadata fetched"
                );
                Ok(metadata)
            })
            .await?;
        Ok(Arc::clone(entry.value()))
    }

    /// Drops the cached metadata for `link`. Returns true if an entry was present.
    pub fn invalidate(&self, link: &str) -> bool {
        let Ok(link) = normalize_collection_link(link) else {
            return false;
        };
        let removed = self.collections.remove(&link).is_some();
        if removed {
            event!(Level::INFO, link = %link, "collection metadata invalidated");
        }
        removed
    }

    /// Returns the cached metadata without fetching.
    pub fn cached(&self, link: &str) -> Option<Arc<CollectionMetadata>> {
        let link = normalize_collection_link(link).ok()?;
        self.collections
            .get(&link)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn stats(&self) -> CacheStats {
        self.collections.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PartitionKeyDefinition;
    use crate::testing::{InMemoryMetadataReader, MetadataCall};

    const LINK: &str = "dbs/shop/colls/catalog";

    fn reader() -> InMemoryMetadataReader {
        let reader = InMemoryMetadataReader::new();
        reader.add_collection(LINK, "rid-1", PartitionKeyDefinition::hash("/sku").unwrap());
        reader
    }

    #[tokio::test]
    async fn resolves_once_and_serves_from_cache() {
        let reader = reader();
        let cache = CollectionCache::new(Arc::new(reader.clone()), &CacheConfig::default());

        let first = cache.resolve_collection(LINK, false).await.unwrap();
        let second = cache.resolve_collection("/dbs/shop/colls/catalog/", false).await.unwrap();

        assert_eq!(first.resource_id, "rid-1");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reader.calls(MetadataCall::Collection), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn recreated_collection_is_picked_up_after_invalidation() {
        let reader = reader();
        let cache = CollectionCache::new(Arc::new(reader.clone()), &CacheConfig::default());
        assert_eq!(cache.resolve_collection(LINK, false).await.unwrap().resource_id, "rid-1");

        reader.add_collection(LINK, "rid-2", PartitionKeyDefinition::hash("/sku").unwrap());
        assert_eq!(cache.resolve_collection(LINK, false).await.unwrap().resource_id, "rid-1");

        assert!(cache.invalidate(LINK));
        let refreshed = cache.resolve_collection(LINK, true).await.unwrap();
        assert_eq!(refreshed.resource_id, "rid-2");
    }

    #[tokio::test]
    async fn deleted_collection_surfaces_collection_gone() {
        let reader = reader();
        reader.remove_collection(LINK);
        let cache = CollectionCache::new(Arc::new(reader), &CacheConfig::default());

        let err = cache.resolve_collection(LINK, false).await.unwrap_err();
        assert!(matches!(err, RoutingError::CollectionGone { .. }));
        assert!(cache.cached(LINK).is_none());
    }

    #[tokio::test]
    async fn malformed_link_is_rejected_without_fetching() {
        let reader = reader();
        let cache = CollectionCache::new(Arc::new(reader.clone()), &CacheConfig::default());

        let err = cache.resolve_collection("catalog", false).await.unwrap_err();
        assert!(matches!(err, RoutingError::InvalidRequest(_)));
        assert_eq!(reader.calls(MetadataCall::Collection), 0);
    }
}
