use crate::cache::{AddressCache, CollectionCache, PartitionKeyRangeCache};
use crate::core::{
    AddressSet, CollectionMetadata, PartitionKeyRange, PartitionKeyRangeIdentity, RegionalEndpoint,
    ReplicaAddress, RequestContext, RequestTarget, Result, RoutingError,
};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Where a request goes: the region, the partition key range, and the
/// replicas serving it, primary first.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub endpoint: RegionalEndpoint,
    pub collection: Arc<CollectionMetadata>,
    pub range: PartitionKeyRange,
    pub addresses: Arc<AddressSet>,
}

impl ResolvedRoute {
    pub fn identity(&self) -> &PartitionKeyRangeIdentity {
        self.addresses.identity()
    }

    pub fn replicas(&self) -> &[ReplicaAddress] {
        self.addresses.replicas()
    }

    pub fn primary(&self) -> Option<&ReplicaAddress> {
        self.addresses.primary()
    }
}

/// Resolves requests to replicas within one region by walking the
/// collection, partition key range and address caches.
pub struct AddressResolver {
    endpoint: RegionalEndpoint,
    collections: Arc<CollectionCache>,
    ranges: Arc<PartitionKeyRangeCache>,
    addresses: Arc<AddressCache>,
}

impl AddressResolver {
    pub fn new(
        endpoint: RegionalEndpoint,
        collections: Arc<CollectionCache>,
        ranges: Arc<PartitionKeyRangeCache>,
        addresses: Arc<AddressCache>,
    ) -> Self {
        Self {
            endpoint,
            collections,
            ranges,
            addresses,
        }
    }

    pub fn endpoint(&self) -> &RegionalEndpoint {
        &self.endpoint
    }

    pub fn address_cache(&self) -> &Arc<AddressCache> {
        &self.addresses
    }

    /// Resolves `request` to its partition key range and replicas.
    ///
    /// `force_refresh_partition_addresses` bypasses every cache level.
    pub async fn resolve(&self, request: &RequestContext) -> Result<ResolvedRoute> {
        let span = info_span!(
            "address_resolver.resolve",
            endpoint = %self.endpoint.uri,
            collection = %request.collection_link,
            force_refresh = request.force_refresh_partition_addresses,
        );
        self.resolve_inner(request).instrument(span).await
    }

    async fn resolve_inner(&self, request: &RequestContext) -> Result<ResolvedRoute> {
        let force = request.force_refresh_partition_addresses;
        let collection = self
            .collections
            .resolve_collection(&request.collection_link, force)
            .await?;
        let rid = collection.resource_id.as_str();

        let range = match &request.target {
            RequestTarget::PartitionKey(key) => {
                let effective = collection.partition_key.effective_key(key)?;
                self.ranges
                    .get_range_by_effective_key(rid, &effective, force)
                    .await?
            }
            RequestTarget::PartitionKeyRangeId(range_id) => {
                self.range_by_id(rid, range_id, force).await?
            }
        };

        let identity = PartitionKeyRangeIdentity::new(rid, range.id.clone());
        let addresses = self.addresses.resolve_addresses(&identity, force).await?;
        event!(
            Level::DEBUG,
            range_id = %range.id,
            replicas = addresses.replicas().len(),
            "request resolved"
        );

        Ok(ResolvedRoute {
            endpoint: self.endpoint.clone(),
            collection,
            range,
            addresses,
        })
    }

    /// An id missing from the cached map may belong to a range created after
    /// the map was loaded, so the map is refreshed once before giving up.
    async fn range_by_id(
        &self,
        collection_rid: &str,
        range_id: &str,
        force: bool,
    ) -> Result<PartitionKeyRange> {
        if let Some(range) = self.ranges.get_range_by_id(collection_rid, range_id, force).await? {
            return Ok(range);
        }
        if !force {
            if let Some(range) = self.ranges.get_range_by_id(collection_rid, range_id, true).await? {
                return Ok(range);
            }
        }
        Err(RoutingError::partition_key_range_gone(collection_rid, range_id))
    }

    /// Applies the narrowest invalidation matching `error`. Returns true if
    /// anything was invalidated.
    pub fn invalidate_for(&self, error: &RoutingError) -> bool {
        match error {
            RoutingError::CollectionGone { link } => self.collections.invalidate(link),
            RoutingError::PartitionKeyRangeGone {
                collection_rid,
                range_id,
            } => {
                let identity = PartitionKeyRangeIdentity::new(collection_rid.clone(), range_id.clone());
                self.addresses.invalidate(&identity);
                self.ranges.invalidate_range(collection_rid, range_id)
            }
            RoutingError::ReplicaSetChanged {
                collection_rid,
                range_id,
            } => self.addresses.invalidate(&PartitionKeyRangeIdentity::new(
                collection_rid.clone(),
                range_id.clone(),
            )),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::core::{EffectiveKey, PartitionKey, PartitionKeyDefinition};
    use crate::reader::MetadataReader;
    use crate::testing::{InMemoryMetadataReader, MetadataCall};

    const LINK: &str = "dbs/shop/colls/catalog";
    const RID: &str = "rid-catalog";

    fn resolver(reader: &InMemoryMetadataReader) -> AddressResolver {
        let shared: Arc<dyn MetadataReader> = Arc::new(reader.clone());
        let config = CacheConfig::default();
        AddressResolver::new(
            RegionalEndpoint::new("West", "https://acct-west.example:443/"),
            Arc::new(CollectionCache::new(Arc::clone(&shared), &config)),
            Arc::new(PartitionKeyRangeCache::new(Arc::clone(&shared), &config)),
            Arc::new(AddressCache::new(shared, &config)),
        )
    }

    fn catalog() -> InMemoryMetadataReader {
        let reader = InMemoryMetadataReader::new();
        reader.add_collection(LINK, RID, PartitionKeyDefinition::hash("/sku").unwrap());
        reader
            .split_range(RID, "0", EffectiveKey::from("8"), "1", "2")
            .unwrap();
        reader
    }

    #[tokio::test]
    async fn partition_key_resolves_to_its_range() {
        let reader = catalog();
        let resolver = resolver(&reader);

        // fnv("xyz") = c685..., upper half.
        let route = resolver
            .resolve(&RequestContext::for_partition_key(LINK, PartitionKey::from("xyz")))
            .await
            .unwrap();
        assert_eq!(route.range.id, "2");
        assert_eq!(route.identity(), &PartitionKeyRangeIdentity::new(RID, "2"));
        assert!(route.primary().is_some());
    }

    #[tokio::test]
    async fn arity_mismatch_is_rejected() {
        let reader = catalog();
        let resolver = resolver(&reader);
        let key = PartitionKey::new(Vec::new());

        let err = resolver
            .resolve(&RequestContext::for_partition_key(LINK, key))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn unknown_range_id_refreshes_once_then_reports_gone() {
        let reader = catalog();
        let resolver = resolver(&reader);

        let err = resolver
            .resolve(&RequestContext::for_range_id(LINK, "42"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::PartitionKeyRangeGone { .. }));
        assert_eq!(reader.calls(MetadataCall::PartitionKeyRanges), 2);
    }

    #[tokio::test]
    async fn replica_set_change_only_drops_that_address_entry() {
        let reader = catalog();
        let resolver = resolver(&reader);
        let request = RequestContext::for_range_id(LINK, "1");
        resolver.resolve(&request).await.unwrap();

        let changed = RoutingError::ReplicaSetChanged {
            collection_rid: RID.to_string(),
            range_id: "1".to_string(),
        };
        assert!(resolver.invalidate_for(&changed));
        resolver.resolve(&request).await.unwrap();

        assert_eq!(reader.calls(MetadataCall::Collection), 1);
        assert_eq!(reader.calls(MetadataCall::PartitionKeyRanges), 1);
        assert_eq!(reader.calls(MetadataCall::ReplicaAddresses), 2);
    }

    #[tokio::test]
    async fn unrelated_errors_invalidate_nothing() {
        let reader = catalog();
        let resolver = resolver(&reader);
        resolver
            .resolve(&RequestContext::for_range_id(LINK, "1"))
            .await
            .unwrap();

        assert!(!resolver.invalidate_for(&RoutingError::TransientFetchFailure("x".to_string())));
        assert!(!resolver.invalidate_for(&RoutingError::TopologyUnavailable("x".to_string())));
    }

    #[tokio::test]
    async fn forced_resolve_bypasses_every_level() {
        let reader = catalog();
        let resolver = resolver(&reader);
        let request = RequestContext::for_range_id(LINK, "1");
        resolver.resolve(&request).await.unwrap();
        resolver.resolve(&request.clone().force_refresh(true)).await.unwrap();

        assert_eq!(reader.calls(MetadataCall::Collection), 2);
        assert_eq!(reader.calls(MetadataCall::PartitionKeyRanges), 2);
        assert_eq!(reader.calls(MetadataCall::ReplicaAddresses), 2);
    }
}
