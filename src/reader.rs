use crate::core::{
    CollectionMetadata, DatabaseAccount, EffectiveKeyRange, PartitionKeyRange,
    PartitionKeyRangeIdentity, RegionalEndpoint, ReplicaAddress, Result,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Fetches routing metadata from the service.
///
/// Implementations own the transport. They report a deleted collection as
/// `RoutingError::CollectionGone` and any network or backend problem as
/// `RoutingError::TransientFetchFailure`.
#[async_trait]
pub trait MetadataReader: Send + Sync {
    /// Reads the metadata of the collection named by `link`.
    async fn fetch_collection(&self, link: &str) -> Result<CollectionMetadata>;

    /// Reads every partition key range of `collection_rid` overlapping `range`.
    async fn fetch_partition_key_ranges(
        &self,
        collection_rid: &str,
        range: &EffectiveKeyRange,
    ) -> Result<Vec<PartitionKeyRange>>;

    /// Reads the current replica set of one partition key range.
    async fn fetch_replica_addresses(
        &self,
        identity: &PartitionKeyRangeIdentity,
    ) -> Result<Vec<ReplicaAddress>>;

    /// Reads the account document through `endpoint`.
    async fn fetch_account_topology(&self, endpoint: &str) -> Result<DatabaseAccount>;
}

/// Hands out the metadata collaborator to use for one region.
pub trait MetadataReaderFactory: Send + Sync {
    fn reader_for(&self, endpoint: &RegionalEndpoint) -> Arc<dyn MetadataReader>;
}

/// Fixed assignment of readers to regional endpoint URIs, with a default for
/// every endpoint not listed.
#[derive(Clone)]
pub struct StaticReaderFactory {
    default: Arc<dyn MetadataReader>,
    by_endpoint: HashMap<String, Arc<dyn MetadataReader>>,
}

impl StaticReaderFactory {
    /// One reader serving every region.
    pub fn shared(reader: Arc<dyn MetadataReader>) -> Self {
        Self {
            default: reader,
            by_endpoint: HashMap::new(),
        }
    }

    /// Serve the region reachable at `endpoint_uri` with `reader`.
    pub fn with_region(mut self, endpoint_uri: impl Into<String>, reader: Arc<dyn MetadataReader>) -> Self {
        self.by_endpoint.insert(endpoint_uri.into(), reader);
        self
    }
}

impl MetadataReaderFactory for StaticReaderFactory {
    fn reader_for(&self, endpoint: &RegionalEndpoint) -> Arc<dyn MetadataReader> {
        self.by_endpoint
            .get(&endpoint.uri)
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}
