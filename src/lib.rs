// ============================================================================
// docroute: partition and endpoint routing for document database clients
// ============================================================================

//! Turns a logical request (collection, partition key or explicit partition
//! key range) into the region and ordered replica set that should serve it.
//!
//! Metadata is cached at three levels: collection, partition key ranges and
//! replica addresses. Each level fetches through a [`MetadataReader`], shares
//! concurrent fetches for the same key, and is invalidated narrowly when the
//! request layer reports stale metadata.
//!
//! # Examples
//!
//! ```
//! use docroute::testing::InMemoryMetadataReader;
//! use docroute::{
//!     GlobalAddressResolver, PartitionKey, PartitionKeyDefinition, RequestContext, RoutingConfig,
//!     StaticReaderFactory,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! tokio_test::block_on(async {
//!     let reader = InMemoryMetadataReader::new();
//!     reader.add_collection("dbs/shop/colls/catalog", "rid-1", PartitionKeyDefinition::hash("/sku")?);
//!
//!     let resolver = GlobalAddressResolver::new(
//!         RoutingConfig::new("https://acct.example:443/"),
//!         Arc::new(StaticReaderFactory::shared(Arc::new(reader))),
//!     )?;
//!     resolver.initialize().await?;
//!
//!     let request =
//!         RequestContext::for_partition_key("dbs/shop/colls/catalog", PartitionKey::from("abc"));
//!     let route = resolver.resolve(&request, false).await?;
//!     assert!(route.primary().is_some());
//!     Ok::<(), Box<dyn std::error::Error>>(())
//! })
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod core;
pub mod endpoint;
pub mod reader;
pub mod resolver;
pub mod routing_map;
pub mod testing;

pub use cache::{AddressCache, AsyncCache, CacheStats, CollectionCache, PartitionKeyRangeCache};
pub use config::{CacheConfig, EndpointConfig, RoutingConfig};
pub use crate::core::{
    AccountRegion, AddressSet, CollectionMetadata, DatabaseAccount, EffectiveKey,
    EffectiveKeyRange, EndpointHealth, ErrorCategory, OperationKind, PartitionKey,
    PartitionKeyComponent, PartitionKeyDefinition, PartitionKeyRange, PartitionKeyRangeIdentity,
    PartitionKind, Protocol, RegionalEndpoint, ReplicaAddress, ReplicaRole, RequestContext,
    RequestTarget, Result, RoutingError,
};
pub use endpoint::{FailoverCursor, GlobalEndpointManager, TopologyRefreshWorker};
pub use reader::{MetadataReader, MetadataReaderFactory, StaticReaderFactory};
pub use resolver::{AddressResolver, GlobalAddressResolver, ResolvedRoute};
pub use routing_map::RoutingMap;
