use super::address_resolver::{AddressResolver, ResolvedRoute};
use crate::cache::{AddressCache, CollectionCache, PartitionKeyRangeCache};
use crate::config::RoutingConfig;
use crate::core::{
    EndpointHealth, PartitionKeyRangeIdentity, RegionalEndpoint, RequestContext, Result,
    RoutingError,
};
use crate::endpoint::{DEFAULT_REGION, FailoverCursor, GlobalEndpointManager, TopologyRefreshWorker};
use crate::reader::MetadataReaderFactory;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{Level, event};

/// Entry point of the request pipeline: picks a region, then the replicas
/// inside it.
///
/// Collection metadata and routing maps are region independent and shared;
/// every region gets its own address cache over its own collaborator.
pub struct GlobalAddressResolver {
    config: RoutingConfig,
    factory: Arc<dyn MetadataReaderFactory>,
    endpoints: Arc<GlobalEndpointManager>,
    collections: Arc<CollectionCache>,
    ranges: Arc<PartitionKeyRangeCache>,
    resolvers: RwLock<HashMap<String, Arc<AddressResolver>>>,
    /// Topology version the resolver map was last pruned against.
    pruned_version: AtomicU64,
}

impl GlobalAddressResolver {
    pub fn new(config: RoutingConfig, factory: Arc<dyn MetadataReaderFactory>) -> Result<Self> {
        config.validate()?;
        let gateway = RegionalEndpoint::new(DEFAULT_REGION, config.endpoints.default_endpoint.as_str());
        let reader = factory.reader_for(&gateway);

        let collections = Arc::new(CollectionCache::new(Arc::clone(&reader), &config.cache));
        let ranges = Arc::new(PartitionKeyRangeCache::new(Arc::clone(&reader), &config.cache));
        let endpoints = GlobalEndpointManager::new(
            config.endpoints.clone(),
            reader,
            config.cache.fetch_timeout_duration(),
        )?;

        Ok(Self {
            config,
            factory,
            endpoints,
            collections,
            ranges,
            resolvers: RwLock::new(HashMap::new()),
            pruned_version: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Loads the account topology. Until this succeeds every request goes
    /// through the default endpoint.
    pub async fn initialize(&self) -> Result<()> {
        self.endpoints.refresh_topology().await?;
        self.prune_retired_regions();
        Ok(())
    }

    /// Resolves `request` to a region and the replicas serving it there.
    ///
    /// The region is the request's endpoint override when set, otherwise the
    /// first usable endpoint for the operation kind. `force_refresh` has the
    /// same effect as the request's own force-refresh flag.
    pub async fn resolve(&self, request: &RequestContext, force_refresh: bool) -> Result<ResolvedRoute> {
        self.prune_retired_regions();
        let endpoint = match &request.endpoint_override {
            Some(target) => self.endpoints.endpoint(target).ok_or_else(|| {
                RoutingError::InvalidRequest(format!("Unknown endpoint override '{}'", target))
            })?,
            None => self.endpoints.resolve_service_endpoint(request.operation)?,
        };

        let resolver = self.resolver_for(&endpoint);
        let mut route = if force_refresh && !request.force_refresh_partition_addresses {
            resolver.resolve(&request.clone().force_refresh(true)).await?
        } else {
            resolver.resolve(request).await?
        };
        route.endpoint = endpoint;
        Ok(route)
    }

    /// Returns the resolver of the region at `endpoint`, creating it on first use.
    pub fn resolver_for(&self, endpoint: &RegionalEndpoint) -> Arc<AddressResolver> {
        if let Some(resolver) = self
            .resolvers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&endpoint.uri)
        {
            return Arc::clone(resolver);
        }

        let mut resolvers = self.resolvers.write().unwrap_or_else(PoisonError::into_inner);
        let resolver = resolvers.entry(endpoint.uri.clone()).or_insert_with(|| {
            event!(
                Level::INFO,
                region = %endpoint.region,
                endpoint = %endpoint.uri,
                "regional address resolver created"
            );
            let addresses = AddressCache::new(self.factory.reader_for(endpoint), &self.config.cache);
            Arc::new(AddressResolver::new(
                endpoint.clone(),
                Arc::clone(&self.collections),
                Arc::clone(&self.ranges),
                Arc::new(addresses),
            ))
        });
        Arc::clone(resolver)
    }

    /// Drops the resolvers, and with them the address caches, of regions the
    /// current topology no longer lists. Runs once per applied topology.
    fn prune_retired_regions(&self) {
        let version = self.endpoints.topology_version();
        if self.pruned_version.swap(version, Ordering::SeqCst) == version {
            return;
        }

        let live: HashSet<String> = self
            .endpoints
            .regions()
            .into_iter()
            .map(|endpoint| endpoint.uri)
            .collect();
        let mut resolvers = self.resolvers.write().unwrap_or_else(PoisonError::into_inner);
        resolvers.retain(|uri, resolver| {
            let keep = live.contains(uri);
            if !keep {
                event!(
                    Level::INFO,
                    region = %resolver.endpoint().region,
                    endpoint = %uri,
                    "regional address resolver retired"
                );
            }
            keep
        });
    }

    fn each_address_cache(&self, mut apply: impl FnMut(&AddressCache)) {
        let resolvers: Vec<Arc<AddressResolver>> = self
            .resolvers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for resolver in resolvers {
            apply(resolver.address_cache());
        }
    }

    /// Drops the collection's metadata, routing map and every address entry
    /// of it in every region.
    pub fn invalidate_collection(&self, link: &str) -> bool {
        let cached = self.collections.cached(link);
        let removed = self.collections.invalidate(link);
        if let Some(collection) = cached {
            let rid = collection.resource_id.as_str();
            self.ranges.invalidate_collection(rid);
            self.each_address_cache(|cache| {
                cache.invalidate_collection(rid);
            });
        }
        removed
    }

    /// Marks a partition key range as split or merged away.
    pub fn invalidate_partition_key_range(&self, collection_rid: &str, range_id: &str) -> bool {
        let identity = PartitionKeyRangeIdentity::new(collection_rid, range_id);
        self.each_address_cache(|cache| {
            cache.invalidate(&identity);
        });
        self.ranges.invalidate_range(collection_rid, range_id)
    }

    /// Drops the replica set of one range in every region. Returns how many
    /// regions had it cached.
    pub fn invalidate_addresses(&self, identity: &PartitionKeyRangeIdentity) -> usize {
        let mut removed = 0;
        self.each_address_cache(|cache| {
            if cache.invalidate(identity) {
                removed += 1;
            }
        });
        removed
    }

    /// Applies the narrowest invalidation matching `error`.
    pub fn invalidate_for(&self, error: &RoutingError) -> bool {
        match error {
            RoutingError::CollectionGone { link } => self.invalidate_collection(link),
            RoutingError::PartitionKeyRangeGone {
                collection_rid,
                range_id,
            } => self.invalidate_partition_key_range(collection_rid, range_id),
            RoutingError::ReplicaSetChanged {
                collection_rid,
                range_id,
            } => {
                let identity = PartitionKeyRangeIdentity::new(collection_rid.clone(), range_id.clone());
                self.invalidate_addresses(&identity) > 0
            }
            _ => false,
        }
    }

    pub fn current_write_endpoint(&self) -> Result<RegionalEndpoint> {
        self.endpoints.current_write_endpoint()
    }

    pub fn current_read_endpoints(&self) -> Result<Vec<RegionalEndpoint>> {
        self.endpoints.current_read_endpoints()
    }

    pub fn report_endpoint_failure(&self, target: &str) -> Option<EndpointHealth> {
        self.endpoints.report_failure(target)
    }

    pub fn report_endpoint_success(&self, target: &str) -> Option<EndpointHealth> {
        self.endpoints.report_success(target)
    }

    pub fn next_endpoint(&self, cursor: &mut FailoverCursor) -> Option<RegionalEndpoint> {
        self.endpoints.next_endpoint(cursor)
    }

    pub fn start_background_refresh(&self) -> TopologyRefreshWorker {
        self.endpoints.start_background_refresh()
    }

    pub fn endpoint_manager(&self) -> &Arc<GlobalEndpointManager> {
        &self.endpoints
    }

    pub fn collection_cache(&self) -> &Arc<CollectionCache> {
        &self.collections
    }

    pub fn partition_key_range_cache(&self) -> &Arc<PartitionKeyRangeCache> {
        &self.ranges
    }
}
