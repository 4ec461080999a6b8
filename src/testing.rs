//! In-memory metadata collaborator for tests.
//!
//! `InMemoryMetadataReader` plays the metadata service: it holds collections,
//! range listings, replica sets and the account document, counts every fetch,
//! and can be told to fail or stall. Clones share state, so a test keeps one
//! handle while the caches own another.

use crate::core::{
    AccountRegion, CollectionMetadata, DatabaseAccount, EffectiveKey, EffectiveKeyRange,
    PartitionKeyDefinition, PartitionKeyRange, PartitionKeyRangeIdentity, ReplicaAddress, Result,
    RoutingError, normalize_collection_link,
};
use crate::reader::MetadataReader;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// The kinds of fetch a `MetadataReader` serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataCall {
    Collection,
    PartitionKeyRanges,
    ReplicaAddresses,
    AccountTopology,
}

#[derive(Default)]
struct ReaderState {
    collections: HashMap<String, CollectionMetadata>,
    ranges: HashMap<String, Vec<PartitionKeyRange>>,
    addresses: HashMap<PartitionKeyRangeIdentity, Vec<ReplicaAddress>>,
    account: Option<DatabaseAccount>,
    unreachable: HashSet<String>,
    failures: HashMap<MetadataCall, RoutingError>,
    one_shot_failures: HashMap<MetadataCall, VecDeque<RoutingError>>,
    delay: Option<Duration>,
    calls: HashMap<MetadataCall, usize>,
    topology_calls: HashMap<String, usize>,
    last_range_query: Option<EffectiveKeyRange>,
}

#[derive(Clone)]
pub struct InMemoryMetadataReader {
    label: String,
    state: Arc<Mutex<ReaderState>>,
}

impl Default for InMemoryMetadataReader {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMetadataReader {
    pub fn new() -> Self {
        Self::named("replica")
    }

    /// `label` prefixes generated replica URIs, telling regions apart.
    pub fn named(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Arc::new(Mutex::new(ReaderState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates (or recreates) a collection. A new resource id starts with a
    /// single range `"0"` covering the whole key space.
    pub fn add_collection(&self, link: &str, resource_id: &str, partition_key: PartitionKeyDefinition) {
        let link = normalize_collection_link(link).unwrap_or_else(|_| link.to_string());
        let mut state = self.state();
        state
            .collections
            .insert(link.clone(), CollectionMetadata::new(link, resource_id, partition_key));
        state
            .ranges
            .entry(resource_id.to_string())
            .or_insert_with(|| vec![full_range("0")]);
    }

    pub fn remove_collection(&self, link: &str) {
        let link = normalize_collection_link(link).unwrap_or_else(|_| link.to_string());
        let mut state = self.state();
        if let Some(removed) = state.collections.remove(&link) {
            state.ranges.remove(&removed.resource_id);
        }
    }

    pub fn set_ranges(&self, collection_rid: &str, ranges: Vec<PartitionKeyRange>) {
        self.state().ranges.insert(collection_rid.to_string(), ranges);
    }

    /// Current range listing of a collection, in key order.
    pub fn ranges(&self, collection_rid: &str) -> Vec<PartitionKeyRange> {
        let mut ranges = self
            .state()
            .ranges
            .get(collection_rid)
            .cloned()
            .unwrap_or_default();
        ranges.sort_by(|a, b| a.min().cmp(b.min()));
        ranges
    }

    /// Splits `parent_id` at `at` into `left_id` and `right_id`.
    pub fn split_range(
        &self,
        collection_rid: &str,
        parent_id: &str,
        at: EffectiveKey,
        left_id: &str,
        right_id: &str,
    ) -> Result<()> {
        let mut state = self.state();
        let ranges = state
            .ranges
            .get_mut(collection_rid)
            .ok_or_else(|| unknown_collection(collection_rid))?;
        let position = ranges
            .iter()
            .position(|range| range.id == parent_id)
            .ok_or_else(|| unknown_range(collection_rid, parent_id))?;

        let parent = ranges[position].clone();
        let left = PartitionKeyRange::new(left_id, parent.min().clone(), at.clone())?
            .with_parents(vec![parent_id.to_string()]);
        let right = PartitionKeyRange::new(right_id, at, parent.max().clone())?
            .with_parents(vec![parent_id.to_string()]);
        if !parent.range.covers(&left.range) || !parent.range.covers(&right.range) {
            return Err(RoutingError::InvalidRequest(format!(
                "Split point lies outside range '{}'",
                parent_id
            )));
        }
        ranges.remove(position);
        ranges.push(left);
        ranges.push(right);
        Ok(())
    }

    /// Merges the adjacent ranges `left_id` and `right_id` into `merged_id`.
    pub fn merge_ranges(
        &self,
        collection_rid: &str,
        left_id: &str,
        right_id: &str,
        merged_id: &str,
    ) -> Result<()> {
        let mut state = self.state();
        let ranges = state
            .ranges
            .get_mut(collection_rid)
            .ok_or_else(|| unknown_collection(collection_rid))?;
        let left = ranges
            .iter()
            .find(|range| range.id == left_id)
            .cloned()
            .ok_or_else(|| unknown_range(collection_rid, left_id))?;
        let right = ranges
            .iter()
            .find(|range| range.id == right_id)
            .cloned()
            .ok_or_else(|| unknown_range(collection_rid, right_id))?;
        if left.max() != right.min() {
            return Err(RoutingError::InvalidRequest(format!(
                "Ranges '{}' and '{}' are not adjacent",
                left_id, right_id
            )));
        }

        ranges.retain(|range| range.id != left_id && range.id != right_id);
        ranges.push(
            PartitionKeyRange::new(merged_id, left.min().clone(), right.max().clone())?
                .with_parents(vec![left_id.to_string(), right_id.to_string()]),
        );
        Ok(())
    }

    /// Replaces the replica set served for one range. Ranges without an
    /// explicit set get three generated replicas.
    pub fn set_addresses(&self, identity: &PartitionKeyRangeIdentity, replicas: Vec<ReplicaAddress>) {
        self.state().addresses.insert(identity.clone(), replicas);
    }

    pub fn set_account(&self, account: DatabaseAccount) {
        self.state().account = Some(account);
    }

    /// Makes topology fetches through `endpoint` fail (or succeed again).
    pub fn set_endpoint_reachable(&self, endpoint: &str, reachable: bool) {
        let mut state = self.state();
        if reachable {
            state.unreachable.remove(endpoint);
        } else {
            state.unreachable.insert(endpoint.to_string());
        }
    }

    /// Makes every fetch of kind `call` fail with `error` until cleared with `None`.
    pub fn set_failure(&self, call: MetadataCall, error: Option<RoutingError>) {
        let mut state = self.state();
        match error {
            Some(error) => {
                state.failures.insert(call, error);
            }
            None => {
                state.failures.remove(&call);
            }
        }
    }

    /// Makes only the next fetch of kind `call` fail with `error`.
    pub fn fail_next(&self, call: MetadataCall, error: RoutingError) {
        self.state()
            .one_shot_failures
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// Stalls every fetch by `delay` before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    pub fn calls(&self, call: MetadataCall) -> usize {
        self.state().calls.get(&call).copied().unwrap_or(0)
    }

    /// Topology fetches issued through `endpoint`.
    pub fn topology_calls(&self, endpoint: &str) -> usize {
        self.state().topology_calls.get(endpoint).copied().unwrap_or(0)
    }

    /// Interval of the most recent range listing request.
    pub fn last_range_query(&self) -> Option<EffectiveKeyRange> {
        self.state().last_range_query.clone()
    }

    async fn begin(&self, call: MetadataCall) -> Result<()> {
        let (delay, failure) = {
            let mut state = self.state();
            *state.calls.entry(call).or_insert(0) += 1;
            let one_shot = state
                .one_shot_failures
                .get_mut(&call)
                .and_then(VecDeque::pop_front);
            let failure = one_shot.or_else(|| state.failures.get(&call).cloned());
            (state.delay, failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn generated_replicas(&self, identity: &PartitionKeyRangeIdentity) -> Vec<ReplicaAddress> {
        (0..3)
            .map(|n| {
                let uri = format!(
                    "rntbd://{}-{}-{}-{}/",
                    self.label, identity.collection_rid, identity.range_id, n
                );
                if n == 0 {
                    ReplicaAddress::primary(uri)
                } else {
                    ReplicaAddress::secondary(uri)
                }
            })
            .collect()
    }
}

#[async_trait]
impl MetadataReader for InMemoryMetadataReader {
    async fn fetch_collection(&self, link: &str) -> Result<CollectionMetadata> {
        self.begin(MetadataCall::Collection).await?;
        self.state()
            .collections
            .get(link)
            .cloned()
            .ok_or_else(|| RoutingError::CollectionGone {
                link: link.to_string(),
            })
    }

    async fn fetch_partition_key_ranges(
        &self,
        collection_rid: &str,
        range: &EffectiveKeyRange,
    ) -> Result<Vec<PartitionKeyRange>> {
        self.begin(MetadataCall::PartitionKeyRanges).await?;
        let mut state = self.state();
        state.last_range_query = Some(range.clone());
        let ranges = state
            .ranges
            .get(collection_rid)
            .ok_or_else(|| unknown_collection(collection_rid))?;
        let mut overlapping: Vec<PartitionKeyRange> = ranges
            .iter()
            .filter(|candidate| candidate.range.overlaps(range))
            .cloned()
            .collect();
        overlapping.sort_by(|a, b| a.min().cmp(b.min()));
        Ok(overlapping)
    }

    async fn fetch_replica_addresses(
        &self,
        identity: &PartitionKeyRangeIdentity,
    ) -> Result<Vec<ReplicaAddress>> {
        self.begin(MetadataCall::ReplicaAddresses).await?;
        let explicit = self.state().addresses.get(identity).cloned();
        Ok(explicit.unwrap_or_else(|| self.generated_replicas(identity)))
    }

    async fn fetch_account_topology(&self, endpoint: &str) -> Result<DatabaseAccount> {
        *self
            .state()
            .topology_calls
            .entry(endpoint.to_string())
            .or_insert(0) += 1;
        self.begin(MetadataCall::AccountTopology).await?;

        let state = self.state();
        if state.unreachable.contains(endpoint) {
            return Err(RoutingError::TransientFetchFailure(format!(
                "Endpoint '{}' is unreachable",
                endpoint
            )));
        }
        Ok(state.account.clone().unwrap_or_else(|| DatabaseAccount {
            writable_locations: vec![AccountRegion::new("default", endpoint)],
            readable_locations: vec![AccountRegion::new("default", endpoint)],
            enable_multiple_write_locations: false,
        }))
    }
}

fn full_range(id: &str) -> PartitionKeyRange {
    PartitionKeyRange {
        id: id.to_string(),
        range: EffectiveKeyRange::full(),
        parents: Vec::new(),
    }
}

fn unknown_collection(collection_rid: &str) -> RoutingError {
    RoutingError::CollectionGone {
        link: collection_rid.to_string(),
    }
}

fn unknown_range(collection_rid: &str, range_id: &str) -> RoutingError {
    RoutingError::InvalidRequest(format!(
        "Collection '{}' has no range '{}'",
        collection_rid, range_id
    ))
}
