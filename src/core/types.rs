use super::partition_key::{EffectiveKey, PartitionKey, PartitionKeyDefinition};
use super::{Result, RoutingError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata of one collection as returned by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    /// Name-based link, e.g. `dbs/shop/colls/catalog`.
    pub link: String,
    /// Resource id. Changes when a collection is deleted and recreated
    /// under the same name.
    pub resource_id: String,
    pub partition_key: PartitionKeyDefinition,
}

impl CollectionMetadata {
    pub fn new(
        link: impl Into<String>,
        resource_id: impl Into<String>,
        partition_key: PartitionKeyDefinition,
    ) -> Self {
        Self {
            link: link.into(),
            resource_id: resource_id.into(),
            partition_key,
        }
    }
}

/// Normalizes a collection link to the `dbs/{db}/colls/{coll}` form.
pub fn normalize_collection_link(link: &str) -> Result<String> {
    let trimmed = link.trim().trim_matches('/');
    let segments: Vec<&str> = trimmed.split('/').collect();
    let well_formed = segments.len() == 4
        && segments[0] == "dbs"
        && segments[2] == "colls"
        && !segments[1].is_empty()
        && !segments[3].is_empty();
    if !well_formed {
        return Err(RoutingError::InvalidRequest(format!(
            "Collection link '{}' must have the form dbs/{{db}}/colls/{{coll}}",
            link
        )));
    }
    Ok(trimmed.to_string())
}

/// Half-open interval `[min, max)` of the effective-key space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EffectiveKeyRange {
    pub min: EffectiveKey,
    pub max: EffectiveKey,
}

impl EffectiveKeyRange {
    /// Creates a range; `min` must be strictly below `max`.
    pub fn new(min: EffectiveKey, max: EffectiveKey) -> Result<Self> {
        if min >= max {
            return Err(RoutingError::InvalidRequest(format!(
                "Effective key range [{}, {}) is empty",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self {
            min: EffectiveKey::Min,
            max: EffectiveKey::Max,
        }
    }

    pub fn contains(&self, key: &EffectiveKey) -> bool {
        *key >= self.min && *key < self.max
    }

    pub fn overlaps(&self, other: &EffectiveKeyRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// Returns true if `other` lies entirely inside this range.
    pub fn covers(&self, other: &EffectiveKeyRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }
}

impl fmt::Display for EffectiveKeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// A contiguous interval of the effective-key space backed by one physical
/// partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionKeyRange {
    pub id: String,
    pub range: EffectiveKeyRange,
    /// Ids of the ranges this one was split or merged from.
    #[serde(default)]
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    pub fn new(id: impl Into<String>, min: EffectiveKey, max: EffectiveKey) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            range: EffectiveKeyRange::new(min, max)?,
            parents: Vec::new(),
        })
    }

    pub fn with_parents(mut self, parents: Vec<String>) -> Self {
        self.parents = parents;
        self
    }

    pub fn min(&self) -> &EffectiveKey {
        &self.range.min
    }

    pub fn max(&self) -> &EffectiveKey {
        &self.range.max
    }
}

/// Identifies a partition key range globally; range ids are only unique
/// inside one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKeyRangeIdentity {
    pub collection_rid: String,
    pub range_id: String,
}

impl PartitionKeyRangeIdentity {
    pub fn new(collection_rid: impl Into<String>, range_id: impl Into<String>) -> Self {
        Self {
            collection_rid: collection_rid.into(),
            range_id: range_id.into(),
        }
    }
}

impl fmt::Display for PartitionKeyRangeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection_rid, self.range_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Https,
}

/// One physical replica of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaAddress {
    pub uri: String,
    pub role: ReplicaRole,
    pub protocol: Protocol,
    /// Last time this address was confirmed by the metadata service.
    pub last_known_good: DateTime<Utc>,
}

impl ReplicaAddress {
    pub fn new(uri: impl Into<String>, role: ReplicaRole, protocol: Protocol) -> Self {
        Self {
            uri: uri.into(),
            role,
            protocol,
            last_known_good: Utc::now(),
        }
    }

    pub fn primary(uri: impl Into<String>) -> Self {
        Self::new(uri, ReplicaRole::Primary, Protocol::Tcp)
    }

    pub fn secondary(uri: impl Into<String>) -> Self {
        Self::new(uri, ReplicaRole::Secondary, Protocol::Tcp)
    }

    pub fn is_primary(&self) -> bool {
        self.role == ReplicaRole::Primary
    }
}

/// Ordered replica list of one partition key range: primary first, then
/// secondaries ordered by URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSet {
    identity: PartitionKeyRangeIdentity,
    replicas: Vec<ReplicaAddress>,
}

impl AddressSet {
    /// Builds the ordered set, stamping every replica as confirmed at `confirmed_at`.
    pub fn new(
        identity: PartitionKeyRangeIdentity,
        mut replicas: Vec<ReplicaAddress>,
        confirmed_at: DateTime<Utc>,
    ) -> Result<Self> {
        if replicas.is_empty() {
            return Err(RoutingError::TransientFetchFailure(format!(
                "No replica addresses returned for partition key range {}",
                identity
            )));
        }
        if replicas.iter().filter(|replica| replica.is_primary()).count() > 1 {
            return Err(RoutingError::TransientFetchFailure(format!(
                "More than one primary returned for partition key range {}",
                identity
            )));
        }
        replicas.sort_by(|a, b| {
            b.is_primary()
                .cmp(&a.is_primary())
                .then_with(|| a.uri.cmp(&b.uri))
        });
        replicas.dedup_by(|a, b| a.uri == b.uri);
        for replica in &mut replicas {
            replica.last_known_good = confirmed_at;
        }
        Ok(Self { identity, replicas })
    }

    pub fn identity(&self) -> &PartitionKeyRangeIdentity {
        &self.identity
    }

    pub fn replicas(&self) -> &[ReplicaAddress] {
        &self.replicas
    }

    pub fn primary(&self) -> Option<&ReplicaAddress> {
        self.replicas.first().filter(|replica| replica.is_primary())
    }
}

/// Health of one regional endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointHealth {
    Healthy,
    Suspected,
    Unavailable,
}

/// A region of the account together with its health bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionalEndpoint {
    pub region: String,
    pub uri: String,
    pub health: EndpointHealth,
    pub consecutive_failures: u32,
    pub last_transition: DateTime<Utc>,
}

impl RegionalEndpoint {
    pub fn new(region: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            uri: uri.into(),
            health: EndpointHealth::Healthy,
            consecutive_failures: 0,
            last_transition: Utc::now(),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.health != EndpointHealth::Unavailable
    }
}

/// A location entry of the account document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRegion {
    pub name: String,
    pub database_account_endpoint: String,
}

impl AccountRegion {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database_account_endpoint: endpoint.into(),
        }
    }
}

/// Account topology document: which regions accept writes and reads.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseAccount {
    #[serde(default)]
    pub writable_locations: Vec<AccountRegion>,
    #[serde(default)]
    pub readable_locations: Vec<AccountRegion>,
    #[serde(default)]
    pub enable_multiple_write_locations: bool,
}

impl DatabaseAccount {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| {
            RoutingError::TransientFetchFailure(format!("Malformed account document: {}", err))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
}

/// Which partition a request addresses.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestTarget {
    PartitionKey(PartitionKey),
    PartitionKeyRangeId(String),
}

/// What the request pipeline knows about a request when asking for a route.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub collection_link: String,
    pub target: RequestTarget,
    pub operation: OperationKind,
    /// Bypasses every cache level; set by the retry layer after a routing
    /// related failure.
    pub force_refresh_partition_addresses: bool,
    /// Endpoint chosen by the caller's failover cursor, if any.
    pub endpoint_override: Option<String>,
}

impl RequestContext {
    pub fn for_partition_key(collection_link: impl Into<String>, key: PartitionKey) -> Self {
        Self {
            collection_link: collection_link.into(),
            target: RequestTarget::PartitionKey(key),
            operation: OperationKind::Read,
            force_refresh_partition_addresses: false,
            endpoint_override: None,
        }
    }

    pub fn for_range_id(collection_link: impl Into<String>, range_id: impl Into<String>) -> Self {
        Self {
            collection_link: collection_link.into(),
            target: RequestTarget::PartitionKeyRangeId(range_id.into()),
            operation: OperationKind::Read,
            force_refresh_partition_addresses: false,
            endpoint_override: None,
        }
    }

    pub fn write(mut self) -> Self {
        self.operation = OperationKind::Write;
        self
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh_partition_addresses = force;
        self
    }

    pub fn on_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> PartitionKeyRangeIdentity {
        PartitionKeyRangeIdentity::new("rid-1", "0")
    }

    #[test]
    fn collection_links_are_normalized() {
        assert_eq!(
            normalize_collection_link("/dbs/shop/colls/catalog/").unwrap(),
            "dbs/shop/colls/catalog"
        );
        assert!(normalize_collection_link("dbs/shop").is_err());
        assert!(normalize_collection_link("dbs//colls/catalog").is_err());
    }

    #[test]
    fn empty_effective_key_range_is_rejected() {
        let key = EffectiveKey::from("m");
        assert!(EffectiveKeyRange::new(key.clone(), key).is_err());
        assert!(EffectiveKeyRange::new(EffectiveKey::Max, EffectiveKey::Min).is_err());
    }

    #[test]
    fn ranges_are_half_open() {
        let range = EffectiveKeyRange::new(EffectiveKey::from("a"), EffectiveKey::from("m")).unwrap();
        assert!(range.contains(&EffectiveKey::from("a")));
        assert!(range.contains(&EffectiveKey::from("lzz")));
        assert!(!range.contains(&EffectiveKey::from("m")));

        let upper = EffectiveKeyRange::new(EffectiveKey::from("m"), EffectiveKey::Max).unwrap();
        assert!(!range.overlaps(&upper));
        assert!(EffectiveKeyRange::full().covers(&upper));
    }

    #[test]
    fn address_set_orders_primary_first() {
        let set = AddressSet::new(
            identity(),
            vec![
                ReplicaAddress::secondary("rntbd://c:1/"),
                ReplicaAddress::primary("rntbd://b:1/"),
                ReplicaAddress::secondary("rntbd://a:1/"),
            ],
            Utc::now(),
        )
        .unwrap();

        let uris: Vec<&str> = set.replicas().iter().map(|r| r.uri.as_str()).collect();
        assert_eq!(uris, vec!["rntbd://b:1/", "rntbd://a:1/", "rntbd://c:1/"]);
        assert_eq!(set.primary().map(|r| r.uri.as_str()), Some("rntbd://b:1/"));
    }

    #[test]
    fn address_set_rejects_empty_and_double_primary() {
        assert!(AddressSet::new(identity(), Vec::new(), Utc::now()).is_err());
        assert!(
            AddressSet::new(
                identity(),
                vec![
                    ReplicaAddress::primary("rntbd://a:1/"),
                    ReplicaAddress::primary("rntbd://b:1/"),
                ],
                Utc::now(),
            )
            .is_err()
        );
    }

    #[test]
    fn account_document_parses_from_json() {
        let account = DatabaseAccount::from_json_str(
            r#"{
                "writableLocations": [
                    {"name": "West US", "databaseAccountEndpoint": "https://acct-westus:443/"}
                ],
                "readableLocations": [
                    {"name": "West US", "databaseAccountEndpoint": "https://acct-westus:443/"},
                    {"name": "East US", "databaseAccountEndpoint": "https://acct-eastus:443/"}
                ],
                "enableMultipleWriteLocations": false
            }"#,
        )
        .unwrap();

        assert_eq!(account.writable_locations.len(), 1);
        assert_eq!(account.readable_locations[1].name, "East US");
        assert!(!account.enable_multiple_write_locations);
    }
}
