pub mod error;
pub mod partition_key;
pub mod types;

pub use error::{ErrorCategory, Result, RoutingError};
pub use partition_key::{
    EffectiveKey, PartitionKey, PartitionKeyComponent, PartitionKeyDefinition, PartitionKind,
};
pub use types::{
    AccountRegion, AddressSet, CollectionMetadata, DatabaseAccount, EffectiveKeyRange,
    EndpointHealth, OperationKind, PartitionKeyRange, PartitionKeyRangeIdentity, Protocol,
    RegionalEndpoint, ReplicaAddress, ReplicaRole, RequestContext, RequestTarget,
    normalize_collection_link,
};
