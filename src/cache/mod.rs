pub mod address;
pub mod async_cache;
pub mod collection;
pub mod partition_key_range;

pub use address::AddressCache;
pub use async_cache::{
    AsyncCache, CacheEntry, CacheLookup, CacheStats, FetchObserver, FetchOutcome, PendingFetch,
};
pub use collection::CollectionCache;
pub use partition_key_range::PartitionKeyRangeCache;
