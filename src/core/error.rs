use thiserror::Error;

/// Errors produced by the routing layer.
///
/// `Clone` because a single failed fetch is handed to every caller that was
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Collection '{link}' is gone")]
    CollectionGone { link: String },

    #[error("Partition key range '{range_id}' of collection '{collection_rid}' is gone")]
    PartitionKeyRangeGone {
        collection_rid: String,
        range_id: String,
    },

    #[error("Replica set of partition key range '{range_id}' of collection '{collection_rid}' changed")]
    ReplicaSetChanged {
        collection_rid: String,
        range_id: String,
    },

    #[error("Transient fetch failure: {0}")]
    TransientFetchFailure(String),

    #[error("Topology unavailable: {0}")]
    TopologyUnavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Coarse classification used by callers deciding how to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Cached metadata no longer matches the service; invalidate and retry.
    StaleMetadata,
    /// The fetch may succeed if attempted again later.
    Transient,
    /// No region can serve the request.
    Fatal,
    /// The request or configuration itself is wrong; retrying will not help.
    Caller,
}

impl RoutingError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::CollectionGone { .. }
            | Self::PartitionKeyRangeGone { .. }
            | Self::ReplicaSetChanged { .. } => ErrorCategory::StaleMetadata,
            Self::TransientFetchFailure(_) => ErrorCategory::Transient,
            Self::TopologyUnavailable(_) => ErrorCategory::Fatal,
            Self::InvalidRequest(_) | Self::ConfigError(_) => ErrorCategory::Caller,
        }
    }

    pub fn is_stale_metadata(&self) -> bool {
        self.category() == ErrorCategory::StaleMetadata
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub(crate) fn partition_key_range_gone(
        collection_rid: impl Into<String>,
        range_id: impl Into<String>,
    ) -> Self {
        Self::PartitionKeyRangeGone {
            collection_rid: collection_rid.into(),
            range_id: range_id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RoutingError>;

impl<T> From<std::sync::PoisonError<T>> for RoutingError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::TransientFetchFailure(format!("lock poisoned: {}", err))
    }
}

impl From<serde_json::Error> for RoutingError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigError(err.to_string())
    }
}
