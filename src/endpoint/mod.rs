pub mod manager;
pub mod worker;

pub use manager::{DEFAULT_REGION, FailoverCursor, GlobalEndpointManager};
pub use worker::TopologyRefreshWorker;
