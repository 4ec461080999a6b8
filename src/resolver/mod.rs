pub mod address_resolver;
pub mod global;

pub use address_resolver::{AddressResolver, ResolvedRoute};
pub use global::GlobalAddressResolver;
