//! Resource-type catalog.
//!
//! The capability interface ([`ResourceAdapter`]), the registry that maps
//! type tags to adapters, and the built-in kinds.

mod adapter;
mod kinds;
mod registry;
mod schema;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::{ApplyOutcome, ResourceAdapter};
pub use kinds::{ProviderAdapter, ResourceKind};
pub use registry::AdapterRegistry;
pub use schema::{Mutability, TypeSchema};
