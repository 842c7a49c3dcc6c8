//! Provider API module.
//!
//! HTTP client for the REST provider endpoint the built-in adapters call.

mod client;
mod types;

pub use client::{ProviderClient, classify_status};
pub use types::{ProviderResource, ResourceRequest};
