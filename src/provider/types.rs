//! Wire types for the provider REST API.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::model::ResolvedAttributes;

/// Body of a create or update request.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceRequest<'a> {
    /// Region the resource lives in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<&'a str>,
    /// Resolved attributes.
    pub attributes: &'a ResolvedAttributes,
}

/// A resource as returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderResource {
    /// Provider-assigned identifier.
    pub id: String,
    /// Computed outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// Error body returned by the provider.
#[derive(Debug, Deserialize)]
pub(crate) struct ProviderErrorBody {
    #[serde(alias = "error")]
    pub message: String,
}
