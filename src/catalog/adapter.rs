//! The capability interface every resource type implements.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::schema::TypeSchema;
use crate::error::{AdapterError, ValidationError};
use crate::model::{Attributes, ResolvedAttributes};

/// What an adapter returns after creating or updating an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Provider-assigned identifier.
    pub physical_id: String,
    /// Computed outputs, e.g. `id` or `dns_name`.
    pub outputs: BTreeMap<String, Value>,
}

/// A resource type the engine can plan and apply.
///
/// `apply(None, ..)` creates; `apply(Some(id), ..)` updates the object in
/// place. Errors are classified so the executor knows what to retry.
#[async_trait]
pub trait ResourceAdapter: Send + Sync + fmt::Debug {
    /// Static metadata for the type.
    fn schema(&self) -> &TypeSchema;

    /// The type tag this adapter handles.
    fn type_name(&self) -> &str {
        &self.schema().type_name
    }

    /// Validates declared attributes before planning.
    ///
    /// The default checks required attributes only.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the resource.
    fn validate(&self, resource: &str, attributes: &Attributes) -> Result<(), ValidationError> {
        self.schema().check_required(resource, attributes)
    }

    /// Creates or updates an object.
    async fn apply(
        &self,
        physical_id: Option<&str>,
        attributes: &ResolvedAttributes,
    ) -> Result<ApplyOutcome, AdapterError>;

    /// Deletes an object.
    async fn delete(&self, physical_id: &str) -> Result<(), AdapterError>;
}

impl ApplyOutcome {
    /// Creates an outcome; `id` is always present in the outputs.
    #[must_use]
    pub fn new(physical_id: impl Into<String>, mut outputs: BTreeMap<String, Value>) -> Self {
        let physical_id = physical_id.into();
        outputs
            .entry(String::from("id"))
            .or_insert_with(|| Value::String(physical_id.clone()));
        Self {
            physical_id,
            outputs,
        }
    }
}
