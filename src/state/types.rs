//! State types for tracking what was last applied.
//!
//! The snapshot is the diff baseline: one [`ResourceRecord`] per logical
//! resource, plus the resolved stack outputs and a bounded run history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::model::ResolvedAttributes;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
pub const MAX_HISTORY: usize = 100;

/// The persisted state of one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Deployment name.
    pub deployment: String,
    /// Environment name.
    pub environment: String,
    /// Applied resources keyed by logical identifier.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
    /// Resolved stack outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// When the state was last written.
    pub last_updated: DateTime<Utc>,
    /// Recent runs, oldest first.
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// What was last applied for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Type tag from the catalog.
    pub resource_type: String,
    /// Fingerprint of the type and resolved attributes.
    pub fingerprint: String,
    /// Attributes actually sent to the provider.
    #[serde(default)]
    pub attributes: ResolvedAttributes,
    /// Provider-assigned identifier.
    pub physical_id: String,
    /// Outputs returned by the provider.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Logical identifiers this resource depended on when applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// When the record was last written.
    pub applied_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Kind of run.
    pub operation: RunOperation,
    /// Resources the run touched.
    pub resources: Vec<String>,
    /// Whether the run succeeded.
    pub success: bool,
    /// Error message for failed runs.
    #[serde(default)]
    pub error: Option<String>,
}

/// Kinds of runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Converging towards the deployment file.
    Apply,
    /// Deleting every recorded resource.
    Destroy,
}

impl StateSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new(deployment: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            deployment: deployment.to_string(),
            environment: environment.to_string(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Looks up a record by logical identifier.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceRecord> {
        self.resources.get(id)
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Inserts or replaces a record.
    pub fn upsert(&mut self, id: &str, record: ResourceRecord) {
        self.resources.insert(id.to_string(), record);
        self.touch();
    }

    /// Removes a record.
    pub fn remove(&mut self, id: &str) -> Option<ResourceRecord> {
        let removed = self.resources.remove(id);
        self.touch();
        removed
    }

    /// Appends a history entry, dropping the oldest past [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        self.history.push(entry);
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.touch();
    }

    /// Looks up a resolved stack output.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    /// Returns the last history entry.
    #[must_use]
    pub fn last_run(&self) -> Option<&RunHistoryEntry> {
        self.history.last()
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

impl ResourceRecord {
    /// Looks up an output value.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }
}

impl RunHistoryEntry {
    /// Creates a history entry stamped now.
    #[must_use]
    pub fn new(
        operation: RunOperation,
        resources: Vec<String>,
        success: bool,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            resources,
            success,
            error,
        }
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_record(resource_type: &str, physical_id: &str) -> ResourceRecord {
    ResourceRecord {
        resource_type: resource_type.to_string(),
        fingerprint: format!("fp-{physical_id}"),
        attributes: ResolvedAttributes::new(),
        physical_id: physical_id.to_string(),
        outputs: BTreeMap::from([("id".to_string(), Value::String(physical_id.to_string()))]),
        dependencies: Vec::new(),
        applied_at: Utc::now(),
    }
}
