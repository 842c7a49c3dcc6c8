//! State store trait definition.
//!
//! Backends store one JSON document per deployment. Every write goes through
//! [`StateStore::update`], which applies a single [`StateMutation`] to the
//! latest document and persists the whole document atomically.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use super::lock::LockInfo;
use super::types::{ResourceRecord, RunHistoryEntry, STATE_VERSION, StateSnapshot};
use crate::error::{KeelError, Result, StateError};

/// One atomic change to a snapshot.
#[derive(Debug, Clone)]
pub enum StateMutation {
    /// Insert or replace one resource record.
    Commit {
        /// Logical identifier.
        id: String,
        /// The new record.
        record: ResourceRecord,
    },
    /// Remove one resource record.
    Remove {
        /// Logical identifier.
        id: String,
    },
    /// Replace the stack outputs.
    SetOutputs(BTreeMap<String, Value>),
    /// Append a run to the history.
    RecordRun(RunHistoryEntry),
}

impl StateMutation {
    /// Applies the mutation to an in-memory snapshot.
    pub fn apply_to(self, snapshot: &mut StateSnapshot) {
        match self {
            Self::Commit { id, record } => snapshot.upsert(&id, record),
            Self::Remove { id } => {
                snapshot.remove(&id);
            }
            Self::SetOutputs(outputs) => {
                snapshot.outputs = outputs;
                snapshot.last_updated = chrono::Utc::now();
            }
            Self::RecordRun(entry) => snapshot.add_history(entry),
        }
    }

    /// Short description for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Commit { id, .. } => format!("commit {id}"),
            Self::Remove { id } => format!("remove {id}"),
            Self::SetOutputs(outputs) => format!("set {} output(s)", outputs.len()),
            Self::RecordRun(entry) => format!("record {} run", entry.operation),
        }
    }
}

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the current snapshot.
    ///
    /// Returns an empty snapshot if none exists yet.
    async fn load(&self) -> Result<StateSnapshot>;

    /// Applies one mutation to the stored snapshot atomically.
    async fn update(&self, mutation: StateMutation) -> Result<()>;

    /// Records that a resource was applied.
    async fn commit(&self, id: &str, record: ResourceRecord) -> Result<()> {
        self.update(StateMutation::Commit {
            id: id.to_string(),
            record,
        })
        .await
    }

    /// Removes a resource record.
    async fn remove(&self, id: &str) -> Result<()> {
        self.update(StateMutation::Remove { id: id.to_string() }).await
    }

    /// Replaces the recorded stack outputs.
    async fn save_outputs(&self, outputs: BTreeMap<String, Value>) -> Result<()> {
        self.update(StateMutation::SetOutputs(outputs)).await
    }

    /// Appends a run to the history.
    async fn record_run(&self, entry: RunHistoryEntry) -> Result<()> {
        self.update(StateMutation::RecordRun(entry)).await
    }

    /// Deletes the stored state.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the exclusive deployment lock.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still holds it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Extends the expiry of the lock held under `lock_id`.
    ///
    /// Fails if the lock was released or taken over.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Removes any lock regardless of holder.
    ///
    /// Returns true if a lock was removed.
    async fn force_unlock(&self) -> Result<bool>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if an unexpired lock is held.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Parses a stored document, checking the format version.
pub(crate) fn parse_snapshot(content: &str) -> Result<StateSnapshot> {
    let snapshot: StateSnapshot = serde_json::from_str(content).map_err(|e| {
        KeelError::State(StateError::Corrupted {
            message: format!("Failed to parse state: {e}"),
        })
    })?;

    let major = |v: &str| v.split('.').next().unwrap_or_default().to_string();
    if major(&snapshot.version) != major(STATE_VERSION) {
        return Err(KeelError::State(StateError::VersionMismatch {
            expected: STATE_VERSION.to_string(),
            found: snapshot.version,
        }));
    }

    Ok(snapshot)
}

/// Serializes a snapshot for storage.
pub(crate) fn serialize_snapshot(snapshot: &StateSnapshot) -> Result<String> {
    serde_json::to_string_pretty(snapshot).map_err(|e| {
        KeelError::State(StateError::serialization(format!(
            "Failed to serialize state: {e}"
        )))
    })
}
