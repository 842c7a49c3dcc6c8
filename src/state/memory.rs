//! In-memory state backend.
//!
//! Keeps the snapshot in process memory. Used by tests and dry runs.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{KeelError, Result, StateError};

use super::lock::{LockInfo, holder_or_generated, lock_lost};
use super::store::{StateMutation, StateStore};
use super::types::StateSnapshot;

/// In-memory state store.
#[derive(Debug)]
pub struct MemoryStateStore {
    deployment: String,
    environment: String,
    snapshot: Mutex<Option<StateSnapshot>>,
    lock: Mutex<Option<LockInfo>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(deployment: &str, environment: &str) -> Self {
        Self {
            deployment: deployment.to_string(),
            environment: environment.to_string(),
            snapshot: Mutex::new(None),
            lock: Mutex::new(None),
        }
    }

    /// Creates a store seeded with `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            deployment: snapshot.deployment.clone(),
            environment: snapshot.environment.clone(),
            snapshot: Mutex::new(Some(snapshot)),
            lock: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        Ok(self
            .snapshot
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| StateSnapshot::new(&self.deployment, &self.environment)))
    }

    async fn update(&self, mutation: StateMutation) -> Result<()> {
        let mut guard = self.snapshot.lock().await;
        let snapshot =
            guard.get_or_insert_with(|| StateSnapshot::new(&self.deployment, &self.environment));
        mutation.apply_to(snapshot);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.snapshot.lock().await = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.snapshot.lock().await.is_some())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut guard = self.lock.lock().await;
        if let Some(existing) = guard.as_ref().filter(|l| !l.is_expired()) {
            return Err(KeelError::State(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }));
        }

        let lock_info = LockInfo::new(&holder_or_generated(holder));
        *guard = Some(lock_info.clone());
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut guard = self.lock.lock().await;
        if guard.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *guard = None;
        }
        Ok(())
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut guard = self.lock.lock().await;
        match guard.as_mut().filter(|l| l.lock_id == lock_id) {
            Some(lock) => {
                lock.refresh();
                Ok(lock.clone())
            }
            None => Err(lock_lost(lock_id)),
        }
    }

    async fn force_unlock(&self) -> Result<bool> {
        Ok(self.lock.lock().await.take().is_some())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
