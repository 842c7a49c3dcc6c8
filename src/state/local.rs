//! Local file-based state storage backend.
//!
//! State lives in `<base>/<deployment>-<environment>/state.json`. Writes go
//! to a temp file that is synced and renamed over the state file, so readers
//! never see a partial document.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{KeelError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, holder_or_generated, lock_lost};
use super::store::{StateMutation, StateStore, parse_snapshot, serialize_snapshot};
use super::types::StateSnapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".keel";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    deployment: String,
    environment: String,
    dir: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
    /// Serialises read-modify-write cycles within this process.
    write_guard: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a store rooted at `base_dir` for one deployment.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, deployment: &str, environment: &str) -> Self {
        let dir = base_dir.into().join(format!("{deployment}-{environment}"));
        let state_path = dir.join(STATE_FILE);
        let lock_path = dir.join(LOCK_FILE);

        Self {
            deployment: deployment.to_string(),
            environment: environment.to_string(),
            dir,
            state_path,
            lock_path,
            write_guard: Mutex::new(()),
        }
    }

    /// Returns the path of the state file.
    #[must_use]
    pub const fn state_path(&self) -> &PathBuf {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            debug!("Creating state directory: {}", self.dir.display());
            fs::create_dir_all(&self.dir).await.map_err(|e| {
                KeelError::State(StateError::file(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    async fn read_snapshot(&self) -> Result<Option<StateSnapshot>> {
        match fs::read_to_string(&self.state_path).await {
            Ok(content) => parse_snapshot(&content).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeelError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })),
        }
    }

    async fn write_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.ensure_dir().await?;
        let content = serialize_snapshot(snapshot)?;
        let temp_path = self.state_path.with_extension("tmp");

        let file_err = |what: &str, e: std::io::Error| {
            KeelError::State(StateError::file(format!("Failed to {what} state file: {e}")))
        };

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| file_err("create temp", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| file_err("write", e))?;
        file.sync_all().await.map_err(|e| file_err("sync", e))?;
        drop(file);

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| file_err("rename", e))?;

        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(KeelError::State(StateError::Corrupted {
                    message: format!("Failed to read lock file: {e}"),
                }));
            }
        };

        let lock_info = serde_json::from_str(&content).map_err(|e| {
            KeelError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file; fails with `AlreadyExists` if one is present.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await
    }

    /// Replaces the lock file contents through a temp file and rename.
    async fn rewrite_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let lock_err = |e: std::io::Error| {
            KeelError::State(StateError::LockFailed {
                message: format!("Failed to rewrite lock file: {e}"),
            })
        };
        let content = serde_json::to_string_pretty(lock_info).map_err(|e| {
            KeelError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;
        let temp_path = self.lock_path.with_extension("lock.tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(lock_err)?;
        file.write_all(content.as_bytes()).await.map_err(lock_err)?;
        file.sync_all().await.map_err(lock_err)?;
        drop(file);

        fs::rename(&temp_path, &self.lock_path).await.map_err(lock_err)
    }

    async fn delete_lock_file(&self) -> Result<bool> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(KeelError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        debug!("Loading state from: {}", self.state_path.display());
        Ok(self
            .read_snapshot()
            .await?
            .unwrap_or_else(|| StateSnapshot::new(&self.deployment, &self.environment)))
    }

    async fn update(&self, mutation: StateMutation) -> Result<()> {
        let _guard = self.write_guard.lock().await;

        debug!("State update: {}", mutation.describe());
        let mut snapshot = self
            .read_snapshot()
            .await?
            .unwrap_or_else(|| StateSnapshot::new(&self.deployment, &self.environment));
        mutation.apply_to(&mut snapshot);
        self.write_snapshot(&snapshot).await
    }

    async fn delete(&self) -> Result<()> {
        let _guard = self.write_guard.lock().await;

        match fs::remove_file(&self.state_path).await {
            Ok(()) => info!("Deleted state file: {}", self.state_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(KeelError::State(StateError::file(format!(
                    "Failed to delete state file: {e}"
                ))));
            }
        }

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;
        let lock_info = LockInfo::new(&holder_or_generated(holder));

        // One takeover attempt for an expired lock.
        for _ in 0..2 {
            match self.create_lock_file(&lock_info).await {
                Ok(()) => {
                    info!(
                        "Acquired state lock: {} (expires in {}s)",
                        lock_info.lock_id, LOCK_EXPIRY_SECS
                    );
                    return Ok(lock_info);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match self.read_lock_file().await? {
                        Some(existing) if !existing.is_expired() => {
                            return Err(KeelError::State(StateError::LockedByOther {
                                holder: existing.holder,
                                since: existing.acquired_at.to_rfc3339(),
                            }));
                        }
                        _ => {
                            warn!("Expired lock found, taking over");
                            self.delete_lock_file().await?;
                        }
                    }
                }
                Err(e) => {
                    return Err(KeelError::State(StateError::LockFailed {
                        message: format!("Failed to create lock file: {e}"),
                    }));
                }
            }
        }

        Err(KeelError::State(StateError::LockFailed {
            message: String::from("Lock was re-acquired by another process during takeover"),
        }))
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let _guard = self.write_guard.lock().await;

        let mut lock_info = self
            .read_lock_file()
            .await?
            .filter(|l| l.lock_id == lock_id)
            .ok_or_else(|| lock_lost(lock_id))?;
        lock_info.refresh();
        self.rewrite_lock_file(&lock_info).await?;

        debug!("Refreshed state lock: {lock_id} (expires {})", lock_info.expires_at);
        Ok(lock_info)
    }

    async fn force_unlock(&self) -> Result<bool> {
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
