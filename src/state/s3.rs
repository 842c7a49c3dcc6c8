//! S3-based state storage backend.
//!
//! State lives at `s3://<bucket>/<prefix>/<deployment>-<environment>/state.json`.
//! A single PUT replaces the whole document, so readers see either the old or
//! the new snapshot. Lock writes are conditional (`If-None-Match: *` to
//! create, `If-Match: <etag>` to take over or refresh), so two processes
//! racing for the same lock cannot both win.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{KeelError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, holder_or_generated, lock_lost};
use super::store::{StateMutation, StateStore, parse_snapshot, serialize_snapshot};
use super::types::StateSnapshot;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// Precondition attached to a lock write.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LockWrite {
    /// Succeeds only if no lock object exists.
    Create,
    /// Succeeds only if the lock object still carries this ETag.
    Replace(String),
}

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    client: Client,
    bucket: String,
    /// Key prefix ending in `/`, including the deployment identity.
    prefix: String,
    deployment: String,
    environment: String,
    write_guard: Mutex<()>,
}

impl S3StateStore {
    /// Creates a new S3 state store using the AWS default credential chain.
    pub async fn new(
        bucket: &str,
        prefix: Option<&str>,
        region: Option<&str>,
        deployment: &str,
        environment: &str,
    ) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix, deployment, environment)
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(
        client: Client,
        bucket: &str,
        prefix: Option<&str>,
        deployment: &str,
        environment: &str,
    ) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: key_prefix(prefix, deployment, environment),
            deployment: deployment.to_string(),
            environment: environment.to_string(),
            write_guard: Mutex::new(()),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Fetches an object with its ETag.
    async fn get_object_tagged(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(str::to_string);
                let bytes = response.body.collect().await.map_err(|e| {
                    KeelError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    KeelError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some((content, etag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(KeelError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_object_tagged(key).await?.map(|(content, _)| content))
    }

    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| KeelError::State(StateError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| KeelError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<(LockInfo, Option<String>)>> {
        match self.get_object_tagged(&self.key(LOCK_KEY)).await? {
            Some((content, etag)) => Ok(Some((parse_lock(&content)?, etag))),
            None => Ok(None),
        }
    }

    /// Writes the lock object under `write`'s precondition.
    ///
    /// Returns false if another writer changed the lock first.
    async fn put_lock(&self, lock_info: &LockInfo, write: LockWrite) -> Result<bool> {
        let content = serde_json::to_string_pretty(lock_info).map_err(|e| {
            KeelError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(LOCK_KEY))
            .body(content.into_bytes().into())
            .content_type("application/json");
        let request = match write {
            LockWrite::Create => request.if_none_match("*"),
            LockWrite::Replace(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(sdk_err)
                if sdk_err
                    .raw_response()
                    .is_some_and(|r| lost_lock_race(r.status().as_u16())) =>
            {
                Ok(false)
            }
            Err(e) => Err(KeelError::State(StateError::s3(format!("S3 lock put error: {e}")))),
        }
    }

    async fn read_snapshot(&self) -> Result<Option<StateSnapshot>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(json) => parse_snapshot(&json).map(Some),
            None => Ok(None),
        }
    }

    fn empty_snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(&self.deployment, &self.environment)
    }
}

/// Builds `<prefix>/<deployment>-<environment>/`, ignoring stray slashes.
fn key_prefix(prefix: Option<&str>, deployment: &str, environment: &str) -> String {
    let identity = format!("{deployment}-{environment}");
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(p) => format!("{p}/{identity}/"),
        None => format!("{identity}/"),
    }
}

/// 412 means the precondition failed, 409 a concurrent conditional write.
const fn lost_lock_race(status: u16) -> bool {
    matches!(status, 409 | 412)
}

fn parse_lock(content: &str) -> Result<LockInfo> {
    serde_json::from_str(content).map_err(|e| {
        KeelError::State(StateError::Corrupted {
            message: format!("Failed to parse lock: {e}"),
        })
    })
}

fn locked_by(existing: &LockInfo) -> KeelError {
    KeelError::State(StateError::LockedByOther {
        holder: existing.holder.clone(),
        since: existing.acquired_at.to_rfc3339(),
    })
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        Ok(self
            .read_snapshot()
            .await?
            .unwrap_or_else(|| self.empty_snapshot()))
    }

    async fn update(&self, mutation: StateMutation) -> Result<()> {
        let _guard = self.write_guard.lock().await;

        debug!("State update: {}", mutation.describe());
        let mut snapshot = self
            .read_snapshot()
            .await?
            .unwrap_or_else(|| self.empty_snapshot());
        mutation.apply_to(&mut snapshot);

        let content = serialize_snapshot(&snapshot)?;
        self.put_object(&self.key(STATE_KEY), &content).await
    }

    async fn delete(&self) -> Result<()> {
        let key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{key}", self.bucket);
        self.delete_object(&key).await
    }

    async fn exists(&self) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(STATE_KEY))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(KeelError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let write = match self.read_lock().await? {
            None => LockWrite::Create,
            Some((existing, _)) if !existing.is_expired() => return Err(locked_by(&existing)),
            Some((_, Some(etag))) => {
                warn!("Expired lock found, taking over");
                LockWrite::Replace(etag)
            }
            Some((_, None)) => {
                return Err(KeelError::State(StateError::LockFailed {
                    message: String::from("Expired lock object has no ETag"),
                }));
            }
        };

        let lock_info = LockInfo::new(&holder_or_generated(holder));
        if !self.put_lock(&lock_info, write).await? {
            return Err(match self.get_lock_info().await? {
                Some(winner) => locked_by(&winner),
                None => KeelError::State(StateError::LockFailed {
                    message: String::from("Lock changed during acquisition"),
                }),
            });
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
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
        let Some((mut lock_info, etag)) = self
            .read_lock()
            .await?
            .filter(|(held, _)| held.lock_id == lock_id)
        else {
            return Err(lock_lost(lock_id));
        };
        let etag = etag.ok_or_else(|| lock_lost(lock_id))?;

        lock_info.refresh();
        if !self.put_lock(&lock_info, LockWrite::Replace(etag)).await? {
            return Err(lock_lost(lock_id));
        }

        debug!("Refreshed state lock: {lock_id} (expires {})", lock_info.expires_at);
        Ok(lock_info)
    }

    async fn force_unlock(&self) -> Result<bool> {
        if self.get_lock_info().await?.is_none() {
            return Ok(false);
        }
        self.delete_object(&self.key(LOCK_KEY)).await?;
        Ok(true)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.read_lock().await?.map(|(lock_info, _)| lock_info))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
