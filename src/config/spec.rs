//! Deployment file types.
//!
//! This module defines the structs that map to a `*.deploy.yaml` file.
//! Resource attributes are kept as raw JSON here; the model layer turns them
//! into typed attribute values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The root structure of a deployment file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentFile {
    /// Deployment identity.
    pub deployment: DeploymentConfig,
    /// Provider endpoint configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Executor settings.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Declared resources, in input order.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Stack outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputConfig>,
}

/// Deployment identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentConfig {
    /// Deployment name.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Provider endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Base URL of the provider API.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Region passed to the provider with every call.
    #[serde(default)]
    pub region: Option<String>,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (AWS default chain if unset).
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// What to do with already-applied actions when an apply fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RollbackPolicy {
    /// Revert every step applied in the run, newest first.
    #[default]
    Cascade,
    /// Leave applied actions in place.
    None,
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Total attempts per adapter call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the second attempt, in milliseconds.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Upper bound for any single backoff, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Timeout for a single adapter call, in seconds.
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
    /// Maximum number of actions in flight at once.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Rollback policy on failure.
    #[serde(default)]
    pub rollback: RollbackPolicy,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Logical identifier, unique within the deployment.
    pub id: String,
    /// Resource type tag from the catalog.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Explicit dependencies.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Declared attributes; strings may contain `${resource.output}` references.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// A declared stack output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Output expression.
    pub value: Value,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_provider_timeout() -> u64 {
    30
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_action_timeout() -> u64 {
    600
}

const fn default_parallelism() -> usize {
    1
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: None,
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            action_timeout_secs: default_action_timeout(),
            parallelism: default_parallelism(),
            rollback: RollbackPolicy::default(),
        }
    }
}

impl DeploymentConfig {
    /// Returns the deployment identity (`<name>-<environment>`).
    ///
    /// Used as the state key and the lock key.
    #[must_use]
    pub fn identity(&self) -> String {
        format!("{}-{}", self.name, self.environment)
    }
}

impl DeploymentFile {
    /// Returns the logical identifiers of all declared resources.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.id.as_str()).collect()
    }
}

impl ExecutionConfig {
    /// Returns the backoff to wait after `attempt` failed attempts.
    ///
    /// `base * 2^(attempt-1)`, capped at `max_backoff_ms`.
    #[must_use]
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        self.base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms)
    }
}
