//! Error types for the Keel provisioning engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph construction and planning, adapter calls, and state
//! management. Every error that concerns a single resource names its logical
//! identifier.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Keel engine.
#[derive(Debug, Error)]
pub enum KeelError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Graph construction, validation and planning errors.
    #[error("Planning error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Resource adapter errors that escaped the executor.
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The deployment file was not found.
    #[error("Deployment file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The deployment file could not be parsed.
    #[error("Failed to parse deployment file: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// An attribute expression could not be parsed.
    #[error("Invalid expression in '{resource}': {message}")]
    InvalidExpression {
        /// Resource (or output) containing the expression.
        resource: String,
        /// Description of the problem.
        message: String,
    },
}

/// A validation failure for a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{resource}: {message}")]
pub struct ValidationError {
    /// Logical identifier of the offending resource.
    pub resource: String,
    /// What is wrong with it.
    pub message: String,
}

/// Errors raised while building, resolving or validating the resource graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", participants.join(" -> "))]
    Cycle {
        /// Resources participating in the cycle, in cycle order.
        participants: Vec<String>,
    },

    /// A reference or `depends_on` entry names a resource that does not exist.
    #[error("Resource '{resource}' references unknown resource '{target}'")]
    UnknownReference {
        /// Resource holding the reference.
        resource: String,
        /// The missing target.
        target: String,
    },

    /// Two resources share the same logical identifier.
    #[error("Duplicate resource id: {id}")]
    DuplicateId {
        /// The duplicated identifier.
        id: String,
    },

    /// A resource uses a type with no registered adapter.
    #[error("Resource '{resource}' has unknown type '{resource_type}'")]
    UnknownType {
        /// Logical identifier of the resource.
        resource: String,
        /// The unregistered type tag.
        resource_type: String,
    },

    /// One or more resources failed adapter validation.
    #[error("{} resource(s) failed validation: {}", errors.len(), join_validation(errors))]
    Validation {
        /// Every validation failure found.
        errors: Vec<ValidationError>,
    },
}

/// Classification of an adapter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    /// Retryable failure (rate limiting, network, timeout, 5xx).
    Transient,
    /// Non-retryable failure (validation, conflict).
    Permanent,
    /// The remote object does not exist.
    NotFound,
}

/// An error reported by a resource adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterError {
    /// Logical identifier of the resource, once known.
    pub resource: Option<String>,
    /// Failure classification.
    pub kind: AdapterErrorKind,
    /// Provider message.
    pub message: String,
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Local filesystem backend error.
    #[error("State file error: {message}")]
    FileError {
        /// Description of the file error.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Result type alias for Keel operations.
pub type Result<T> = std::result::Result<T, KeelError>;

fn join_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl KeelError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true for errors raised before any resource was touched.
    ///
    /// The CLI maps these to exit code 2.
    #[must_use]
    pub const fn is_planning_error(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Graph(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Adapter(e) => e.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl ValidationError {
    /// Creates a validation error for a resource.
    #[must_use]
    pub fn new(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

impl AdapterError {
    /// Creates a transient (retryable) error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            resource: None,
            kind: AdapterErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            resource: None,
            kind: AdapterErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            resource: None,
            kind: AdapterErrorKind::NotFound,
            message: message.into(),
        }
    }

    /// Attaches the logical resource identifier.
    #[must_use]
    pub fn for_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Returns true if the failure may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind, AdapterErrorKind::Transient)
    }

    /// Returns true if the remote object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, AdapterErrorKind::NotFound)
    }
}

impl fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::NotFound => "not found",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(resource) => write!(f, "{resource}: {} ({})", self.message, self.kind),
            None => write!(f, "{} ({})", self.message, self.kind),
        }
    }
}

impl std::error::Error for AdapterError {}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local file error with the given message.
    #[must_use]
    pub fn file(message: impl Into<String>) -> Self {
        Self::FileError {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_participants() {
        let err = GraphError::Cycle {
            participants: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_adapter_error_classification() {
        let err = AdapterError::transient("rate limited").for_resource("web1");
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "web1: rate limited (transient)");
        assert!(!AdapterError::permanent("conflict").is_transient());
        assert!(AdapterError::not_found("gone").is_not_found());
    }

    #[test]
    fn test_planning_errors() {
        let err = KeelError::from(GraphError::DuplicateId { id: "vpc".into() });
        assert!(err.is_planning_error());
        let err = KeelError::from(AdapterError::permanent("nope"));
        assert!(!err.is_planning_error());
    }
}
