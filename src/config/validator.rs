//! Structural validation for deployment files.
//!
//! Checks identity, state backend, executor settings and the shape of the
//! resource list before any graph is built. Type-specific checks belong to
//! the adapters.

use crate::error::{ConfigError, KeelError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    DeploymentConfig, DeploymentFile, ExecutionConfig, ResourceConfig, StateBackend, StateConfig,
};
use crate::model::is_id_char;

/// Upper bound for `execution.max_attempts`.
const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Upper bound for `execution.parallelism`.
const MAX_PARALLELISM: usize = 64;

/// Validator for deployment files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all problems found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Validation errors.
    pub errors: Vec<FieldError>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

/// A single field-level validation error.
#[derive(Debug)]
pub struct FieldError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a deployment file.
    ///
    /// # Errors
    ///
    /// Returns the first error found; warnings are returned on success.
    pub fn validate(&self, file: &DeploymentFile) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_deployment(&file.deployment, &mut result);
        Self::validate_state(&file.state, &mut result);
        Self::validate_execution(&file.execution, file.resources.len(), &mut result);
        Self::validate_resources(&file.resources, &mut result);
        Self::validate_outputs(file, &mut result);

        if result.errors.is_empty() {
            debug!("Deployment file validation passed");
            Ok(result)
        } else {
            let first = &result.errors[0];
            Err(KeelError::Config(ConfigError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            }))
        }
    }

    fn validate_deployment(deployment: &DeploymentConfig, result: &mut ValidationResult) {
        if deployment.name.is_empty() {
            result.push_error("deployment.name", "Deployment name cannot be empty");
        } else if !is_valid_name(&deployment.name) {
            result.push_error(
                "deployment.name",
                format!(
                    "Deployment name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    deployment.name
                ),
            );
        }

        if deployment.environment.is_empty() {
            result.push_error("deployment.environment", "Environment cannot be empty");
        } else if !is_valid_name(&deployment.environment) {
            result.push_error(
                "deployment.environment",
                format!("Environment '{}' is invalid", deployment.environment),
            );
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.push_error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    fn validate_execution(
        execution: &ExecutionConfig,
        resource_count: usize,
        result: &mut ValidationResult,
    ) {
        if execution.max_attempts == 0 || execution.max_attempts > MAX_ATTEMPTS_LIMIT {
            result.push_error(
                "execution.max_attempts",
                format!("max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}"),
            );
        }

        if execution.base_backoff_ms > execution.max_backoff_ms {
            result.push_error(
                "execution.base_backoff_ms",
                "base_backoff_ms cannot exceed max_backoff_ms",
            );
        }

        if execution.action_timeout_secs == 0 {
            result.push_error(
                "execution.action_timeout_secs",
                "action_timeout_secs must be at least 1",
            );
        }

        if execution.parallelism == 0 || execution.parallelism > MAX_PARALLELISM {
            result.push_error(
                "execution.parallelism",
                format!("parallelism must be between 1 and {MAX_PARALLELISM}"),
            );
        } else if resource_count > 0 && execution.parallelism > resource_count {
            result.warnings.push(format!(
                "execution.parallelism ({}) exceeds the number of resources ({resource_count})",
                execution.parallelism
            ));
        }
    }

    fn validate_resources(resources: &[ResourceConfig], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in deployment file"));
            return;
        }

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if resource.id.is_empty() || !resource.id.chars().all(is_id_char) {
                result.push_error(
                    format!("{prefix}.id"),
                    format!(
                        "Resource id '{}' is invalid. Must be lowercase alphanumeric with '-' or '_'.",
                        resource.id
                    ),
                );
            }

            if resource.resource_type.is_empty() {
                result.push_error(
                    format!("{prefix}.type"),
                    format!("Resource '{}' has no type", resource.id),
                );
            }

            let mut seen = HashSet::new();
            for (j, dep) in resource.depends_on.iter().enumerate() {
                if dep == &resource.id {
                    result.push_error(
                        format!("{prefix}.depends_on[{j}]"),
                        format!("Resource '{}' cannot depend on itself", resource.id),
                    );
                } else if !seen.insert(dep) {
                    result.warnings.push(format!(
                        "{prefix}.depends_on[{j}]: duplicate dependency '{dep}'"
                    ));
                }
            }
        }
    }

    fn validate_outputs(file: &DeploymentFile, result: &mut ValidationResult) {
        for name in file.outputs.keys() {
            if name.is_empty() || !name.chars().all(|c| is_id_char(c) || c.is_ascii_uppercase()) {
                result.push_error(format!("outputs.{name}"), format!("Output name '{name}' is invalid"));
            }
        }
    }
}

/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    fn push_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
