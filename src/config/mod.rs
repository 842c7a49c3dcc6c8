//! Configuration module for the Keel deployment engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `*.deploy.yaml` files
//! - Environment and user-level overrides
//! - Structural validation before the graph is built

mod parser;
mod spec;
mod validator;

pub use parser::{
    ConfigParser, DEFAULT_CONFIG_FILES, PROVIDER_ENDPOINT_VAR, PROVIDER_TOKEN_VAR,
    find_config_file, user_provider_file,
};
pub use spec::{
    DeploymentConfig, DeploymentFile, ExecutionConfig, OutputConfig, ProviderConfig,
    ResourceConfig, RollbackPolicy, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, FieldError, ValidationResult};
