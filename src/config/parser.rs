//! Deployment file parser.
//!
//! Loads a deployment file from YAML, applies environment overrides and fills
//! in provider defaults from the user configuration directory.

use crate::error::{ConfigError, KeelError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{DeploymentFile, ProviderConfig};

/// Environment variable holding the provider API token.
pub const PROVIDER_TOKEN_VAR: &str = "KEEL_PROVIDER_TOKEN";

/// Environment variable overriding the provider endpoint.
pub const PROVIDER_ENDPOINT_VAR: &str = "KEEL_PROVIDER_ENDPOINT";

/// Parser for deployment files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Directory holding the deployment file, used to locate `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory used to locate `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a deployment file from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeploymentFile> {
        let path = path.as_ref();
        info!("Loading deployment file: {}", path.display());

        if !path.exists() {
            return Err(KeelError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            KeelError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a deployment file from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeploymentFile> {
        debug!("Parsing deployment YAML");

        let file: DeploymentFile = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            KeelError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed deployment '{}' with {} resource(s)",
            file.deployment.name,
            file.resources.len()
        );
        Ok(file)
    }

    /// Loads a deployment file, then applies `.env`, environment overrides and
    /// user-level provider defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or `.env` cannot be loaded.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeploymentFile> {
        self.load_dotenv()?;
        let mut file = self.load_file(path)?;

        Self::apply_env_overrides(&mut file);

        if file.provider.endpoint.is_none() {
            if let Some(defaults) = Self::load_user_provider_defaults()? {
                Self::merge_provider_defaults(&mut file.provider, defaults);
            }
        }

        Ok(file)
    }

    /// Applies `KEEL_*` environment variable overrides.
    fn apply_env_overrides(file: &mut DeploymentFile) {
        if let Ok(endpoint) = std::env::var(PROVIDER_ENDPOINT_VAR) {
            debug!("Overriding provider.endpoint from environment");
            file.provider.endpoint = Some(endpoint);
        }

        if let Ok(region) = std::env::var("KEEL_PROVIDER_REGION") {
            debug!("Overriding provider.region from environment");
            file.provider.region = Some(region);
        }

        if let Ok(env) = std::env::var("KEEL_ENVIRONMENT") {
            debug!("Overriding deployment.environment from environment");
            file.deployment.environment = env;
        }

        if let Ok(bucket) = std::env::var("KEEL_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            file.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("KEEL_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            file.state.prefix = Some(prefix);
        }
    }

    /// Fills unset provider fields from user-level defaults.
    fn merge_provider_defaults(provider: &mut ProviderConfig, defaults: ProviderConfig) {
        if provider.endpoint.is_none() {
            provider.endpoint = defaults.endpoint;
        }
        if provider.region.is_none() {
            provider.region = defaults.region;
        }
    }

    /// Reads `keel/provider.yaml` from the user configuration directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is not valid YAML.
    pub fn load_user_provider_defaults() -> Result<Option<ProviderConfig>> {
        let Some(path) = user_provider_file() else {
            return Ok(None);
        };

        if !path.exists() {
            debug!("No user provider defaults at: {}", path.display());
            return Ok(None);
        }

        info!("Loading provider defaults from: {}", path.display());
        let content = std::fs::read_to_string(&path)?;
        let defaults = serde_yaml::from_str(&content).map_err(|e| {
            KeelError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        Ok(Some(defaults))
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                KeelError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provider token from the environment, if set.
    ///
    /// The token is never logged or persisted.
    #[must_use]
    pub fn provider_token() -> Option<String> {
        std::env::var(PROVIDER_TOKEN_VAR).ok().filter(|t| !t.is_empty())
    }
}

/// Location of the user-level provider defaults file.
#[must_use]
pub fn user_provider_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("keel").join("provider.yaml"))
}

/// Default deployment file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "keel.deploy.yaml",
    "keel.deploy.yml",
    "deploy.yaml",
    "deploy.yml",
];

/// Finds a deployment file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no deployment file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let candidate = current.join(filename);
            if candidate.exists() {
                info!("Found deployment file: {}", candidate.display());
                return Ok(candidate);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(KeelError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::StateBackend;

    #[test]
    fn test_parse_minimal_file() {
        let yaml = r"
deployment:
  name: corpweb
";
        let parser = ConfigParser::new();
        let file = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(file.deployment.name, "corpweb");
        assert_eq!(file.deployment.environment, "dev");
        assert!(file.resources.is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let yaml = r#"
deployment:
  name: corpweb
  environment: prod
provider:
  endpoint: https://provider.internal
  region: eu-west-1
state:
  backend: s3
  bucket: keel-state
  prefix: corpweb
execution:
  max_attempts: 5
  parallelism: 4
resources:
  - id: vpc
    type: network
    attributes:
      cidr: 10.0.0.0/18
  - id: web_sg
    type: security_group
    attributes:
      network: "${vpc.id}"
      ingress:
        - { port: 22, source: 0.0.0.0/0 }
outputs:
  vpc_id:
    value: "${vpc.id}"
    description: The network
"#;
        let parser = ConfigParser::new();
        let file = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(file.deployment.identity(), "corpweb-prod");
        assert_eq!(file.state.backend, StateBackend::S3);
        assert_eq!(file.execution.max_attempts, 5);
        assert_eq!(file.resources.len(), 2);
        assert_eq!(file.resources[1].resource_type, "security_group");
        assert_eq!(file.outputs["vpc_id"].description.as_deref(), Some("The network"));
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let parser = ConfigParser::new();
        let err = parser.parse_yaml("deployment: [", None).unwrap_err();
        assert!(matches!(err, KeelError::Config(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_missing_file() {
        let parser = ConfigParser::new();
        let err = parser.load_file("/nonexistent/keel.deploy.yaml").unwrap_err();
        assert!(matches!(err, KeelError::Config(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("keel.deploy.yaml"), "deployment: {name: x}").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("keel.deploy.yaml"));
    }

    #[test]
    fn test_merge_provider_defaults_keeps_file_values() {
        let mut provider = ProviderConfig {
            region: Some("eu-west-1".into()),
            ..ProviderConfig::default()
        };
        let defaults = ProviderConfig {
            endpoint: Some("https://defaults".into()),
            region: Some("us-east-1".into()),
            ..ProviderConfig::default()
        };
        ConfigParser::merge_provider_defaults(&mut provider, defaults);
        assert_eq!(provider.endpoint.as_deref(), Some("https://defaults"));
        assert_eq!(provider.region.as_deref(), Some("eu-west-1"));
    }
}
