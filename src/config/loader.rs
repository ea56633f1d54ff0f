//! Configuration Loader
//!
//! Environment-aware loading: `coordination.toml` in the config directory, then
//! an optional `{env}.toml` overlay, then `COORD__SECTION__FIELD` environment
//! overrides. The merged result is deserialized into [`CoordinationConfig`]
//! and validated before it is handed out.

use config::{Config, Environment, File};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::CoordinationConfig;
use crate::error::Result;

/// Base file name inside the config directory
const BASE_CONFIG_FILE: &str = "coordination.toml";

/// Prefix for environment overrides (`COORD__PUBSUB__MAX_PAYLOAD_SIZE=4000`)
const ENV_PREFIX: &str = "COORD";
const ENV_SEPARATOR: &str = "__";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: CoordinationConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> Result<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> Result<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment,
    /// reading overrides from the process environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> Result<Arc<ConfigManager>> {
        Self::build(config_dir, environment, None)
    }

    /// Like [`Self::load_from_directory_with_env`] but takes overrides from
    /// `overrides` instead of the process environment. Keys use the same
    /// `COORD__SECTION__FIELD` form.
    pub fn load_with_overrides(
        config_dir: Option<PathBuf>,
        environment: &str,
        overrides: HashMap<String, String>,
    ) -> Result<Arc<ConfigManager>> {
        Self::build(config_dir, environment, Some(overrides))
    }

    fn build(
        config_dir: Option<PathBuf>,
        environment: &str,
        overrides: Option<HashMap<String, String>>,
    ) -> Result<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let config = Self::load_and_merge_config(&config_directory, environment, overrides)?;
        config.validate()?;

        debug!(
            config = %serde_json::to_string(&Self::sanitize_config_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string()),
            "Configuration merged"
        );
        info!(
            environment = environment,
            database = %config.database.redacted_url(),
            channels_prefix = ?config.pubsub.channels_prefix,
            "⚙️ Coordination configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
        overrides: Option<HashMap<String, String>>,
    ) -> Result<CoordinationConfig> {
        let base = config_directory.join(BASE_CONFIG_FILE);
        let overlay = config_directory.join(format!("{environment}.toml"));

        for path in [&base, &overlay] {
            if path.is_file() {
                debug!("Using configuration file: {}", path.display());
            }
        }

        let mut env_source = Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true);
        if let Some(overrides) = overrides {
            env_source = env_source.source(Some(overrides.into_iter().collect()));
        }

        let merged = Config::builder()
            .add_source(File::from(base).required(false))
            .add_source(File::from(overlay).required(false))
            .add_source(env_source)
            .build()?;

        Ok(merged.try_deserialize::<CoordinationConfig>()?)
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Configuration as JSON with credentials masked, safe to log
    pub fn debug_config(&self) -> serde_json::Value {
        Self::sanitize_config_for_logging(&self.config)
    }

    /// Detect environment from `COORD_ENV`, then `APP_ENV`, defaulting to development
    pub fn detect_environment() -> String {
        env::var("COORD_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn sanitize_config_for_logging(config: &CoordinationConfig) -> serde_json::Value {
        let mut value = serde_json::to_value(config).unwrap_or(serde_json::Value::Null);
        if let Some(database) = value.get_mut("database").and_then(|db| db.as_object_mut()) {
            database.insert(
                "url".to_string(),
                serde_json::Value::String(config.database.redacted_url()),
            );
        }
        value
    }
}
