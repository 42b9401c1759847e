//! Configuration Loader
//!
//! Environment-aware loading on top of the `config` crate. Sources are layered
//! lowest to highest precedence:
//!
//! 1. built-in defaults (`WorkflowConfig::default()`)
//! 2. `<dir>/procflow.{toml,yaml,json,...}`
//! 3. `<dir>/procflow.<environment>.{toml,...}`
//! 4. `PROCFLOW__<SECTION>__<KEY>` environment variables

use config::{Config, Environment, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::WorkflowConfig;

/// Environment variable naming the deployment environment
pub const ENVIRONMENT_VAR: &str = "PROCFLOW_ENV";
const ENV_PREFIX: &str = "PROCFLOW";
const ENV_SEPARATOR: &str = "__";
const CONFIG_BASENAME: &str = "procflow";

#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: WorkflowConfig,
    environment: String,
    config_directory: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration from `./config` with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a directory with an explicit environment name,
    /// useful in tests that must not touch process-wide variables
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));
        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading procflow configuration"
        );

        let base = config_directory.join(CONFIG_BASENAME);
        let env_specific = config_directory.join(format!("{CONFIG_BASENAME}.{environment}"));
        let builder = Config::builder()
            .add_source(File::with_name(&path_str(&base)?).required(false))
            .add_source(File::with_name(&path_str(&env_specific)?).required(false));

        let config = Self::finish(builder)?;
        Ok(Arc::new(Self::log_loaded(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Some(config_directory),
        })))
    }

    /// Load a single, required configuration file (format from its extension)
    pub fn load_from_path(path: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigurationError::file_read_error(
                path.display().to_string(),
                "file does not exist or is not a regular file",
            ));
        }

        let builder = Config::builder().add_source(File::from(path).required(true));
        let config = Self::finish(builder)?;
        Ok(Arc::new(Self::log_loaded(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_directory: path.parent().map(Path::to_path_buf),
        })))
    }

    /// Wrap an already-built configuration after validating it
    pub fn from_config(config: WorkflowConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_directory: None,
        }))
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> Option<&Path> {
        self.config_directory.as_deref()
    }

    pub fn detect_environment() -> String {
        std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string())
    }

    fn finish(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> ConfigResult<WorkflowConfig> {
        let config: WorkflowConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn log_loaded(manager: ConfigManager) -> ConfigManager {
        info!(
            environment = %manager.environment,
            lock_timeout_ms = manager.config.engine.lock_timeout_ms,
            sweep_interval_seconds = manager.config.scheduler.sweep_interval_seconds,
            "Configuration loaded successfully"
        );
        manager
    }
}

fn path_str(path: &Path) -> ConfigResult<String> {
    path.to_str().map(str::to_string).ok_or_else(|| {
        ConfigurationError::invalid_value(
            "config_directory",
            path.display().to_string(),
            "path is not valid UTF-8",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_directory_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();
        assert_eq!(manager.config().engine, super::super::EngineConfig::default());
        assert_eq!(manager.environment(), "test");
    }

    #[test]
    fn test_environment_file_overrides_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("procflow.toml"),
            "[scheduler]\nsweep_interval_seconds = 30\nsweep_batch_size = 10\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("procflow.staging.toml"),
            "[scheduler]\nsweep_interval_seconds = 5\n",
        )
        .unwrap();

        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "staging")
                .unwrap();
        assert_eq!(manager.config().scheduler.sweep_interval_seconds, 5);
        assert_eq!(manager.config().scheduler.sweep_batch_size, 10);
    }

    #[test]
    fn test_load_from_missing_path_fails() {
        let err = ConfigManager::load_from_path("/nonexistent/procflow.toml").unwrap_err();
        assert!(matches!(err, ConfigurationError::FileRead { .. }));
    }
}
