//! Configuration Loader
//!
//! Layers compiled-in defaults, an optional TOML file and environment
//! overrides into a validated [`ConductorConfig`] snapshot.

use super::error::{ConfigResult, ConfigurationError};
use super::ConductorConfig;
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const CONFIG_PATH_ENV: &str = "CONDUCTOR_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "config/conductor.toml";
const ENV_PREFIX: &str = "CONDUCTOR";

/// Owns a loaded configuration snapshot and where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: ConductorConfig,
    source_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration from `CONDUCTOR_CONFIG_PATH` or the default location
    ///
    /// A missing default file is not an error; the defaults apply. A path set
    /// explicitly through the environment must exist.
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        match env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_path(Path::new(&path)),
            Err(_) => Self::load_optional(Path::new(DEFAULT_CONFIG_PATH)),
        }
    }

    /// Load configuration from an explicit TOML file
    pub fn load_from_path(path: &Path) -> ConfigResult<Arc<ConfigManager>> {
        if !path.exists() {
            return Err(ConfigurationError::ConfigFileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::build(Some(path))
    }

    /// Defaults plus environment overrides only
    pub fn from_defaults() -> ConfigResult<Arc<ConfigManager>> {
        Self::build(None)
    }

    fn load_optional(path: &Path) -> ConfigResult<Arc<ConfigManager>> {
        if path.exists() {
            Self::build(Some(path))
        } else {
            debug!(path = %path.display(), "No configuration file found, using defaults");
            Self::build(None)
        }
    }

    fn build(path: Option<&Path>) -> ConfigResult<Arc<ConfigManager>> {
        let mut builder = Config::builder().add_source(Config::try_from(&ConductorConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: ConductorConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        info!(
            source = %path.map(|p| p.display().to_string()).unwrap_or_else(|| "defaults".to_string()),
            bind_address = %config.server.bind_address,
            conductor_id = %config.server.conductor_id,
            "⚙️ Configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            source_path: path.map(Path::to_path_buf),
        }))
    }

    /// Wrap an already-built configuration (tests, embedding)
    pub fn from_config(config: ConductorConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            source_path: None,
        }))
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }
}
