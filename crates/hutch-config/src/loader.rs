//! Configuration loader with layered sources.

use crate::error::ConfigResult;
use crate::{ConfigValidator, HutchConfig};
use config::{Config, Environment, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable selecting the environment-specific config file.
pub const ENVIRONMENT_VAR: &str = "HUTCH_ENVIRONMENT";

/// Configuration loader.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a loader reading from `config_dir`.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `{config_dir}/default.toml` - Default values
    /// 2. `{config_dir}/{environment}.toml` - Environment-specific overrides
    /// 3. `{config_dir}/local.toml` - Local overrides
    /// 4. Environment variables with `HUTCH_` prefix and `__` separator
    ///    (e.g. `HUTCH_BROKER__COMPONENT=mailer`)
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Creates a loader reading from `./config`.
    #[must_use]
    pub fn from_default_location() -> Self {
        Self::new("./config")
    }

    /// Loads and validates the configuration.
    pub fn load(&self) -> ConfigResult<HutchConfig> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment = std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string());
        info!(environment = %environment, dir = %self.config_dir.display(), "Loading configuration");

        let mut builder = Config::builder();
        for name in ["default", environment.as_str(), "local"] {
            let path = self.config_dir.join(format!("{name}.toml"));
            if Path::new(&path).exists() {
                debug!(path = %path.display(), "Adding configuration file");
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("HUTCH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: HutchConfig = builder.build()?.try_deserialize()?;
        ConfigValidator::validate(&config)?;

        Ok(config)
    }
}
