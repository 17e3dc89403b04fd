//! Configuration for the flowrelay CLI
//!
//! Every section falls back to its defaults, so a TOML file only needs the
//! values it changes. Command line options are applied on top by the command
//! handlers.

use std::path::Path;

use flowrelay_core::{DrainConfig, EngineConfig, RelayConfig, SpoutConfig};
use flowrelay_runtime::DriverConfig;
use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};

/// Listening address for the `serve` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
        }
    }
}

/// Complete CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub serve: ServeConfig,
    pub relay: RelayConfig,
    pub engine: EngineConfig,
    pub driver: DriverConfig,
    pub drain: DrainConfig,
    pub spout: SpoutConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file over the defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section against the others
    pub fn validate(&self) -> Result<()> {
        self.relay.validate()?;
        self.engine.validate()?;
        self.driver.validate(self.engine.max_frame_payload)?;
        if self.serve.host.is_empty() {
            return Err(CliError::Config("serve.host must not be empty".to_string()));
        }
        Ok(())
    }

    /// Default configuration rendered as TOML
    pub fn example_config() -> Result<String> {
        toml::to_string_pretty(&Self::default()).map_err(|e| CliError::Config(e.to_string()))
    }
}
