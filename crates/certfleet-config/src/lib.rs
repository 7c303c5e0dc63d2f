//! Fleet configuration
//!
//! Typed view of the JSON descriptor that drives certfleet: global settings,
//! certbot invocation settings, optional GELF log forwarding and the list of
//! target hosts. The file is parsed and validated once at startup.

pub mod error;
pub mod model;

pub use error::ConfigError;
pub use model::{CertbotConfig, Config, GelfConfig, HostConfig, SystemConfig};

use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Default configuration file name, resolved against the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

impl Config {
    /// Load and validate the configuration file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading configuration from {:?}", path);

        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_json(&json).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: Some(path.to_path_buf()),
                source,
            },
            other => other,
        })?;

        info!(
            "Loaded configuration from {:?} ({} host(s))",
            path,
            config.hosts.len()
        );

        Ok(config)
    }

    /// Parse and validate a configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_json::from_str(json).map_err(|source| ConfigError::Parse { path: None, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.system.validate()?;
        self.certbot.validate()?;

        if let Some(gelf) = &self.gelf {
            gelf.validate()?;
        }

        if self.hosts.is_empty() {
            return Err(ConfigError::invalid("hosts", "at least one host is required"));
        }

        let mut seen = std::collections::HashSet::new();
        for (index, host) in self.hosts.iter().enumerate() {
            host.validate(index)?;
            if !seen.insert(host.hostname.as_str()) {
                return Err(ConfigError::invalid(
                    format!("hosts[{}].hostname", index),
                    format!("duplicate hostname '{}'", host.hostname),
                ));
            }
        }

        Ok(())
    }
}
