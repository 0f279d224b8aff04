use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dimse::{DimseConfig, DimseError, RemoteNode};
use serde::Deserialize;
use thiserror::Error;

use crate::config::LoggingConfig;
use crate::storage::StorageConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid [node] section: {0}")]
    InvalidNode(#[source] DimseError),

    #[error("Invalid remote '{name}': {source}")]
    InvalidRemote {
        name: String,
        #[source]
        source: DimseError,
    },

    #[error("Unknown remote '{0}'")]
    UnknownRemote(String),

    #[error("logging.log_file_path is required when log_to_file is enabled")]
    MissingLogFilePath,

    #[error("storage.path cannot be empty")]
    MissingStoragePath,
}

/// Node configuration loaded from TOML
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: DimseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub remotes: HashMap<String, RemoteNode>,
}

impl Config {
    /// Read, parse and validate a config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.node.validate().map_err(ConfigError::InvalidNode)?;

        for (name, remote) in &self.remotes {
            remote.validate().map_err(|source| ConfigError::InvalidRemote {
                name: name.clone(),
                source,
            })?;
        }

        if self.logging.log_to_file && self.logging.log_file_path.trim().is_empty() {
            return Err(ConfigError::MissingLogFilePath);
        }

        if self.storage.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingStoragePath);
        }

        Ok(())
    }

    /// Look up a `[remotes.<name>]` entry
    pub fn remote(&self, name: &str) -> Result<&RemoteNode, ConfigError> {
        self.remotes
            .get(name)
            .ok_or_else(|| ConfigError::UnknownRemote(name.to_string()))
    }
}
