// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with controller configuration

use crate::backend::Endpoint;
use crate::backend::InventoryPath;
use dropshot::ConfigLogging;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationMilliSeconds;
use serde_with::DurationSeconds;
use slog::Logger;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

/// How to reach the virtualization backend
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BackendConfig {
    pub endpoint: Endpoint,
    pub inventory: InventoryPath,
    /// upper bound on any single backend call
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "BackendConfig::default_call_timeout")]
    pub call_timeout: Duration,
    /// upper bound on waiting for one asynchronous backend task
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "BackendConfig::default_task_deadline")]
    pub task_deadline: Duration,
}

impl BackendConfig {
    fn default_call_timeout() -> Duration {
        Duration::from_secs(30)
    }

    fn default_task_deadline() -> Duration {
        Duration::from_secs(30 * 60)
    }
}

/// Tuning for the reconciliation work queue
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ControllerConfig {
    /// number of passes that may run at once
    pub workers: usize,
    /// delay before revisiting a machine whose volumes are still attaching
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub requeue_interval: Duration,
    /// abandon a pass that runs longer than this
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub pass_deadline: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            workers: 8,
            requeue_interval: Duration::from_secs(10),
            pass_deadline: None,
        }
    }
}

/// Configuration for the convergence controller
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Configuration for controller logging
    pub log: ConfigLogging,
    pub backend: BackendConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Failed to set up logging: {0}")]
    Logging(#[source] std::io::Error),
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }

    /// Build the root logger described by this configuration
    pub fn root_logger(&self) -> Result<Logger, ConfigError> {
        self.log.to_logger("vmop-controller").map_err(ConfigError::Logging)
    }
}
