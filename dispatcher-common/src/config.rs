//! Startup configuration loading.
//!
//! Mirrors the `master_daq_config` block and per-command timeout table from
//! `spec.md` §6. Loaded once at process start via [`ConfigLoader::load`];
//! never re-read mid-run.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ControlKey, MasterDaqConfig, RunModeRegistry};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Trait for loading configuration from TOML files.
///
/// Provides a default implementation for any `serde::de::DeserializeOwned`
/// type; callers typically follow `load` with a `validate()` pass.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

fn default_poll_frequency_s() -> u64 {
    5
}
fn default_client_timeout_s() -> u64 {
    10
}
fn default_timeout_take_action_s() -> u64 {
    60
}
fn default_stop_retries() -> u32 {
    3
}
fn default_max_arm_cycles() -> u32 {
    3
}
fn default_start_cmd_delay_s() -> f64 {
    1.5
}
fn default_stop_cmd_delay_s() -> f64 {
    5.0
}
fn default_cc_start_wait_s() -> f64 {
    2.0
}
fn default_control_keys() -> Vec<ControlKey> {
    ControlKey::REQUIRED.to_vec()
}

/// Per-command cooldown/ack timeouts (`spec.md` §6, "timeout[arm|start|stop]").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandTimeouts {
    pub arm: u64,
    pub start: u64,
    pub stop: u64,
}

/// Top-level dispatcher configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    pub timeout: CommandTimeouts,
    pub time_between_commands: u64,

    #[serde(default = "default_client_timeout_s")]
    pub client_timeout: u64,
    #[serde(default = "default_timeout_take_action_s")]
    pub timeout_take_action: u64,
    #[serde(default = "default_stop_retries")]
    pub stop_retries: u32,
    #[serde(default = "default_max_arm_cycles")]
    pub max_arm_cycles: u32,
    #[serde(default = "default_start_cmd_delay_s")]
    pub start_cmd_delay: f64,
    #[serde(default = "default_stop_cmd_delay_s")]
    pub stop_cmd_delay: f64,
    #[serde(default = "default_poll_frequency_s")]
    pub poll_frequency: u64,
    #[serde(default = "default_cc_start_wait_s")]
    pub cc_start_wait: f64,
    #[serde(default = "default_control_keys")]
    pub control_keys: Vec<ControlKey>,

    pub master_daq_config: MasterDaqConfig,

    /// Known run-mode board lists, used to restrict status aggregation to
    /// a mode's declared readers (§4.A step 4) and to refuse `arm` against
    /// an undefined mode (§7). Empty by default: a deployment that never
    /// populates this performs no mode validation at all.
    #[serde(default)]
    pub modes: RunModeRegistry,

    /// Path to the sled database directory used by [`dispatcher_store::SledStore`].
    pub store_path: std::path::PathBuf,
}

impl DispatcherConfig {
    /// Validate cross-field invariants that serde's per-field defaults
    /// cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if:
    /// - `master_daq_config` is empty
    /// - any detector's `controller` list has more than one entry (§3:
    ///   "at most one crate-controller process")
    /// - `control_keys` does not cover every key the goal resolver requires
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.master_daq_config.is_empty() {
            return Err(ConfigError::ValidationError(
                "master_daq_config must declare at least one detector".to_string(),
            ));
        }
        for (detector, nodes) in &self.master_daq_config {
            if nodes.controller.len() > 1 {
                return Err(ConfigError::ValidationError(format!(
                    "detector {detector} declares {} crate controllers, at most one is allowed",
                    nodes.controller.len()
                )));
            }
        }
        for key in ControlKey::REQUIRED {
            if !self.control_keys.contains(&key) {
                return Err(ConfigError::ValidationError(format!(
                    "control_keys is missing required key {key}"
                )));
            }
        }
        Ok(())
    }
}
