//! # Agent Configuration
//!
//! ## Why This Module Exists
//! All tunables the agent consumes at startup live in one serde-backed struct
//! that can be loaded from a TOML file or assembled in code. Missing fields
//! gracefully degrade to defaults so a device with a sparse configuration
//! file still boots; only values that are actively dangerous (an out-of-range
//! timezone) are rejected.
//!
//! The agent consumes this surface but does not own it: the embedding
//! application decides where the file lives and when to load it.

use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Default broker endpoint used when the configuration carries no override.
pub const DEFAULT_BROKER_HOST: &str = "mq.firmlink.cloud";
pub const DEFAULT_BROKER_PORT: u16 = 8883;

/// Everything the agent needs to know at `begin()` time.
///
/// Credential material (PEM text) is deliberately not part of this struct;
/// it is supplied separately as a [`crate::credentials::CredentialSet`] so
/// secrets never transit the TOML layer.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct AgentConfig {
    /// Stable device identifier issued at provisioning time
    pub device_id: String,
    /// Opaque device secret paired with the id
    pub device_key: String,
    /// Broker host override
    #[serde(default = "default_host")]
    pub broker_host: String,
    /// Broker port override
    #[serde(default = "default_port")]
    pub broker_port: u16,
    /// Timezone offset in whole hours, accepted range [-12, 12]
    #[serde(default)]
    pub timezone_offset_hours: i8,
    /// Daylight-saving offset in seconds
    #[serde(default)]
    pub daylight_offset_secs: i32,
    /// NTP host override
    #[serde(default = "default_ntp")]
    pub ntp_host: String,
    /// Gates per-message dispatch logging
    #[serde(default)]
    pub verbose: bool,
    /// Publish an `on_ok` acknowledgement for every inbound event that
    /// carries a message id
    #[serde(default = "default_true")]
    pub auto_ack: bool,
}

fn default_host() -> String {
    DEFAULT_BROKER_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_BROKER_PORT
}

fn default_ntp() -> String {
    "pool.ntp.org".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            device_key: String::new(),
            broker_host: default_host(),
            broker_port: default_port(),
            timezone_offset_hours: 0,
            daylight_offset_secs: 0,
            ntp_host: default_ntp(),
            verbose: false,
            auto_ack: true,
        }
    }
}

impl AgentConfig {
    pub fn new(device_id: impl Into<String>, device_key: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_key: device_key.into(),
            ..Self::default()
        }
    }

    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| AgentError::ConfigInvalid(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| AgentError::ConfigInvalid(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        info!("Loaded agent configuration from {}", path.display());
        Ok(config)
    }

    /// Checks range constraints. Called by [`Self::load`] and by the agent
    /// before `begin()`.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.device_id.is_empty() {
            return Err(AgentError::ConfigInvalid("device_id is empty".into()));
        }
        if !(-12..=12).contains(&self.timezone_offset_hours) {
            return Err(AgentError::ConfigInvalid(format!(
                "timezone offset {} outside [-12, 12]",
                self.timezone_offset_hours
            )));
        }
        Ok(())
    }

    /// Timezone offset converted to seconds for the time-sync probe.
    pub fn gmt_offset_secs(&self) -> i32 {
        i32::from(self.timezone_offset_hours) * 3600
    }
}
