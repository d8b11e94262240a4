// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tunables of the tap subsystem.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to deserialize configuration: {0}")]
    Parse(#[from] serde_yaml_ng::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Limits and defaults applied by a [`TapSubsystem`](crate::TapSubsystem).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TapConfig {
    /// Number of device slots created up front.
    pub initial_devices: u32,
    /// Number of slots added when the last slot gets opened.
    pub device_increment: u32,
    /// Upper bound on the number of device slots.
    pub max_devices: u32,
    /// Size of each capture buffer of a newly opened device.
    pub default_buffer_size: u32,
    pub min_buffer_size: u32,
    pub max_buffer_size: u32,
    /// Largest filter program accepted.
    pub max_filter_instructions: usize,
    /// Bytes allowed on top of the interface MTU for writes, to account for the link header.
    pub write_leeway: u32,
    /// Longest prefix shared between consecutive compressed records.
    pub max_compression_prefix: u16,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            initial_devices: 4,
            device_increment: 8,
            max_devices: 256,
            default_buffer_size: 4096,
            min_buffer_size: 32,
            max_buffer_size: 512 * 1024,
            max_filter_instructions: filter::MAX_INSTRUCTIONS,
            write_leeway: 18,
            max_compression_prefix: 256,
        }
    }
}

impl TapConfig {
    /// Check the consistency of the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));
        if self.initial_devices == 0 || self.initial_devices > self.max_devices {
            return invalid("initial_devices must be in 1..=max_devices");
        }
        if self.device_increment == 0 {
            return invalid("device_increment must be positive");
        }
        if self.min_buffer_size == 0 || self.min_buffer_size > self.max_buffer_size {
            return invalid("min_buffer_size must be in 1..=max_buffer_size");
        }
        if !(self.min_buffer_size..=self.max_buffer_size).contains(&self.default_buffer_size) {
            return invalid("default_buffer_size must be in min_buffer_size..=max_buffer_size");
        }
        if self.max_filter_instructions == 0 {
            return invalid("max_filter_instructions must be positive");
        }
        Ok(())
    }

    /// Clamp a requested buffer size to the configured bounds.
    #[must_use]
    pub fn clamp_buffer_size(&self, size: u32) -> u32 {
        size.clamp(self.min_buffer_size, self.max_buffer_size)
    }

    /// Deserialize and validate a configuration from YAML text. Missing keys take their
    /// default value.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: TapConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read the file at `path` and deserialize it as in [`TapConfig::from_yaml`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_is_valid() {
        TapConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = TapConfig::from_yaml("default_buffer_size: 8192\nmax_devices: 16\n").unwrap();
        assert_eq!(config.default_buffer_size, 8192);
        assert_eq!(config.max_devices, 16);
        assert_eq!(config.initial_devices, TapConfig::default().initial_devices);
    }

    #[test]
    fn rejects_unknown_and_inconsistent() {
        assert!(matches!(
            TapConfig::from_yaml("bogus: 1\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            TapConfig::from_yaml("min_buffer_size: 100\nmax_buffer_size: 50\n"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn clamps_buffer_sizes() {
        let config = TapConfig::default();
        assert_eq!(config.clamp_buffer_size(1), 32);
        assert_eq!(config.clamp_buffer_size(10_000_000), 512 * 1024);
        assert_eq!(config.clamp_buffer_size(1000), 1000);
    }
}
