//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::allocator::{RecencyConfig, RecencyPolicy};
use crate::device::FileDeviceConfig;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// Missing required configuration field.
    #[error("missing required field: {0}")]
    MissingField(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OxipoolConfig {
    /// Recency allocator configuration.
    pub allocator: Option<AllocatorConfigSpec>,
    /// Serialization file device configuration.
    pub file_device: Option<FileDeviceConfigSpec>,
}

/// `[allocator]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllocatorConfigSpec {
    /// Upper tier byte limit.
    pub mem_limit: Option<u64>,
    /// Lower tier byte limit.
    pub device_limit: Option<u64>,
    /// Eviction policy (`lru` or `mru`).
    pub policy: Option<String>,
    /// Initial retain flag.
    pub retain: Option<bool>,
}

/// `[file_device]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileDeviceConfigSpec {
    /// Directory serialized files are created under.
    pub directory: Option<PathBuf>,
}

impl OxipoolConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXIPOOL_CONFIG` env var (if set), then
    /// apply `OXIPOOL__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("OXIPOOL_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXIPOOL__") {
                continue;
            }
            let path = key["OXIPOOL__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["allocator", "mem_limit"] => {
                    self.allocator_mut().mem_limit = Some(parse_value(&key, &value)?);
                }
                ["allocator", "device_limit"] => {
                    self.allocator_mut().device_limit = Some(parse_value(&key, &value)?);
                }
                ["allocator", "policy"] => {
                    self.allocator_mut().policy = Some(value.to_string());
                }
                ["allocator", "retain"] => {
                    self.allocator_mut().retain = Some(parse_value(&key, &value)?);
                }
                ["file_device", "directory"] => {
                    self.file_device_mut().directory = Some(PathBuf::from(value));
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build a [`RecencyConfig`] from the `[allocator]` section.
    pub fn to_recency_config(&self) -> Result<RecencyConfig, ConfigError> {
        let spec = self.allocator.clone().unwrap_or_default();
        let mem_limit = spec
            .mem_limit
            .ok_or_else(|| ConfigError::MissingField("allocator.mem_limit".to_string()))?;
        let device_limit = spec
            .device_limit
            .ok_or_else(|| ConfigError::MissingField("allocator.device_limit".to_string()))?;

        let mut config = RecencyConfig::new(mem_limit, device_limit);
        if let Some(policy) = &spec.policy {
            let policy: RecencyPolicy =
                policy.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "allocator.policy".to_string(),
                    value: policy.clone(),
                })?;
            config = config.with_policy(policy);
        }
        if let Some(retain) = spec.retain {
            config = config.with_retain(retain);
        }
        Ok(config)
    }

    /// Build a [`FileDeviceConfig`] from the `[file_device]` section.
    pub fn to_file_device_config(&self) -> Result<FileDeviceConfig, ConfigError> {
        let spec = self.file_device.clone().unwrap_or_default();
        let directory = spec
            .directory
            .ok_or_else(|| ConfigError::MissingField("file_device.directory".to_string()))?;
        Ok(FileDeviceConfig::new(directory))
    }

    fn allocator_mut(&mut self) -> &mut AllocatorConfigSpec {
        self.allocator.get_or_insert_with(Default::default)
    }

    fn file_device_mut(&mut self) -> &mut FileDeviceConfigSpec {
        self.file_device.get_or_insert_with(Default::default)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::RecencyPolicy;

    #[test]
    fn test_parse_toml() {
        let config: OxipoolConfig = toml::from_str(
            r#"
            [allocator]
            mem_limit = 100
            device_limit = 1000
            policy = "mru"
            retain = true

            [file_device]
            directory = "/tmp/oxipool"
            "#,
        )
        .unwrap();

        let recency = config.to_recency_config().unwrap();
        assert_eq!(recency.mem_limit, 100);
        assert_eq!(recency.device_limit, 1000);
        assert_eq!(recency.policy, RecencyPolicy::Mru);
        assert!(recency.retain);

        let file = config.to_file_device_config().unwrap();
        assert_eq!(file.directory, PathBuf::from("/tmp/oxipool"));
    }

    #[test]
    fn test_missing_limits_is_an_error() {
        let config = OxipoolConfig::default();
        assert!(matches!(
            config.to_recency_config(),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_bad_policy_is_an_error() {
        let config: OxipoolConfig = toml::from_str(
            r#"
            [allocator]
            mem_limit = 1
            device_limit = 1
            policy = "fifo"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.to_recency_config(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
