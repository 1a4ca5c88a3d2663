//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::DEFAULT_EPOCH_INTERVAL_MS;

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
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OxilistConfig {
    /// RCU reclaimer configuration.
    pub rcu: Option<RcuSection>,
}

/// RCU reclaimer tuning knobs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RcuSection {
    /// Reclaimer wake-up interval in milliseconds.
    pub epoch_interval_ms: Option<u64>,
}

impl OxilistConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXILIST_CONFIG` env var (if set),
    /// then apply `OXILIST__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("OXILIST_CONFIG").ok();
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
            if !key.starts_with("OXILIST__") {
                continue;
            }
            let path = key["OXILIST__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["rcu", "epoch_interval_ms"] => {
                    self.rcu_mut().epoch_interval_ms = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }

    /// The configured reclaimer wake-up interval, defaulted when unset.
    pub fn epoch_interval(&self) -> Duration {
        let ms = self
            .rcu
            .as_ref()
            .and_then(|rcu| rcu.epoch_interval_ms)
            .unwrap_or(DEFAULT_EPOCH_INTERVAL_MS);
        Duration::from_millis(ms)
    }

    fn rcu_mut(&mut self) -> &mut RcuSection {
        self.rcu.get_or_insert_with(RcuSection::default)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
