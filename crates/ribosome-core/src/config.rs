//! Runtime configuration.
//!
//! ## Learning: Layered Defaults
//!
//! Every section carries `#[serde(default)]`, so a config file only needs
//! the keys it changes. A missing file is the same as an empty one.
//!
//! ```toml
//! [dispatch]
//! lock_timeout_secs = 5
//!
//! [gather]
//! threads = 4
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-wide runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Request dispatch settings
    pub dispatch: DispatchConfig,

    /// Gathered IO settings
    pub gather: GatherConfig,

    /// Logging settings
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Loads config from the default location.
    pub fn load() -> Self {
        Self::load_from_default_path().unwrap_or_default()
    }

    /// Loads config from a file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    fn load_from_default_path() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Returns the default config file path.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("ribosome").join("runtime.toml"))
    }

    /// Writes the config to `path`, creating parent directories.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Saves the config to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::default_path()?)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            gather: GatherConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Request dispatch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Seconds to wait for the state lock
    pub lock_timeout_secs: u64,
}

impl DispatchConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 10,
        }
    }
}

/// Gathered IO configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatherConfig {
    /// Maximum concurrently running gathered IOs
    pub threads: usize,

    /// Timeout for gathers that do not set one, in seconds
    pub default_timeout_secs: u64,
}

impl GatherConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

impl Default for GatherConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            default_timeout_secs: 30,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config directory not found")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.dispatch.lock_timeout(), Duration::from_secs(10));
        assert_eq!(config.gather.threads, 8);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: RuntimeConfig = toml::from_str("[gather]\nthreads = 2\n").unwrap();
        assert_eq!(config.gather.threads, 2);
        assert_eq!(config.gather.default_timeout_secs, 30);
        assert_eq!(config.dispatch.lock_timeout_secs, 10);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("runtime.toml");
        let mut config = RuntimeConfig::default();
        config.dispatch.lock_timeout_secs = 3;
        config.save_to(&path).unwrap();
        assert_eq!(RuntimeConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.toml");
        std::fs::write(&path, "dispatch = 3").unwrap();
        assert!(matches!(RuntimeConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }
}
