//! Configuration loading and management
//!
//! Configuration is a JSON document loaded from
//! `~/.config/recollect/config.json`. Unknown fields are ignored so older
//! engines can read documents written by newer collaborators.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration struct
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Whether the recovery pass may run at process startup
    pub recovery_on_startup: bool,

    /// Override for the transcript root directory
    pub transcript_root: Option<PathBuf>,

    /// Override for the store file path
    pub database_path: Option<PathBuf>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recovery_on_startup: true,
            transcript_root: None,
            database_path: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of rotated log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("recollect")
            .join("config.json")
    }

    /// Returns the data directory path (for the store and checkpoint)
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("recollect")
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("recollect")
    }

    /// Returns the store file path
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("recollect.db"))
    }

    /// Returns the default checkpoint file path
    pub fn checkpoint_path() -> PathBuf {
        Self::data_dir().join("sync-checkpoint.json")
    }

    /// Returns the transcript root directory
    ///
    /// Defaults to `~/.claude/projects`, the layout this engine ingests.
    pub fn transcript_root(&self) -> PathBuf {
        self.transcript_root.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".claude")
                .join("projects")
        })
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("recollect.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.recovery_on_startup);
        assert!(config.transcript_root.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_config() {
        let json = r#"
        {
            "recoveryOnStartup": false,
            "transcriptRoot": "/tmp/transcripts",
            "logging": { "level": "debug", "maxFiles": 3 }
        }
        "#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert!(!config.recovery_on_startup);
        assert_eq!(
            config.transcript_root,
            Some(PathBuf::from("/tmp/transcripts"))
        );
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.max_files, 3);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = r#"{ "recoveryOnStartup": true, "futureKnob": 42 }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.recovery_on_startup);
    }
}
