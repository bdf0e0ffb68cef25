//! Configuration management for termmux.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termmux/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use router::RouterConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("cols must be between 1 and 1000, got {0}")]
    InvalidCols(u16),

    #[error("rows must be between 1 and 1000, got {0}")]
    InvalidRows(u16),

    #[error("scrollback_bytes must be between 1024 and 16777216, got {0}")]
    InvalidScrollback(usize),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const MAX_DIMENSION: u16 = 1000;
const MIN_SCROLLBACK: usize = 1024;
const MAX_SCROLLBACK: usize = 16 * 1024 * 1024;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,

    /// Defaults for new sessions.
    pub session: SessionConfig,

    /// Session router tunables.
    pub router: RouterConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for the rolling log file.
    pub dir: PathBuf,
}

/// Defaults applied to new sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell used when a session names no command.
    pub default_shell: String,

    /// Terminal width when the controlling terminal size is unknown.
    pub cols: u16,

    /// Terminal height when the controlling terminal size is unknown.
    pub rows: u16,

    /// Bytes of output kept per session and replayed as its screen state.
    pub scrollback_bytes: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: default_log_dir(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            cols: protocol::DEFAULT_COLS,
            rows: protocol::DEFAULT_ROWS,
            scrollback_bytes: 64 * 1024,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termmux")
        .join("config.toml")
}

/// Returns the default log directory.
fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termmux")
        .join("logs")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - TERMMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMMUX_SHELL: Override the default shell
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TERMMUX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.log.level = level;
            }
        }

        if let Ok(shell) = std::env::var("TERMMUX_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding default_shell from environment: {}", shell);
                self.session.default_shell = shell;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        if self.session.cols == 0 || self.session.cols > MAX_DIMENSION {
            return Err(ConfigError::InvalidCols(self.session.cols));
        }
        if self.session.rows == 0 || self.session.rows > MAX_DIMENSION {
            return Err(ConfigError::InvalidRows(self.session.rows));
        }

        if !(MIN_SCROLLBACK..=MAX_SCROLLBACK).contains(&self.session.scrollback_bytes) {
            return Err(ConfigError::InvalidScrollback(self.session.scrollback_bytes));
        }

        // Bare program names are resolved through PATH at spawn time.
        let shell_path = Path::new(&self.session.default_shell);
        if self.session.default_shell.is_empty()
            || (shell_path.is_absolute() && !shell_path.exists())
        {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
