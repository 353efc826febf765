//! Settings file for default relay options

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable overriding the settings file location
pub const CONFIG_ENV: &str = "TTYSPLIT_CONFIG";

/// Defaults applied before command-line options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Devices opened before any given with `-d`
    pub devices: Vec<PathBuf>,
    /// Log file used when `-f` is not given
    pub log_file: Option<PathBuf>,
    /// Suppress console relaying even without `-s`
    pub suppress_stdout: bool,
    /// Tracing filter used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            log_file: None,
            suppress_stdout: false,
            log_filter: "warn".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Save settings to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from the default location, or defaults when there is no file
    ///
    /// A file that exists but cannot be read or parsed is an error.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

/// `$TTYSPLIT_CONFIG`, else `~/.config/ttysplit/config.json`
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    std::env::var_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join("ttysplit")
            .join("config.json")
    })
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Not enough arguments: {0} needs a value")]
    MissingValue(&'static str),
    #[error("No command given")]
    MissingCommand,
}
