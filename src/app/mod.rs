//! Application glue module
//!
//! Command-line parsing and the settings file.

mod cli;
mod config;

pub use cli::{parse_args, usage, Invocation, RelayConfig};
pub use config::{config_path, ConfigError, Settings, CONFIG_ENV};
