//! TOML configuration loading.
//!
//! Schema mirrors the dotted keys spec.md §6 enumerates: `emulation.*`,
//! `log.*`, `daemon.*`. Only `emulation.reader` is mandatory; everything
//! else defaults the way the original daemon's compiled-in defaults did.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub emulation: EmulationConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Deserialize)]
pub struct EmulationConfig {
    pub reader: String,
    #[serde(default = "default_atq")]
    pub atq: u16,
    #[serde(default = "default_sak")]
    pub sak: u8,
    #[serde(default)]
    pub cmd_delay: u64,
    #[serde(default)]
    pub delay_success_only: bool,
}

fn default_atq() -> u16 {
    0x0004
}

fn default_sak() -> u8 {
    0x28
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_pidfile")]
    pub pidfile: String,
    #[serde(default = "default_fork")]
    pub fork: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pidfile: default_pidfile(),
            fork: default_fork(),
        }
    }
}

fn default_pidfile() -> String {
    "/var/run/edna.pid".to_string()
}

fn default_fork() -> bool {
    true
}

/// Default configuration path, used when `-c` isn't given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/edna/edna.conf";

/// Load and parse the configuration file at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source: Box::new(source),
    })
}
