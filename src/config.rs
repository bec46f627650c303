//! Configuration file loading and value parsing.
//!
//! Configuration lives in a JSON file (`fsserve.json` by default); the CLI
//! layers `FSSERVE_*` environment variables and flags on top of the fields
//! they override. Duration fields accept `ms`/`s`/`m`/`h` suffixes, byte
//! sizes accept `B`/`K`/`KB`/`KIB`/`M`/`MB`/`MIB`/`G`/`GB`/`GIB` (binary
//! multiples). Malformed values fall back to their defaults with a warning
//! rather than failing startup.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::mime::MimeType;
use crate::serve::{Route, ServeOpts};
use crate::tree::SyncConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed parsing config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub base: String,
    #[serde(rename = "contentdir")]
    pub content_dir: String,
    #[serde(rename = "treedb")]
    pub tree_db: String,
    pub proxies: Vec<String>,
    #[serde(rename = "exttotype")]
    pub ext_to_type: Vec<MimeType>,
    pub routes: Vec<Route>,
    pub sync: SyncConfig,
    #[serde(rename = "maxheadersize")]
    pub max_header_size: String,
    #[serde(rename = "maxconnread")]
    pub max_conn_read: String,
    #[serde(rename = "maxconnheader")]
    pub max_conn_header: String,
    #[serde(rename = "maxconnwrite")]
    pub max_conn_write: String,
    #[serde(rename = "maxconnidle")]
    pub max_conn_idle: String,
    #[serde(rename = "gracefulshutdown")]
    pub graceful_shutdown: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            base: String::new(),
            content_dir: "content".into(),
            tree_db: "tree.db".into(),
            proxies: Vec::new(),
            ext_to_type: Vec::new(),
            routes: Vec::new(),
            sync: SyncConfig::default(),
            max_header_size: "1M".into(),
            max_conn_read: "5s".into(),
            max_conn_header: "2s".into(),
            max_conn_write: "5s".into(),
            max_conn_idle: "5s".into(),
            graceful_shutdown: "5s".into(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load the config file, falling back to defaults when it is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let cfg = Self::load(path)?;
            debug!(path = %path.display(), "read config file");
            Ok(cfg)
        } else {
            debug!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Base directory everything else resolves against.
    pub fn base_dir(&self) -> &str {
        if self.base.is_empty() { "." } else { &self.base }
    }

    /// Server limits with per-field warn-and-default on malformed values.
    pub fn serve_opts(&self) -> ServeOpts {
        let defaults = ServeOpts::default();
        ServeOpts {
            read_timeout: duration_or(&self.max_conn_read, defaults.read_timeout),
            read_header_timeout: duration_or(&self.max_conn_header, defaults.read_header_timeout),
            write_timeout: duration_or(&self.max_conn_write, defaults.write_timeout),
            idle_timeout: duration_or(&self.max_conn_idle, defaults.idle_timeout),
            max_header_bytes: bytes_or(&self.max_header_size, defaults.max_header_bytes),
            graceful_shutdown: duration_or(&self.graceful_shutdown, defaults.graceful_shutdown),
        }
    }
}

fn duration_or(s: &str, default: Duration) -> Duration {
    match parse_duration(s) {
        Some(d) => d,
        None => {
            warn!(value = s, "invalid config duration value");
            default
        }
    }
}

fn bytes_or(s: &str, default: usize) -> usize {
    match parse_bytes(s) {
        Some(b) => b,
        None => {
            warn!(value = s, "invalid config bytes value");
            default
        }
    }
}

/// Parse a duration like `500ms`, `5s`, `2m`, or `1h`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| c.is_ascii_alphabetic())?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

/// Parse a byte size like `512B`, `64K`, `1M`, or `2GIB`.
pub fn parse_bytes(s: &str) -> Option<usize> {
    let s = s.trim().to_ascii_uppercase();
    let split = s.find(|c: char| c.is_ascii_alphabetic())?;
    let (value, unit) = s.split_at(split);
    let value: usize = value.parse().ok()?;
    let multiple: usize = match unit {
        "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        _ => return None,
    };
    value.checked_mul(multiple)
}
