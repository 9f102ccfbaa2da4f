// src/config.rs — daemon configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    5004
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./labsched-data")
}

fn default_sleep_short_ms() -> u64 {
    100
}

fn default_sleep_long_ms() -> u64 {
    5000
}

fn default_device_timeout_s() -> u64 {
    10
}

/// Daemon settings, read from a TOML file with per-field defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding the three queue databases and the channel
    /// occupancy file.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Driver nap after productive work.
    #[serde(default = "default_sleep_short_ms")]
    pub sleep_short_ms: u64,
    /// Driver nap when there is nothing to do.
    #[serde(default = "default_sleep_long_ms")]
    pub sleep_long_ms: u64,
    /// Transport-level timeout for device HTTP requests.
    #[serde(default = "default_device_timeout_s")]
    pub device_timeout_s: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: default_host(),
            port: default_port(),
            storage_path: default_storage_path(),
            sleep_short_ms: default_sleep_short_ms(),
            sleep_long_ms: default_sleep_long_ms(),
            device_timeout_s: default_device_timeout_s(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
            }
            None => Ok(Config::default()),
        }
    }

    pub fn sleep_short(&self) -> Duration {
        Duration::from_millis(self.sleep_short_ms)
    }

    pub fn sleep_long(&self) -> Duration {
        Duration::from_millis(self.sleep_long_ms)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 5004);
        assert_eq!(cfg.sleep_short_ms, 100);
        assert_eq!(cfg.sleep_long_ms, 5000);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labsched.toml");
        std::fs::write(&path, "port = 6010\nstorage_path = \"/tmp/atc\"\n").unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.port, 6010);
        assert_eq!(cfg.storage_path, PathBuf::from("/tmp/atc"));
        assert_eq!(cfg.sleep_long_ms, 5000);
    }
}
