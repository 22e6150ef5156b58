//! Runtime settings.
//!
//! Loaded in layers, later layers winning:
//! 1. built-in defaults
//! 2. optional TOML file
//! 3. environment variables, e.g. `SKYPULSE__STORE__MAX_ENTRIES=50`

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::Result;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Upper bound on reading request headers and, separately, the body.
    pub read_timeout_ms: u64,
    pub max_body_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub max_entries: usize,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PersistenceConfig {
    pub path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 4567)),
            read_timeout_ms: 5_000,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 20,
            ttl_secs: 30,
            sweep_interval_secs: 30,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("weatherData.json"),
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl StoreConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("SKYPULSE")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let reject = |msg: &str| -> Result<()> {
            Err(config::ConfigError::Message(msg.to_string()).into())
        };
        if self.store.max_entries == 0 {
            return reject("store.max_entries must be at least 1");
        }
        if self.store.sweep_interval_secs == 0 {
            return reject("store.sweep_interval_secs must be at least 1");
        }
        if self.server.read_timeout_ms == 0 {
            return reject("server.read_timeout_ms must be at least 1");
        }
        Ok(())
    }
}
