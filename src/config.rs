//! Local Configuration
//!
//! Holds the relay pool membership and the optional Bitcoin RPC record,
//! persisted as a single JSON file in the data directory.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;

const CONFIG_FILE: &str = "config.json";

/// Bitcoin Core RPC credentials for self-sovereign OTS verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtcRpcConfig {
    pub host: String,
    pub user: String,
    pub password: String,
}

/// Process configuration: pool relays and the optional Bitcoin RPC record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default)]
    pub btcrpc: Option<BtcRpcConfig>,
}

/// Resolve the data directory: `ES_DATA_DIR` if set, `$HOME/.config/es`
/// otherwise.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = env::var("ES_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".config").join("es")
}

impl Config {
    /// Load the configuration from `<dir>/config.json`, falling back to the
    /// default (no relays, no RPC) when the file does not exist yet.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            debug!("no config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Persist the configuration to `<dir>/config.json`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        crate::store::write_json_atomic(&dir.join(CONFIG_FILE), self)
    }

    pub fn configure_rpc(&mut self, host: String, user: String, password: String) {
        self.btcrpc = Some(BtcRpcConfig {
            host,
            user,
            password,
        });
    }

    pub fn unset_rpc(&mut self) {
        self.btcrpc = None;
    }
}
