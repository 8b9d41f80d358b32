// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Service configuration, read from a TOML file with defaults for every field

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

pub const CONFIG_PATH: &str = "/etc/dulus/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub ludus_url: String,
    pub ludus_admin_url: String,
    /// Upper bound on in-flight upstream calls per batch; 0 selects the dispatcher default
    pub max_concurrent_requests: usize,
    pub request_timeout_secs: u64,
    pub data: DataConfig,
    pub proxmox: ProxmoxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub scenarios_dir: PathBuf,
    pub topologies_dir: PathBuf,
    pub pools_dir: PathBuf,
    pub ctfd_data_dir: PathBuf,
    pub ctfd_topology_template: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxConfig {
    pub url: String,
    pub node: String,
    pub username: String,
    pub password: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 5000,
            ludus_url: "https://10.2.60.2:8080".to_string(),
            ludus_admin_url: "https://10.2.60.2:8081".to_string(),
            max_concurrent_requests: 4,
            request_timeout_secs: 120,
            data: DataConfig::default(),
            proxmox: ProxmoxConfig::default(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            scenarios_dir: PathBuf::from("data/scenarios"),
            topologies_dir: PathBuf::from("data/topologies"),
            pools_dir: PathBuf::from("data/pools"),
            ctfd_data_dir: PathBuf::from("data/ctfd-data"),
            ctfd_topology_template: PathBuf::from("data/ctfd_topology.yml"),
        }
    }
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            url: "https://10.2.60.2:8006".to_string(),
            node: "ludus".to_string(),
            username: "root@pam".to_string(),
            password: String::new(),
        }
    }
}

impl Config {
    /// Load from `path`, falling back to defaults when the file is missing or malformed
    pub fn load(path: &Path) -> Self {
        let mut config = match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
                error!("Failed to parse config {}: {}", path.display(), e);
                Config::default()
            }),
            Err(_) => {
                info!("No config at {}, using defaults", path.display());
                Config::default()
            }
        };
        if let Ok(password) = std::env::var("DULUS_PROXMOX_PASSWORD") {
            config.proxmox.password = password;
        }
        config
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| format!("Failed to create config dir: {}", e))?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(path, text).map_err(|e| format!("Failed to write config: {}", e))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Create every data folder the service serves from
    pub fn ensure_data_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.data.scenarios_dir,
            &self.data.topologies_dir,
            &self.data.pools_dir,
            &self.data.ctfd_data_dir,
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
