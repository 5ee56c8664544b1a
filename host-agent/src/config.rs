//! Process-wide configuration for the worker manager. A plain
//! `serde`-deserializable struct, loaded once at startup and threaded
//! through constructors read-only thereafter (§9 Design Notes).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    pub server_ip: String,
    pub server_port: u16,
    pub raw_ws_port: u16,
    pub server_url: String,
    pub cpu_limit: u32,
    pub memory_limit: u32,
    pub qemu_installation_location: String,
    pub vm_image_location: String,
    #[serde(default)]
    pub trace_level: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            server_ip: "127.0.0.1".to_string(),
            server_port: 8080,
            raw_ws_port: 9090,
            server_url: "http://127.0.0.1".to_string(),
            cpu_limit: 4,
            memory_limit: 4096,
            qemu_installation_location: "undefined".to_string(),
            vm_image_location: "undefined".to_string(),
            trace_level: 2,
        }
    }
}

impl HostConfig {
    /// Default platform configuration path, mirroring
    /// `ConfigurationManager.CONFIGURATION_PATH` in the original.
    pub fn default_path() -> PathBuf {
        if cfg!(target_os = "linux") {
            PathBuf::from("/etc/tpc-worker-manager/config.json")
        } else {
            let profile = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(profile).join(".tpc-worker-manager").join("config.json")
        }
    }

    /// Loads the configuration at `path`. If the file does not exist, writes
    /// out the defaults and continues with them.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.is_file() {
            let config = Self::default();
            config.write(path)?;
            return Ok(config);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing default config to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_and_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let loaded = HostConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded, HostConfig::default());
        assert!(path.is_file());
    }

    #[test]
    fn existing_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = HostConfig::default();
        config.server_port = 9999;
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = HostConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded.server_port, 9999);
    }
}
