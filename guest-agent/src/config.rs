//! Process-wide configuration for the internal controller. Loaded once at
//! startup and threaded read-only through constructors, mirroring
//! `tpc_host_agent::config::HostConfig`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestConfig {
    pub bootstrap_port: u16,
    pub mesh_bundle_path: String,
    pub mesh_unit_name: String,
    pub cluster_agent_unit_name: String,
    pub kubeconfig_path: String,
    #[serde(default)]
    pub trace_level: usize,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            bootstrap_port: tpc_wire::GUEST_BOOTSTRAP_PORT,
            mesh_bundle_path: "/usr/share/tpc-guest-agent/mesh-bundle.tar.gz".to_string(),
            mesh_unit_name: "tpc-mesh.service".to_string(),
            cluster_agent_unit_name: "k3s-agent.service".to_string(),
            kubeconfig_path: Self::default_kubeconfig_path_str(),
            trace_level: 2,
        }
    }
}

impl GuestConfig {
    fn default_kubeconfig_path_str() -> String {
        if cfg!(target_os = "linux") {
            "/etc/rancher/k3s/k3s.yaml".to_string()
        } else {
            let profile = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
            format!("{profile}\\.kube\\config")
        }
    }

    pub fn default_path() -> PathBuf {
        if cfg!(target_os = "linux") {
            PathBuf::from("/etc/tpc-guest-agent/config.json")
        } else {
            let profile = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(profile).join(".tpc-guest-agent").join("config.json")
        }
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        PathBuf::from(&self.kubeconfig_path)
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
        let loaded = GuestConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded, GuestConfig::default());
        assert!(path.is_file());
    }

    #[test]
    fn existing_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = GuestConfig::default();
        config.bootstrap_port = 40000;
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = GuestConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded.bootstrap_port, 40000);
    }
}
