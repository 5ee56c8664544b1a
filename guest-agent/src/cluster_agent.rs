//! Cluster agent installer (C4, cluster-agent half). Grounded in
//! `original_source/internal_controller/kubernetes_handling/kube_utility_installation_functions.py::install_k3s`
//! and `kube_handler.py`'s `reinstall_k3s`, generalized to the node-name,
//! token and `--vpn-auth` composition the spec's `install_cluster_agent`
//! requires.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::process::Command;
use tpc_wire::RegistrationDetails;

const CLUSTER_AGENT_BIN: &str = "/usr/local/bin/k3s";
const CLUSTER_AGENT_UNINSTALL_SCRIPT: &str = "/usr/local/bin/k3s-agent-uninstall.sh";
const INSTALL_SCRIPT_URL: &str = "https://get.k3s.io";
const MESH_NAME: &str = "tpc-mesh";

async fn run_ok(cmd: &mut Command) -> bool {
    cmd.status().await.map(|s| s.success()).unwrap_or(false)
}

/// Builds the `INSTALL_K3S_EXEC` invocation line: token, server URL,
/// node name, kubelet args disabling per-QoS cgroups and node-allocatable
/// enforcement, and the `--vpn-auth` join string (§4.4).
fn compose_agent_invocation_line(node_name: &str, registration: &RegistrationDetails) -> String {
    format!(
        "--token {token} --server https://{k8s_ip}:{k8s_port} --node-name {node_name} \
         --kubelet-arg=cgroups-per-qos=false --kubelet-arg=enforce-node-allocatable= \
         --vpn-auth=\"name={mesh},joinKey={vpn_token},controlServerURL=https://{vpn_ip}:{vpn_port}\"",
        token = registration.k8s_token,
        k8s_ip = registration.k8s_ip,
        k8s_port = registration.k8s_port,
        node_name = node_name,
        mesh = MESH_NAME,
        vpn_token = registration.vpn_token,
        vpn_ip = registration.vpn_ip,
        vpn_port = registration.vpn_port,
    )
}

/// If a prior uninstall script is present, the agent binary it would delete
/// is preserved across the uninstall and restored afterward so the
/// subsequent `SKIP_DOWNLOAD=true` install can reuse it.
async fn run_prior_uninstall_preserving_binary() -> Result<()> {
    let script = Path::new(CLUSTER_AGENT_UNINSTALL_SCRIPT);
    if !script.is_file() {
        return Ok(());
    }
    let preserved = std::fs::read(CLUSTER_AGENT_BIN).ok();
    let _ = run_ok(Command::new("sh").arg(script)).await;
    if let Some(bytes) = preserved {
        std::fs::write(CLUSTER_AGENT_BIN, bytes).context("restoring preserved agent binary")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(CLUSTER_AGENT_BIN, std::fs::Permissions::from_mode(0o755))
                .context("restoring agent binary permissions")?;
        }
    }
    Ok(())
}

async fn clear_invocation_id_override() -> bool {
    run_ok(Command::new("systemctl").args(["unset-environment", "INVOCATION_ID"])).await
}

async fn start_unit(unit: &str) -> bool {
    run_ok(Command::new("systemctl").args(["start", unit])).await
}

/// Installs and starts the cluster agent (k3s) against the orchestrator's
/// registration details, joining it to both the Kubernetes control plane
/// and the mesh in one invocation (§4.4). Returns `true` only if both the
/// install step and the subsequent unit start succeed.
pub async fn install_cluster_agent(
    node_name: &str,
    registration: &RegistrationDetails,
    unit_name: &str,
) -> bool {
    if let Err(e) = run_prior_uninstall_preserving_binary().await {
        tracing::error!("failed to preserve cluster agent binary across reinstall: {e:#}");
        return false;
    }

    let invocation = compose_agent_invocation_line(node_name, registration);
    let install_ok = run_ok(
        Command::new("sh")
            .arg("-c")
            .arg(format!("curl -sfL {INSTALL_SCRIPT_URL} | sh -"))
            .env("SKIP_START", "true")
            .env("SKIP_DOWNLOAD", "true")
            .env("INSTALL_K3S_EXEC", &invocation),
    )
    .await;
    if !install_ok {
        tracing::error!("cluster agent install script failed");
        return false;
    }

    clear_invocation_id_override().await;
    let started = start_unit(unit_name).await;
    if !started {
        tracing::error!("cluster agent unit {unit_name} failed to start");
    }
    started
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registration() -> RegistrationDetails {
        RegistrationDetails {
            k8s_token: "tok".to_string(),
            k8s_ip: "10.0.0.1".to_string(),
            k8s_port: 6443,
            vpn_token: "vtok".to_string(),
            vpn_ip: "10.1.0.1".to_string(),
            vpn_port: 41641,
        }
    }

    #[test]
    fn invocation_line_carries_all_fields() {
        let line = compose_agent_invocation_line("worker-1", &sample_registration());
        assert!(line.contains("--token tok"));
        assert!(line.contains("--server https://10.0.0.1:6443"));
        assert!(line.contains("--node-name worker-1"));
        assert!(line.contains("--kubelet-arg=cgroups-per-qos=false"));
        assert!(line.contains("--kubelet-arg=enforce-node-allocatable="));
        assert!(line.contains(
            "--vpn-auth=\"name=tpc-mesh,joinKey=vtok,controlServerURL=https://10.1.0.1:41641\""
        ));
    }
}
