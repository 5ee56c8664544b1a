//! Overlay mesh installer (C4, mesh half). Grounded in
//! `original_source/internal_controller/installers/environment_installer.py`'s
//! `EnvironmentInstaller.install_tailscale`: idempotent install of a
//! systemd-managed overlay daemon from a bundled `.tar.gz`, generalized from
//! a hardcoded Tailscale release to a configurable bundle path. `systemctl`
//! invocations are explicit argv child processes rather than `os.system`
//! shell strings, per the spec's replace-`system()` REDESIGN FLAG.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use tar::Archive;
use tokio::process::Command;

const MESH_CLIENT_BIN: &str = "/usr/bin/tailscale";
const MESH_DAEMON_BIN: &str = "/usr/sbin/tailscaled";
const MESH_UNIT_FILE: &str = "/etc/systemd/system/tailscaled.service";
const MESH_DEFAULTS_FILE: &str = "/etc/default/tailscaled";
const MESH_SYSTEMD_SERVICE: &str = "tailscaled";
const MESH_INTERFACE: &str = "tailscale0";

async fn systemctl(args: &[&str]) -> Result<bool> {
    let status = Command::new("systemctl")
        .args(args)
        .status()
        .await
        .with_context(|| format!("spawning systemctl {args:?}"))?;
    Ok(status.success())
}

async fn is_service_active(unit: &str) -> bool {
    systemctl(&["is-active", "--quiet", unit]).await.unwrap_or(false)
}

async fn bring_interface_down() -> Result<bool> {
    let status = Command::new("tailscale")
        .arg("down")
        .status()
        .await
        .context("spawning tailscale down")?;
    Ok(status.success())
}

/// Extracts the bundled mesh archive (client binary, daemon binary, unit
/// file, defaults file) into a scratch directory and installs each piece to
/// its standard location.
fn extract_bundle(bundle_path: &Path, scratch: &Path) -> Result<()> {
    let file = std::fs::File::open(bundle_path)
        .with_context(|| format!("opening mesh bundle {}", bundle_path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.unpack(scratch).context("extracting mesh bundle")?;
    Ok(())
}

fn install_extracted(scratch: &Path) -> Result<()> {
    install_file(&scratch.join("tailscale"), Path::new(MESH_CLIENT_BIN))?;
    install_file(&scratch.join("tailscaled"), Path::new(MESH_DAEMON_BIN))?;
    install_file(&scratch.join("systemd").join("tailscaled.service"), Path::new(MESH_UNIT_FILE))?;
    install_file(&scratch.join("systemd").join("tailscaled.defaults"), Path::new(MESH_DEFAULTS_FILE))?;
    Ok(())
}

fn install_file(src: &Path, dest: &Path) -> Result<()> {
    std::fs::copy(src, dest)
        .with_context(|| format!("installing {} to {}", src.display(), dest.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("setting permissions on {}", dest.display()))?;
    }
    Ok(())
}

/// Idempotent install of the overlay mesh daemon (§4.4). If the systemd
/// unit is already active, just brings the interface down so a later
/// `up --authkey` can attach cleanly. Otherwise unpacks the bundle, installs
/// the binaries/unit/defaults, enables and starts the service, then brings
/// the interface down. Returns `true` only if every step that ran
/// succeeded.
pub async fn install_mesh(bundle_path: &str) -> bool {
    if is_service_active(MESH_SYSTEMD_SERVICE).await {
        return bring_interface_down().await.unwrap_or(false);
    }

    let Ok(scratch) = tempfile::tempdir() else {
        tracing::error!("failed to allocate scratch directory for mesh install");
        return false;
    };

    let _ = systemctl(&["unmask", "tailscaled.service"]).await;

    if let Err(e) = extract_bundle(Path::new(bundle_path), scratch.path()) {
        tracing::error!("failed to extract mesh bundle: {e:#}");
        return false;
    }
    if let Err(e) = install_extracted(scratch.path()) {
        tracing::error!("failed to install mesh bundle: {e:#}");
        return false;
    }

    let enabled = systemctl(&["enable", MESH_SYSTEMD_SERVICE]).await.unwrap_or(false);
    let started = enabled && systemctl(&["start", MESH_SYSTEMD_SERVICE]).await.unwrap_or(false);
    let active = started && is_service_active(MESH_SYSTEMD_SERVICE).await;

    // Always attempt to bring the interface down so a subsequent `up
    // --authkey` is the first state change; failing this after a
    // successful install/start is still a failure to report upward.
    let down = bring_interface_down().await.unwrap_or(false);

    active && down
}

pub fn default_bundle_path() -> PathBuf {
    PathBuf::from("/usr/share/tpc-guest-agent/mesh-bundle.tar.gz")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bundle_path_is_absolute() {
        assert!(default_bundle_path().is_absolute());
    }
}
