//! Hypervisor driver (C3): launches the QEMU-backed guest as an explicit
//! child process handle (argv array, not a shell string — the spec's
//! replace-`system()` REDESIGN FLAG, §9 Design Notes), forwards a host TCP
//! port to the guest's fixed bootstrap port, and samples the child's
//! CPU%/RSS with `sysinfo` rather than hand-rolled `/proc` parsing, as
//! `original_source/worker_manager/monitoring/metrics_distribution.py`'s
//! `psutil` sampling is generalized to in `SPEC_FULL.md` §4.3.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use sysinfo::{Pid, System};
use tokio::process::{Child, Command};
use tpc_wire::GUEST_BOOTSTRAP_PORT;

pub struct HypervisorDriver {
    qemu_path: String,
    image_path: String,
    cpu_count: u32,
    memory_mib: u32,
    child: Mutex<Option<Child>>,
    alive: AtomicBool,
}

impl HypervisorDriver {
    pub fn new(qemu_path: String, image_path: String, cpu_count: u32, memory_mib: u32) -> Self {
        Self {
            qemu_path,
            image_path,
            cpu_count,
            memory_mib,
            child: Mutex::new(None),
            alive: AtomicBool::new(false),
        }
    }

    /// Spawns the hypervisor, forwarding host TCP `forwarded_port` to the
    /// guest's fixed [`GUEST_BOOTSTRAP_PORT`]. Streams are piped but never
    /// consumed, matching the original's `Popen(..., stdout=PIPE, ...)`.
    pub fn run(&self, forwarded_port: u16) -> Result<()> {
        let hostfwd = format!(
            "user,model=virtio-net-pci,hostfwd=tcp::{forwarded_port}-:{GUEST_BOOTSTRAP_PORT}"
        );
        let memory = format!("{}M", self.memory_mib);

        let child = Command::new(&self.qemu_path)
            .arg("-smp")
            .arg(self.cpu_count.to_string())
            .arg("-m")
            .arg(memory)
            .arg("-drive")
            .arg(format!("format=raw,file={}", self.image_path))
            .arg("-nic")
            .arg(hostfwd)
            .arg("-enable-kvm")
            .arg("-display")
            .arg("none")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning hypervisor at {}", self.qemu_path))?;

        *self.child.lock().unwrap() = Some(child);
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Samples the child process's CPU fraction and RSS (MiB) across
    /// `interval`, alongside the statically configured allocation. Returns
    /// all zeros and marks the driver dead if the child is not running.
    pub async fn get_utilization(&self, interval: Duration) -> (f64, f64, f64, f64) {
        let pid = {
            let guard = self.child.lock().unwrap();
            guard.as_ref().and_then(|c| c.id())
        };
        let Some(pid) = pid else {
            self.alive.store(false, Ordering::SeqCst);
            return (0.0, 0.0, 0.0, 0.0);
        };

        let cpu_allocated = self.cpu_count as f64;
        let memory_allocated = self.memory_mib as f64;

        let sys_pid = Pid::from_u32(pid);
        let result = tokio::task::spawn_blocking(move || {
            let mut system = System::new();
            system.refresh_process(sys_pid);
            if system.process(sys_pid).is_none() {
                return None;
            }
            std::thread::sleep(interval);
            system.refresh_process(sys_pid);
            let process = system.process(sys_pid)?;
            let cpu_fraction = (process.cpu_usage() as f64 / 100.0) / cpu_allocated.max(1.0);
            let rss_mib = process.memory() as f64 / (1024.0 * 1024.0);
            Some((cpu_fraction.clamp(0.0, 1.0), rss_mib))
        })
        .await
        .unwrap_or(None);

        match result {
            Some((cpu_fraction, rss_mib)) => (cpu_fraction, cpu_allocated, rss_mib, memory_allocated),
            None => {
                self.alive.store(false, Ordering::SeqCst);
                (0.0, 0.0, 0.0, 0.0)
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Kills the child subprocess. Idempotent: a second call on an already
    /// dead or absent child is a no-op.
    pub fn kill(&self) {
        let mut guard = self.child.lock().unwrap();
        if let Some(child) = guard.as_mut() {
            let _ = child.start_kill();
        }
        *guard = None;
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_is_idempotent_with_no_child() {
        let driver = HypervisorDriver::new("/bin/true".into(), "/dev/null".into(), 2, 512);
        driver.kill();
        driver.kill();
        assert!(!driver.is_alive());
    }

    #[tokio::test]
    async fn utilization_is_zero_before_run() {
        let driver = HypervisorDriver::new("/bin/true".into(), "/dev/null".into(), 2, 512);
        let (cpu, allocated, rss, mem_allocated) =
            driver.get_utilization(Duration::from_millis(1)).await;
        assert_eq!((cpu, allocated, rss, mem_allocated), (0.0, 0.0, 0.0, 0.0));
    }
}
