//! Host metrics publisher (C8): every second, fuses host CPU/memory
//! (`sysinfo`, the idiomatic replacement for `psutil`) with the guest
//! process sample from the hypervisor driver (C3) into a `WorkerMetrics`
//! and PUTs it to the orchestrator. Grounded in
//! `metrics_distribution.py`/`vm_state_api.py`: the publisher also exposes
//! its last computed snapshot to C9's local HTTP surface without a second
//! sampling pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sysinfo::System;
use tokio::sync::RwLock;
use tpc_wire::{NodeDetails, WorkerMetrics};

use crate::hypervisor::HypervisorDriver;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

pub struct MetricsPublisher {
    node: NodeDetails,
    server_url: String,
    hypervisor: Arc<HypervisorDriver>,
    http: reqwest::Client,
    last: RwLock<Option<WorkerMetrics>>,
    should_terminate: AtomicBool,
}

impl MetricsPublisher {
    pub fn new(node: NodeDetails, server_url: String, hypervisor: Arc<HypervisorDriver>) -> Arc<Self> {
        Arc::new(Self {
            node,
            server_url,
            hypervisor,
            http: reqwest::Client::new(),
            last: RwLock::new(None),
            should_terminate: AtomicBool::new(false),
        })
    }

    pub fn should_terminate(&self) -> bool {
        self.should_terminate.load(Ordering::SeqCst)
    }

    pub async fn last_metrics(&self) -> Option<WorkerMetrics> {
        *self.last.read().await
    }

    /// Samples and publishes `WorkerMetrics` once. Used both by the
    /// periodic loop and directly by C9's `GET /api/v1/vm_metrics` route,
    /// since that route is specified as synchronously computed rather than
    /// reading a cache.
    pub async fn sample(&self) -> WorkerMetrics {
        let (total_cpu_utilization, total_memory_used, total_memory_available) =
            sample_host(SAMPLE_INTERVAL).await;
        let (vm_cpu_utilization, vm_cpu_allocated, vm_memory_used, vm_memory_available) =
            self.hypervisor.get_utilization(SAMPLE_INTERVAL).await;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        let metrics = WorkerMetrics {
            timestamp,
            total_cpu_utilization,
            total_memory_used,
            total_memory_available,
            vm_cpu_utilization,
            vm_cpu_allocated,
            vm_memory_used,
            vm_memory_available,
        };
        *self.last.write().await = Some(metrics);
        metrics
    }

    async fn publish_once(&self) -> anyhow::Result<()> {
        let metrics = self.sample().await;
        let url = format!(
            "{}/api/v1/node_metrics/{}",
            self.server_url.trim_end_matches('/'),
            self.node.url_safe_id()
        );
        let response = self.http.put(&url).json(&metrics).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("orchestrator rejected metrics with status {}", response.status());
        }
        Ok(())
    }

    /// Runs forever, publishing every second. A failed publish (non-200 or
    /// transport error) flips `should_terminate` and exits the loop (§4.8).
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = self.publish_once().await {
                tracing::error!("metrics publish failed: {e}, terminating");
                self.should_terminate.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

/// Blocking `sysinfo` sample of host-wide CPU% and memory, offloaded to the
/// worker pool per the cooperative-scheduling model (§5).
async fn sample_host(interval: Duration) -> (f64, f64, f64) {
    tokio::task::spawn_blocking(move || {
        let mut system = System::new_all();
        system.refresh_cpu_usage();
        std::thread::sleep(interval);
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_fraction = system.global_cpu_usage() as f64 / 100.0;
        let used_mib = system.used_memory() as f64 / (1024.0 * 1024.0);
        let total_mib = system.total_memory() as f64 / (1024.0 * 1024.0);
        (cpu_fraction.clamp(0.0, 1.0), used_mib, total_mib)
    })
    .await
    .unwrap_or((0.0, 0.0, 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sample_is_well_formed() {
        let hypervisor =
            Arc::new(HypervisorDriver::new("/bin/true".into(), "/dev/null".into(), 1, 256));
        let publisher =
            MetricsPublisher::new(NodeDetails::new("host-1", "id-1"), "http://x".into(), hypervisor);
        let metrics = publisher.sample().await;
        assert!(metrics.is_well_formed());
        assert!(publisher.last_metrics().await.is_some());
    }
}
