use serde::{Deserialize, Serialize};

/// A single pod's resource usage as reported by `metrics.k8s.io`. The
/// `cpu_utilization`/`memory_utilization` fields carry the raw Kubernetes
/// quantity strings (e.g. `"123n"`, `"456Ki"`); use [`crate::units`] to
/// parse them into canonical units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodDetails {
    pub pod_name: String,
    pub cpu_utilization: String,
    pub memory_utilization: String,
    pub measurement_window: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NamespaceDetails {
    pub pod_details: Vec<PodDetails>,
}

/// Fused host + guest + pod metrics, published periodically to the
/// orchestrator. All memory fields are in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub timestamp: f64,
    pub total_cpu_utilization: f64,
    pub total_memory_used: f64,
    pub total_memory_available: f64,
    pub vm_cpu_utilization: f64,
    pub vm_cpu_allocated: f64,
    pub vm_memory_used: f64,
    pub vm_memory_available: f64,
}

impl WorkerMetrics {
    /// Property 8: shape invariants a publisher must uphold.
    pub fn is_well_formed(&self) -> bool {
        self.total_memory_used <= self.total_memory_available
            && (0.0..=1.0).contains(&self.vm_cpu_utilization)
            && self.vm_memory_used <= self.vm_memory_available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WorkerMetrics {
        WorkerMetrics {
            timestamp: 0.0,
            total_cpu_utilization: 0.5,
            total_memory_used: 100.0,
            total_memory_available: 200.0,
            vm_cpu_utilization: 0.25,
            vm_cpu_allocated: 2.0,
            vm_memory_used: 50.0,
            vm_memory_available: 100.0,
        }
    }

    #[test]
    fn well_formed_metrics_pass() {
        assert!(sample().is_well_formed());
    }

    #[test]
    fn memory_used_exceeding_available_fails() {
        let mut m = sample();
        m.total_memory_used = m.total_memory_available + 1.0;
        assert!(!m.is_well_formed());
    }

    #[test]
    fn cpu_utilization_out_of_range_fails() {
        let mut m = sample();
        m.vm_cpu_utilization = 1.5;
        assert!(!m.is_well_formed());
    }
}
