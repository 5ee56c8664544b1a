//! Cluster API wrapper (C5). Backed by `kube` + `k8s-openapi`, the modern
//! idiomatic replacement for the `kubernetes` PyPI client in
//! `original_source/internal_controller/kubernetes_handling/kube_handler.py`.
//! The `metrics.k8s.io/v1beta1` pods query has no typed `k8s-openapi`
//! binding, so it is issued through `kube::Api<DynamicObject>` against a
//! manually constructed `ApiResource`, matching the original's use of
//! `CustomObjectsApi.list_cluster_custom_object`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, EnvVar, Namespace, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::process::Command;
use tokio::sync::RwLock;
use tpc_wire::units::{parse_cpu_quantity, parse_memory_quantity_mib};
use tpc_wire::{NamespaceDetails, PodDetails};

const METRICS_SERVER_WAIT_TIMEOUT: Duration = Duration::from_secs(360);
const METRICS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const POD_STARTUP_TIMEOUT: Duration = Duration::from_secs(6 * 60);
const POD_DELETE_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const SYSTEM_NAMESPACE: &str = "kube-system";

fn metrics_api_resource() -> ApiResource {
    ApiResource {
        group: "metrics.k8s.io".to_string(),
        version: "v1beta1".to_string(),
        api_version: "metrics.k8s.io/v1beta1".to_string(),
        kind: "PodMetrics".to_string(),
        plural: "pods".to_string(),
    }
}

async fn cluster_cli_present() -> bool {
    Command::new("kubectl")
        .arg("--help")
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn install_cluster_runtime() -> bool {
    Command::new("sh")
        .arg("-c")
        .arg("curl -sfL https://get.k3s.io | sh -")
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
        && cluster_cli_present().await
}

async fn uninstall_cluster_runtime() {
    let _ = Command::new("sh").arg("/usr/local/bin/k3s-uninstall.sh").status().await;
}

async fn load_client(kubeconfig_path: &Path) -> anyhow::Result<Client> {
    let kubeconfig = Kubeconfig::read_from(kubeconfig_path)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}

fn generate_random_suffix(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .filter(|c| c.is_ascii_lowercase())
        .take(length)
        .map(char::from)
        .collect::<String>()
}

/// Guest-side wrapper over the cluster client: namespace/pod lifecycle and
/// metrics queries, all idempotent or poll-to-confirmation per spec §4.5.
pub struct ClusterApi {
    kubeconfig_path: PathBuf,
    client: RwLock<Option<Client>>,
}

impl ClusterApi {
    pub fn new(kubeconfig_path: PathBuf) -> Self {
        Self { kubeconfig_path, client: RwLock::new(None) }
    }

    fn client_handle(&self, guard: &Option<Client>) -> Option<Client> {
        guard.clone()
    }

    /// Idempotent: installs the cluster CLI if absent, then loads the
    /// kubeconfig and opens a client. A no-op once a client is cached.
    pub async fn ensure_ready(&self) -> bool {
        if self.client.read().await.is_some() {
            return true;
        }
        if !cluster_cli_present().await && !install_cluster_runtime().await {
            return false;
        }
        match load_client(&self.kubeconfig_path).await {
            Ok(client) => {
                *self.client.write().await = Some(client);
                true
            }
            Err(e) => {
                tracing::error!("failed to load cluster client: {e:#}");
                false
            }
        }
    }

    /// `ensure_ready`, then waits up to 360s for the metrics API to answer
    /// for the system namespace; on timeout, uninstalls and reinstalls the
    /// cluster runtime, reloads config, and retries once (§4.5).
    pub async fn prepare(&self) -> bool {
        if !self.ensure_ready().await {
            return false;
        }
        if self.wait_for_metrics_server().await {
            return true;
        }

        tracing::warn!("metrics server never became ready, reinstalling cluster runtime");
        uninstall_cluster_runtime().await;
        *self.client.write().await = None;
        if !self.ensure_ready().await {
            return false;
        }
        self.wait_for_metrics_server().await
    }

    async fn wait_for_metrics_server(&self) -> bool {
        let deadline = tokio::time::Instant::now() + METRICS_SERVER_WAIT_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.get_namespace_details(SYSTEM_NAMESPACE).await.is_some() {
                return true;
            }
            tokio::time::sleep(METRICS_POLL_INTERVAL).await;
        }
        false
    }

    /// Idempotent: a namespace that already exists is treated as success.
    pub async fn create_namespace(&self, name: &str) -> bool {
        let Some(client) = self.client_handle(&*self.client.read().await) else {
            return false;
        };
        let api: Api<Namespace> = Api::all(client);
        match api.list(&ListParams::default()).await {
            Ok(list) => {
                if list.items.iter().any(|ns| ns.metadata.name.as_deref() == Some(name)) {
                    return true;
                }
            }
            Err(e) => {
                tracing::error!("failed to list namespaces: {e}");
                return false;
            }
        }

        let namespace = Namespace {
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("failed to create namespace {name}: {e}");
                false
            }
        }
    }

    /// Creates a single-container pod with `image:version` and translated
    /// env vars, then polls until it leaves `Pending`. Returns the generated
    /// pod name on success; deletes the pod and returns `None` on any other
    /// terminal phase, timeout, or API error.
    pub async fn run_pod(
        &self,
        image_name: &str,
        version: &str,
        environment: &HashMap<String, String>,
        namespace: &str,
    ) -> Option<String> {
        let client = self.client_handle(&*self.client.read().await)?;
        let pod_name = format!("{image_name}-{}", generate_random_suffix(10));
        let api: Api<Pod> = Api::namespaced(client, namespace);

        let container = Container {
            name: pod_name.clone(),
            image: Some(format!("{image_name}:{version}")),
            env: Some(
                environment
                    .iter()
                    .map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), ..Default::default() })
                    .collect(),
            ),
            ..Default::default()
        };
        let pod = Pod {
            metadata: ObjectMeta { name: Some(pod_name.clone()), ..Default::default() },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![container],
                ..Default::default()
            }),
            ..Default::default()
        };

        if let Err(e) = api.create(&PostParams::default(), &pod).await {
            tracing::error!("failed to create pod {pod_name}: {e}");
            return None;
        }

        if self.verify_pod_successful_startup(&api, &pod_name).await {
            Some(pod_name)
        } else {
            tracing::error!("pod {pod_name} did not start successfully, deleting");
            self.delete_pod(&pod_name, namespace).await;
            None
        }
    }

    async fn verify_pod_successful_startup(&self, api: &Api<Pod>, pod_name: &str) -> bool {
        let deadline = tokio::time::Instant::now() + POD_STARTUP_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            match api.get(pod_name).await {
                Ok(pod) => {
                    let phase = pod.status.and_then(|s| s.phase);
                    match phase.as_deref() {
                        Some("Pending") | None => tokio::time::sleep(POLL_INTERVAL).await,
                        Some("Running") => return true,
                        Some(_) => return false,
                    }
                }
                Err(e) => {
                    tracing::error!("failed to read pod {pod_name} during startup poll: {e}");
                    return false;
                }
            }
        }
        false
    }

    /// Deletes a pod and polls until a subsequent read raises `NotFound`.
    /// Timing out returns `false`.
    pub async fn delete_pod(&self, pod_name: &str, namespace: &str) -> bool {
        let Some(client) = self.client_handle(&*self.client.read().await) else {
            return false;
        };
        let api: Api<Pod> = Api::namespaced(client, namespace);
        if let Err(e) = api.delete(pod_name, &DeleteParams::default()).await {
            if !matches!(&e, kube::Error::Api(resp) if resp.code == 404) {
                tracing::error!("failed to request deletion of pod {pod_name}: {e}");
                return false;
            }
        }

        let deadline = tokio::time::Instant::now() + POD_DELETE_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            match api.get(pod_name).await {
                Ok(_) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(kube::Error::Api(resp)) if resp.code == 404 => return true,
                Err(e) => {
                    tracing::error!("failed to poll pod {pod_name} during deletion: {e}");
                    return false;
                }
            }
        }
        false
    }

    /// Bulk delete via a collection delete, then polls the namespace's pod
    /// list until empty.
    pub async fn delete_all_pods_in_namespace(&self, namespace: &str) -> bool {
        let Some(client) = self.client_handle(&*self.client.read().await) else {
            return false;
        };
        let api: Api<Pod> = Api::namespaced(client, namespace);
        if let Err(e) = api.delete_collection(&DeleteParams::default(), &ListParams::default()).await {
            tracing::error!("failed to request collection delete in {namespace}: {e}");
            return false;
        }

        let deadline = tokio::time::Instant::now() + POD_DELETE_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            match api.list(&ListParams::default()).await {
                Ok(list) if list.items.is_empty() => return true,
                Ok(_) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => {
                    tracing::error!("failed to list pods in {namespace} during bulk delete: {e}");
                    return false;
                }
            }
        }
        false
    }

    /// Queries `metrics.k8s.io/v1beta1` pods cluster-wide and projects the
    /// entries whose namespace matches. Returns `None` on any API error.
    /// Entries whose `cpu`/`memory` quantity strings don't parse via
    /// `tpc_wire::units` are logged and dropped rather than forwarded
    /// unchecked.
    pub async fn get_namespace_details(&self, namespace: &str) -> Option<NamespaceDetails> {
        let client = self.client_handle(&*self.client.read().await)?;
        let resource = metrics_api_resource();
        let api: Api<DynamicObject> = Api::all_with(client, &resource);

        let list = match api.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                tracing::error!("failed to list pod metrics: {e}");
                return None;
            }
        };

        let mut pod_details = Vec::new();
        for item in list.items {
            if item.metadata.namespace.as_deref() != Some(namespace) {
                continue;
            }
            let Some(name) = item.metadata.name.clone() else { continue };
            let Some(containers) = item.data.get("containers").and_then(|v| v.as_array()) else {
                continue;
            };
            let Some(first) = containers.first() else { continue };
            let Some(usage) = first.get("usage") else { continue };
            let cpu = usage.get("cpu").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let memory = usage.get("memory").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let window = item.data.get("window").and_then(|v| v.as_str()).unwrap_or_default().to_string();

            match build_pod_details(name, cpu, memory, window) {
                Some(details) => pod_details.push(details),
                None => continue,
            }
        }
        Some(NamespaceDetails { pod_details })
    }
}

/// Validates `cpu`/`memory` through `tpc_wire::units` before accepting a pod
/// metrics entry; logs and drops entries the parser rejects instead of
/// forwarding raw, unvalidated quantity strings.
fn build_pod_details(pod_name: String, cpu: String, memory: String, measurement_window: String) -> Option<PodDetails> {
    if let Err(e) = parse_cpu_quantity(&cpu) {
        tracing::warn!("skipping pod {pod_name}: malformed cpu quantity {cpu:?}: {e}");
        return None;
    }
    if let Err(e) = parse_memory_quantity_mib(&memory) {
        tracing::warn!("skipping pod {pod_name}: malformed memory quantity {memory:?}: {e}");
        return None;
    }
    Some(PodDetails {
        pod_name,
        cpu_utilization: cpu,
        memory_utilization: memory,
        measurement_window,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_suffix_is_lowercase_and_requested_length() {
        let suffix = generate_random_suffix(10);
        assert_eq!(suffix.len(), 10);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[tokio::test]
    async fn operations_fail_closed_before_client_is_ready() {
        let api = ClusterApi::new(PathBuf::from("/nonexistent/kubeconfig"));
        assert!(!api.create_namespace("tpc-workers").await);
        assert!(api.run_pod("nginx", "latest", &HashMap::new(), "tpc-workers").await.is_none());
        assert!(!api.delete_pod("nginx-abc", "tpc-workers").await);
        assert!(!api.delete_all_pods_in_namespace("tpc-workers").await);
        assert!(api.get_namespace_details("tpc-workers").await.is_none());
    }

    #[test]
    fn build_pod_details_accepts_well_formed_quantities() {
        let details = build_pod_details(
            "nginx-abc".to_string(),
            "250m".to_string(),
            "456Ki".to_string(),
            "30s".to_string(),
        );
        assert!(details.is_some());
        let details = details.unwrap();
        assert_eq!(details.cpu_utilization, "250m");
        assert_eq!(details.memory_utilization, "456Ki");
    }

    #[test]
    fn build_pod_details_drops_malformed_cpu_quantity() {
        assert!(build_pod_details(
            "nginx-abc".to_string(),
            "250x".to_string(),
            "456Ki".to_string(),
            "30s".to_string(),
        )
        .is_none());
    }

    #[test]
    fn build_pod_details_drops_malformed_memory_quantity() {
        assert!(build_pod_details(
            "nginx-abc".to_string(),
            "250m".to_string(),
            "not-a-quantity".to_string(),
            "30s".to_string(),
        )
        .is_none());
    }
}
