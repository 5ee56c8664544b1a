//! Command dispatcher (C6): translates an `ExecutionRequest` arriving on
//! the persistent channel into a `ClusterApi` call and replies with exactly
//! one matching `ExecutionResponse` (§3 invariant, §4.6 dispatch table).

use std::sync::Arc;

use tpc_wire::{ExecutionCommand, ExecutionRequest, ExecutionResponse};

use crate::cluster_api::ClusterApi;

pub struct Dispatcher {
    cluster: Arc<ClusterApi>,
}

impl Dispatcher {
    pub fn new(cluster: Arc<ClusterApi>) -> Self {
        Self { cluster }
    }

    pub async fn dispatch(&self, request: ExecutionRequest) -> ExecutionResponse {
        match request.command {
            ExecutionCommand::PreLoadImage => self.handle_pre_load_image(request),
            ExecutionCommand::RunPod => self.handle_run_pod(request).await,
            ExecutionCommand::DeletePod => self.handle_delete_pod(request).await,
            ExecutionCommand::DeleteAllPods => self.handle_delete_all_pods(request).await,
            ExecutionCommand::GetPodDetails => self.handle_get_pod_details(request).await,
        }
    }

    // Open Question (a): the orchestrator-side schema for credential-gated
    // image pulls is not yet fixed upstream. Until it is, this passes the
    // raw arguments through as acknowledged rather than guessing a shape.
    fn handle_pre_load_image(&self, request: ExecutionRequest) -> ExecutionResponse {
        ExecutionResponse::success(request.id, "image preload acknowledged")
    }

    async fn handle_run_pod(&self, request: ExecutionRequest) -> ExecutionResponse {
        let Some(namespace) = request.argument("namespace").map(str::to_string) else {
            return ExecutionResponse::failure(request.id, "missing argument: namespace");
        };
        let Some(image_name) = request.argument("image_name").map(str::to_string) else {
            return ExecutionResponse::failure(request.id, "missing argument: image_name");
        };
        let Some(version) = request.argument("version").map(str::to_string) else {
            return ExecutionResponse::failure(request.id, "missing argument: version");
        };
        let environment = request.argument_mapping("environment").cloned().unwrap_or_default();

        if !self.cluster.create_namespace(&namespace).await {
            return ExecutionResponse::failure(request.id, "failed to ensure namespace");
        }

        match self.cluster.run_pod(&image_name, &version, &environment, &namespace).await {
            Some(pod_name) => ExecutionResponse::success(request.id, pod_name),
            None => ExecutionResponse::failure(request.id, "Failed to create pod"),
        }
    }

    async fn handle_delete_pod(&self, request: ExecutionRequest) -> ExecutionResponse {
        let Some(namespace) = request.argument("namespace").map(str::to_string) else {
            return ExecutionResponse::failure(request.id, "missing argument: namespace");
        };
        let Some(pod_name) = request.argument("pod_name").map(str::to_string) else {
            return ExecutionResponse::failure(request.id, "missing argument: pod_name");
        };

        if self.cluster.delete_pod(&pod_name, &namespace).await {
            ExecutionResponse::success(request.id, "pod deleted")
        } else {
            ExecutionResponse::failure(request.id, "failed to delete pod within budget")
        }
    }

    async fn handle_delete_all_pods(&self, request: ExecutionRequest) -> ExecutionResponse {
        let Some(namespace) = request.argument("namespace").map(str::to_string) else {
            return ExecutionResponse::failure(request.id, "missing argument: namespace");
        };

        if self.cluster.delete_all_pods_in_namespace(&namespace).await {
            ExecutionResponse::success(request.id, "all pods deleted")
        } else {
            ExecutionResponse::failure(request.id, "failed to delete all pods within budget")
        }
    }

    async fn handle_get_pod_details(&self, request: ExecutionRequest) -> ExecutionResponse {
        let Some(namespace) = request.argument("namespace").map(str::to_string) else {
            return ExecutionResponse::failure(request.id, "missing argument: namespace");
        };

        match self.cluster.get_namespace_details(&namespace).await {
            Some(details) => {
                let extra = serde_json::to_value(&details).unwrap_or(serde_json::Value::Null);
                ExecutionResponse::success_with_extra(request.id, "namespace details", extra)
            }
            None => ExecutionResponse::failure(request.id, "failed to query namespace metrics"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tpc_wire::ExecutionResult;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(ClusterApi::new(PathBuf::from("/nonexistent"))))
    }

    #[tokio::test]
    async fn run_pod_without_namespace_argument_fails_fast() {
        let request = ExecutionRequest {
            id: "r1".to_string(),
            command: ExecutionCommand::RunPod,
            arguments: Default::default(),
        };
        let response = dispatcher().dispatch(request).await;
        assert_eq!(response.id, "r1");
        assert_eq!(response.result, ExecutionResult::Failure);
    }

    #[tokio::test]
    async fn pre_load_image_always_acknowledges() {
        let request = ExecutionRequest {
            id: "r2".to_string(),
            command: ExecutionCommand::PreLoadImage,
            arguments: Default::default(),
        };
        let response = dispatcher().dispatch(request).await;
        assert_eq!(response.result, ExecutionResult::Success);
    }
}
