use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request argument is either a plain string or a string->string mapping
/// (used for `RUN_POD`'s `environment` argument).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgumentValue {
    Scalar(String),
    Mapping(HashMap<String, String>),
}

impl ArgumentValue {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            ArgumentValue::Scalar(s) => Some(s),
            ArgumentValue::Mapping(_) => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&HashMap<String, String>> {
        match self {
            ArgumentValue::Mapping(m) => Some(m),
            ArgumentValue::Scalar(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionCommand {
    PreLoadImage,
    RunPod,
    DeletePod,
    DeleteAllPods,
    GetPodDetails,
}

/// Dispatched host -> guest on the persistent channel. Each `id` is unique
/// within an open channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: String,
    pub command: ExecutionCommand,
    #[serde(default)]
    pub arguments: HashMap<String, ArgumentValue>,
}

impl ExecutionRequest {
    pub fn argument(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(ArgumentValue::as_scalar)
    }

    pub fn argument_mapping(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.arguments.get(name).and_then(ArgumentValue::as_mapping)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionResult {
    Success,
    Failure,
}

/// Dispatched guest -> host in reply to an `ExecutionRequest`. `id` always
/// equals the request's, except for the malformed-input sentinel `"-1"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub id: String,
    pub result: ExecutionResult,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extra: Option<Value>,
}

impl ExecutionResponse {
    pub fn success(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self { id: id.into(), result: ExecutionResult::Success, description: description.into(), extra: None }
    }

    pub fn success_with_extra(id: impl Into<String>, description: impl Into<String>, extra: Value) -> Self {
        Self {
            id: id.into(),
            result: ExecutionResult::Success,
            description: description.into(),
            extra: Some(extra),
        }
    }

    pub fn failure(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self { id: id.into(), result: ExecutionResult::Failure, description: description.into(), extra: None }
    }

    /// Malformed-JSON / schema-violation sentinel response (§4.6).
    pub fn malformed(description: impl Into<String>) -> Self {
        Self::failure("-1", description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_pod_arguments_round_trip() {
        let json = r#"{
            "id": "r1",
            "command": "RUN_POD",
            "arguments": {
                "namespace": "tpc-workers",
                "image_name": "nginx",
                "version": "latest",
                "environment": {"FOO": "bar"}
            }
        }"#;
        let req: ExecutionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.command, ExecutionCommand::RunPod);
        assert_eq!(req.argument("namespace"), Some("tpc-workers"));
        assert_eq!(req.argument_mapping("environment").unwrap().get("FOO"), Some(&"bar".to_string()));
    }

    #[test]
    fn malformed_response_uses_sentinel_id() {
        let resp = ExecutionResponse::malformed("bad json: eof");
        assert_eq!(resp.id, "-1");
        assert_eq!(resp.result, ExecutionResult::Failure);
    }
}
