//! Guest-side orchestrator HTTP client: registration, liveness probing, and
//! keepalive. One shared `reqwest::Client` behind one `tokio::sync::Mutex`,
//! per §5/§9 "lock discipline" — `is_node_online` and the keepalive loop
//! serialize through it so no two client sessions run at once.

use anyhow::{bail, Context, Result};
use tokio::sync::Mutex;
use tpc_wire::{NodeDetails, RegistrationDetails};

pub struct OrchestratorClient {
    server_url: String,
    http: Mutex<reqwest::Client>,
}

impl OrchestratorClient {
    pub fn new(server_url: String) -> Self {
        Self { server_url, http: Mutex::new(reqwest::Client::new()) }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }

    /// `POST /api/v1/node_token` with this node's identity; parses the
    /// orchestrator's `RegistrationDetails` response.
    pub async fn fetch_registration(&self, node: &NodeDetails) -> Result<RegistrationDetails> {
        let http = self.http.lock().await;
        let response = http
            .post(self.url("/api/v1/node_token"))
            .json(node)
            .send()
            .await
            .context("requesting node token")?;
        if !response.status().is_success() {
            bail!("orchestrator rejected node_token request with {}", response.status());
        }
        response.json().await.context("parsing registration details")
    }

    /// `GET /api/v1/node_exists/{node_name}` — 200 means the node is
    /// visible to the orchestrator.
    pub async fn is_node_online(&self, node_name: &str) -> bool {
        let http = self.http.lock().await;
        let url = self.url(&format!("/api/v1/node_exists/{node_name}"));
        http.get(url).send().await.map(|r| r.status().is_success()).unwrap_or(false)
    }

    /// `PUT /api/v1/node_keepalive/{node_name}`. Failures are logged and
    /// swallowed — keepalive never affects lifecycle state (§4.6).
    pub async fn send_keepalive(&self, node_name: &str) {
        let http = self.http.lock().await;
        let url = self.url(&format!("/api/v1/node_keepalive/{node_name}"));
        match http.put(url).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => tracing::warn!("keepalive rejected with status {}", response.status()),
            Err(e) => tracing::warn!("keepalive request failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_trailing_slash_cleanly() {
        let client = OrchestratorClient::new("http://orchestrator/".to_string());
        assert_eq!(client.url("/api/v1/node_token"), "http://orchestrator/api/v1/node_token");
    }
}
