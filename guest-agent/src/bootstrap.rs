//! Bootstrap WebSocket server (C6, guest side). Listens on the fixed guest
//! port (default 39019, §4.6/§6); the first accepted connection is treated
//! as the host. Drives the guest through `Booting -> Meshing ->
//! AgentStarting -> Registered`, replying with exactly one terminal
//! `HandshakeResponse` per §3 property 1, then (on success) hands off to the
//! persistent channel.
//!
//! Supersedes `original_source/internal_controller/connection/vm_manager_connection.py`'s
//! infinite retry-on-bad-JSON loop: a single malformed or schema-invalid
//! message just logs and closes, matching spec.md's §4.6 wording.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tpc_wire::{GuestLifecycle, HandshakeReceptionMessage, HandshakeResponse, RegistrationDetails};

use crate::cluster_agent::install_cluster_agent;
use crate::config::GuestConfig;
use crate::lifecycle::LifecycleTracker;
use crate::mesh::install_mesh;
use crate::orchestrator_client::OrchestratorClient;

const NODE_ONLINE_INITIAL_WAIT: Duration = Duration::from_secs(300);
const NODE_ONLINE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);
const TIMEOUT_BEFORE_CLOSE: Duration = Duration::from_secs(10);

/// Outcome of a completed bootstrap session, handed off to the persistent
/// channel when successful.
pub struct BootstrapOutcome {
    pub handshake: HandshakeReceptionMessage,
    pub registration: RegistrationDetails,
}

/// Binds the bootstrap listener and waits for the single host connection to
/// complete the handshake. Returns `None` if the connection closed or the
/// handshake failed (the caller should treat the lifecycle as `Failed`).
pub async fn run(config: &GuestConfig, lifecycle: &LifecycleTracker) -> Option<BootstrapOutcome> {
    let listener = match TcpListener::bind(("0.0.0.0", config.bootstrap_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind bootstrap listener on port {}: {e}", config.bootstrap_port);
            lifecycle.fail().await;
            return None;
        }
    };
    tracing::info!("bootstrap listener up on 0.0.0.0:{}", config.bootstrap_port);

    let (stream, peer) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
            tracing::error!("failed to accept bootstrap connection: {e}");
            lifecycle.fail().await;
            return None;
        }
    };
    tracing::info!(%peer, "accepted bootstrap connection, treating as host");

    lifecycle.advance(GuestLifecycle::Meshing).await;
    handle_session(stream, config, lifecycle).await
}

async fn handle_session(
    stream: TcpStream,
    config: &GuestConfig,
    lifecycle: &LifecycleTracker,
) -> Option<BootstrapOutcome> {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("bootstrap websocket handshake failed: {e}");
            lifecycle.fail().await;
            return None;
        }
    };
    let (mut sink, mut source) = ws_stream.split();

    let frame = source.next().await;
    let Some(Ok(Message::Text(text))) = frame else {
        tracing::error!("bootstrap connection closed before a handshake message arrived");
        lifecycle.fail().await;
        return None;
    };

    let handshake: HandshakeReceptionMessage = match serde_json::from_str(&text) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!("malformed handshake reception message: {e}");
            lifecycle.fail().await;
            return None;
        }
    };

    let _ = send(&mut sink, HandshakeResponse::initializing("Initializing k3s")).await;

    let mesh_ok = install_mesh(&config.mesh_bundle_path).await;
    if !mesh_ok {
        tracing::error!("mesh install failed");
        let _ = send(&mut sink, HandshakeResponse::failure("Failed to install mesh.. terminating")).await;
        lifecycle.fail().await;
        return None;
    }

    let orchestrator = OrchestratorClient::new(handshake.server_url.clone());
    let registration = match orchestrator.fetch_registration(&handshake.machine_unique_identification).await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("failed to fetch registration details: {e:#}");
            let _ = send(&mut sink, HandshakeResponse::failure("Failed to register with orchestrator.. terminating")).await;
            lifecycle.fail().await;
            return None;
        }
    };

    lifecycle.advance(GuestLifecycle::AgentStarting).await;

    let node_name = handshake.machine_unique_identification.name.clone();
    let orchestrator = Arc::new(orchestrator);
    spawn_keepalive(orchestrator.clone(), node_name.clone());

    let agent_ok =
        install_cluster_agent(&node_name, &registration, &config.cluster_agent_unit_name).await;
    if !agent_ok {
        let _ = send(&mut sink, HandshakeResponse::failure("Failed to initialize installers.. terminating")).await;
        lifecycle.fail().await;
        return None;
    }

    if !wait_for_node_online(&orchestrator, &node_name).await {
        let _ = send(&mut sink, HandshakeResponse::failure("Failed to initialize installers.. terminating")).await;
        lifecycle.fail().await;
        return None;
    }

    lifecycle.advance(GuestLifecycle::Registered).await;
    let _ = send(&mut sink, HandshakeResponse::success("Agent is running")).await;

    tokio::time::sleep(TIMEOUT_BEFORE_CLOSE).await;
    let _ = sink.send(Message::Close(None)).await;

    Some(BootstrapOutcome { handshake, registration })
}

async fn send<S>(
    sink: &mut futures_util::stream::SplitSink<tokio_tungstenite::WebSocketStream<S>, Message>,
    response: HandshakeResponse,
) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let payload = serde_json::to_string(&response)?;
    sink.send(Message::Text(payload)).await?;
    Ok(())
}

fn spawn_keepalive(orchestrator: Arc<OrchestratorClient>, node_name: String) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        loop {
            ticker.tick().await;
            orchestrator.send_keepalive(&node_name).await;
        }
    });
}

async fn wait_for_node_online(orchestrator: &OrchestratorClient, node_name: &str) -> bool {
    let deadline = tokio::time::Instant::now() + NODE_ONLINE_INITIAL_WAIT;
    while tokio::time::Instant::now() < deadline {
        if orchestrator.is_node_online(node_name).await {
            return true;
        }
        tokio::time::sleep(NODE_ONLINE_POLL_INTERVAL).await;
    }
    false
}
