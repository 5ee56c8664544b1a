//! Persistent channel (C6, guest side). Opens a TLS WebSocket client to
//! `wss://{host_ip}:{host_port}/vm_connection`, pinning the exact cert bytes
//! received in the bootstrap handshake (§4.6, §9 "secret_key semantics").
//! Every inbound frame is an `ExecutionRequest`; the dispatcher answers each
//! with exactly one `ExecutionResponse` (§3 invariant), or the channel
//! closes.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use tpc_wire::{ExecutionRequest, ExecutionResponse, HandshakeReceptionMessage};

use crate::cert_pin::{der_from_pem, PinnedCertVerifier};
use crate::dispatcher::Dispatcher;
use crate::error::GuestError;

/// Connects to the host's persistent channel and serves `ExecutionRequest`s
/// until the connection closes or a protocol violation occurs.
pub async fn run(
    handshake: &HandshakeReceptionMessage,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), GuestError> {
    let cert_pem = handshake
        .cert_pem()
        .map_err(|e| GuestError::Fatal(format!("decoding pinned cert from handshake: {e}")))?;
    let cert_der = der_from_pem(std::str::from_utf8(&cert_pem).unwrap_or_default())
        .map_err(|e| GuestError::Fatal(format!("parsing pinned cert PEM: {e}")))?;

    let client_config = PinnedCertVerifier::client_config(cert_der);
    let connector = Connector::Rustls(Arc::new(client_config));

    let url = format!("wss://{}:{}/vm_connection", handshake.ip, handshake.port);
    let (ws_stream, _) =
        tokio_tungstenite::connect_async_tls_with_config(&url, None, false, Some(connector))
            .await
            .map_err(GuestError::from)?;
    tracing::info!(%url, "persistent channel established, cert pinned");

    let (mut sink, mut source) = ws_stream.split();

    while let Some(frame) = source.next().await {
        let message = frame.map_err(GuestError::from)?;
        let Message::Text(text) = message else {
            if matches!(message, Message::Close(_)) {
                break;
            }
            continue;
        };

        let response = match serde_json::from_str::<ExecutionRequest>(&text) {
            Ok(request) => dispatcher.dispatch(request).await,
            Err(e) => ExecutionResponse::malformed(format!("bad request: {e}")),
        };

        let payload = serde_json::to_string(&response).map_err(GuestError::from)?;
        sink.send(Message::Text(payload)).await.map_err(GuestError::from)?;
    }

    Err(GuestError::HostLost("persistent channel closed by host".to_string()))
}
