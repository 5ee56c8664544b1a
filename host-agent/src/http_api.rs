//! Local read-only HTTP surface (C9), grounded in `vm_state_api.py`'s
//! two-route `APIRouter` shape but reimplemented directly on the teacher's
//! raw `hyper` plumbing (`enclave/src/http.rs::serve_http_connection`,
//! `error_response`, `full`) rather than pulling in a routing framework for
//! two routes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tpc_wire::NodeDetails;

use crate::metrics_publisher::MetricsPublisher;

pub const LOCAL_API_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
pub const LOCAL_API_PORT: u16 = 28253;

pub fn full<T: Into<Bytes>>(chunk: T) -> Full<Bytes> {
    Full::new(chunk.into())
}

pub fn error_response(status: StatusCode, message: String) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": { "message": message, "status": status.as_u16() } });
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full(body.to_string()))
        .unwrap()
}

struct ApiState {
    metrics: Arc<MetricsPublisher>,
    node: NodeDetails,
    server_url: String,
    http: reqwest::Client,
}

/// Spawns the accept loop for the local API and returns immediately.
pub fn spawn(metrics: Arc<MetricsPublisher>, node: NodeDetails, server_url: String) {
    let state = Arc::new(ApiState { metrics, node, server_url, http: reqwest::Client::new() });
    tokio::spawn(async move {
        if let Err(e) = serve(state).await {
            tracing::error!("local metrics API stopped: {e}");
        }
    });
}

async fn serve(state: Arc<ApiState>) -> Result<()> {
    let listener = TcpListener::bind((LOCAL_API_IP, LOCAL_API_PORT))
        .await
        .with_context(|| format!("binding local api to {LOCAL_API_IP}:{LOCAL_API_PORT}"))?;
    tracing::info!("serving local metrics API on http://{LOCAL_API_IP}:{LOCAL_API_PORT}");

    loop {
        let (stream, peer) = listener.accept().await.context("accepting local api connection")?;
        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = hyper::service::service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, hyper::Error>(dispatch(state, req).await) }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!("local api connection from {peer} ended: {e}");
            }
        });
    }
}

async fn dispatch(state: Arc<ApiState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/api/v1/vm_metrics") => vm_metrics(state).await,
        (&Method::POST, "/api/v1/gracefully_terminate") => gracefully_terminate(state).await,
        _ => error_response(StatusCode::NOT_FOUND, "no such route".to_string()),
    }
}

async fn vm_metrics(state: Arc<ApiState>) -> Response<Full<Bytes>> {
    let metrics = state.metrics.sample().await;
    match serde_json::to_vec(&metrics) {
        Ok(body) => Response::builder()
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(full(body))
            .unwrap(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn gracefully_terminate(state: Arc<ApiState>) -> Response<Full<Bytes>> {
    let url = format!(
        "{}/api/v1/gracefully_terminate/{}",
        state.server_url.trim_end_matches('/'),
        state.node.url_safe_id()
    );
    match state.http.post(&url).send().await {
        Ok(response) if response.status().is_success() => Response::builder()
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(full(serde_json::json!({"terminated": true}).to_string()))
            .unwrap(),
        Ok(response) => error_response(
            StatusCode::BAD_GATEWAY,
            format!("orchestrator responded with {}", response.status()),
        ),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_status_and_message() {
        let resp = error_response(StatusCode::NOT_FOUND, "missing".to_string());
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
