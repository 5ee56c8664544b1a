//! Path-routed WebSocket server abstraction (C2): per-connection IDs, a
//! subscriber interface keyed by URL path, and a synchronous send/await-reply
//! helper used by the relay's request multiplexer (C7). Generalizes the
//! teacher's "own the raw connection, layer protocol by hand" texture from
//! `enclave/src/http.rs::serve_http_connection` to a WS upgrade + frame loop.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub type ConnId = u64;

#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn on_connect(&self, conn_id: ConnId);
    async fn on_message(&self, conn_id: ConnId, message: String);
    async fn on_disconnect(&self, conn_id: ConnId);
}

enum Outbound {
    Text(String),
    Close,
}

struct Connection {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending_reply: Mutex<Option<oneshot::Sender<String>>>,
}

/// TLS material the persistent channel's listener terminates ahead of the WS
/// handshake. `WsServer` only ever serves `/vm_connection` over TLS; the
/// guest's bootstrap listener (plain WS on 39019) is a separate, simpler
/// accept loop in `guest-agent` and never goes through this struct.
pub struct TlsMaterial {
    pub acceptor: tokio_rustls::TlsAcceptor,
}

pub struct WsServer {
    handlers: RwLock<HashMap<String, Arc<dyn ConnectionHandler>>>,
    connections: RwLock<HashMap<ConnId, Arc<Connection>>>,
    next_id: AtomicU64,
    tls: Option<TlsMaterial>,
}

impl WsServer {
    /// Binds `bind_ip:port` and spawns the accept loop immediately,
    /// returning a handle the caller registers path handlers on.
    pub async fn spawn(bind_ip: IpAddr, port: u16, tls: Option<TlsMaterial>) -> Result<Arc<Self>> {
        let listener = TcpListener::bind((bind_ip, port))
            .await
            .with_context(|| format!("binding ws server to {bind_ip}:{port}"))?;

        let server = Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tls,
        });

        let accept_server = server.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let server = accept_server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream).await {
                                tracing::warn!("ws connection from {peer} ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("ws accept failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(server)
    }

    /// Constructs a server with no bound listener, for unit tests that only
    /// exercise connection-registry logic (`send`, `force_disconnect`)
    /// without a real socket.
    #[cfg(test)]
    pub fn new_for_tests() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tls: None,
        }
    }

    pub async fn subscribe(&self, path: impl Into<String>, handler: Arc<dyn ConnectionHandler>) {
        self.handlers.write().await.insert(path.into(), handler);
    }

    async fn handle_connection(self: &Arc<Self>, stream: TcpStream) -> Result<()> {
        let mut matched_path: Option<String> = None;
        let handlers = self.handlers.read().await;
        let known_paths: Vec<String> = handlers.keys().cloned().collect();
        drop(handlers);

        let callback = |req: &Request, response: Response| {
            matched_path = Some(req.uri().path().to_string());
            Ok(response)
        };

        let ws_stream = if let Some(tls) = &self.tls {
            let tls_stream = tls.acceptor.accept(stream).await.context("tls accept")?;
            tokio_tungstenite::accept_hdr_async(tls_stream, callback)
                .await
                .context("ws handshake")?
        } else {
            bail!("plain-text ws requested on a server configured for TLS-only use");
        };

        let path = matched_path.context("no path matched during handshake")?;
        if !known_paths.iter().any(|p| p == &path) {
            bail!("no handler subscribed for path {path}");
        }
        let handler = self
            .handlers
            .read()
            .await
            .get(&path)
            .cloned()
            .ok_or_else(|| anyhow!("handler for {path} vanished"))?;

        self.drive_connection(ws_stream, handler).await
    }

    async fn drive_connection<S>(
        self: &Arc<Self>,
        ws_stream: tokio_tungstenite::WebSocketStream<S>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let conn_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection {
            outbound: outbound_tx,
            pending_reply: Mutex::new(None),
        });
        self.connections.write().await.insert(conn_id, connection.clone());

        handler.on_connect(conn_id).await;

        let (mut sink, mut stream) = ws_stream.split();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let result = match msg {
                    Outbound::Text(text) => sink.send(Message::Text(text)).await,
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let mut pending = connection.pending_reply.lock().await;
                    if let Some(waiter) = pending.take() {
                        let _ = waiter.send(text);
                    } else {
                        drop(pending);
                        handler.on_message(conn_id, text).await;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("ws read error on conn {conn_id}: {e}");
                    break;
                }
            }
        }

        writer.abort();
        self.connections.write().await.remove(&conn_id);
        handler.on_disconnect(conn_id).await;
        Ok(())
    }

    /// Sends `message` to `conn_id`. When `wait_for_reply` is set, awaits the
    /// next inbound frame on that connection and returns it; callers on the
    /// same connection must serialize (the relay does this with its own
    /// mutex), since only one reply waiter can be registered at a time.
    pub async fn send(
        &self,
        conn_id: ConnId,
        message: String,
        wait_for_reply: bool,
    ) -> Result<Option<String>> {
        let connection = self
            .connections
            .read()
            .await
            .get(&conn_id)
            .cloned()
            .ok_or_else(|| anyhow!("no such connection {conn_id}"))?;

        let reply_rx = if wait_for_reply {
            let (tx, rx) = oneshot::channel();
            let mut pending = connection.pending_reply.lock().await;
            if pending.is_some() {
                bail!("connection {conn_id} already has a pending reply waiter");
            }
            *pending = Some(tx);
            Some(rx)
        } else {
            None
        };

        connection
            .outbound
            .send(Outbound::Text(message))
            .map_err(|_| anyhow!("connection {conn_id} closed"))?;

        match reply_rx {
            Some(rx) => Ok(Some(rx.await.map_err(|_| anyhow!("connection {conn_id} closed before replying"))?)),
            None => Ok(None),
        }
    }

    pub async fn force_disconnect(&self, conn_id: ConnId) {
        if let Some(connection) = self.connections.read().await.get(&conn_id) {
            let _ = connection.outbound.send(Outbound::Close);
        }
    }

    pub async fn shutdown(&self) {
        let ids: Vec<ConnId> = self.connections.read().await.keys().copied().collect();
        for id in ids {
            self.force_disconnect(id).await;
        }
    }

    pub async fn is_connected(&self, conn_id: ConnId) -> bool {
        self.connections.read().await.contains_key(&conn_id)
    }
}
