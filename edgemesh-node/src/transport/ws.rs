//! WebSocket content listener
//!
//! Clients open a socket, send JSON piece requests as text frames, and get
//! bincode response frames back. With `tls_enabled` the same listener serves
//! wss:// by wrapping accepted connections in a rustls acceptor before the
//! WebSocket upgrade.

use super::{serve_piece, ClientRequest, ListenerLifecycle, TransportEvent, UsageSink};
use crate::config::WsTransportSettings;
use edgemesh_core::{
    normalize_client_ip, ContentStore, EdgeMeshError, Result, TransportKind, UsageRecord,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

pub struct WsListener {
    settings: WsTransportSettings,
    store: Arc<dyn ContentStore>,
    sink: UsageSink,
    lifecycle: ListenerLifecycle,
}

impl WsListener {
    pub fn new(
        settings: WsTransportSettings,
        store: Arc<dyn ContentStore>,
        sink: UsageSink,
        events: broadcast::Sender<TransportEvent>,
    ) -> Self {
        Self {
            settings,
            store,
            sink,
            lifecycle: ListenerLifecycle::new(TransportKind::WebSocket, events),
        }
    }

    pub async fn listen(&self) -> Result<()> {
        self.lifecycle.begin_starting()?;

        let acceptor = if self.settings.tls_enabled {
            let (cert, key) = match (&self.settings.tls_cert, &self.settings.tls_key) {
                (Some(cert), Some(key)) => (cert.clone(), key.clone()),
                _ => {
                    self.lifecycle.abort_starting();
                    return Err(EdgeMeshError::Transport(
                        "TLS enabled without certificate and key paths".to_string(),
                    ));
                }
            };
            match load_tls_acceptor(&cert, &key) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    self.lifecycle.abort_starting();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let addr = format!("{}:{}", self.settings.bind_ip, self.settings.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.lifecycle.abort_starting();
                return Err(EdgeMeshError::BindFailed { addr, source: e });
            }
        };
        let local_addr = listener.local_addr()?;

        let store = self.store.clone();
        let sink = self.sink.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "WebSocket accept failed");
                        continue;
                    }
                };
                let store = store.clone();
                let sink = sink.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => handle_socket(tls_stream, peer, store, sink).await,
                            Err(e) => debug!(%peer, error = %e, "TLS handshake failed"),
                        },
                        None => handle_socket(stream, peer, store, sink).await,
                    }
                });
            }
        });

        self.lifecycle.mark_listening(local_addr, vec![task]);
        Ok(())
    }

    pub async fn close(&self) -> bool {
        self.lifecycle.close().await
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.lifecycle.local_addr().map(|addr| addr.port())
    }
}

async fn handle_socket<S>(stream: S, peer: SocketAddr, store: Arc<dyn ContentStore>, sink: UsageSink)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "WebSocket upgrade failed");
            return;
        }
    };
    debug!(%peer, "WebSocket client connected");
    let client_ip = normalize_client_ip(&peer.ip().to_string());
    let (mut write, mut read) = ws.split();

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let request: ClientRequest = match serde_json::from_str(&text) {
                    Ok(request) => request,
                    Err(e) => {
                        debug!(%peer, error = %e, "Unparseable piece request");
                        ClientRequest::default()
                    }
                };
                let (response, byte_count) = serve_piece(store.as_ref(), &request).await;
                // A dropped frame means the store failed; send nothing.
                let Some(response) = response else { continue };
                if byte_count > 0 {
                    sink.record(UsageRecord::uploaded(
                        TransportKind::WebSocket,
                        client_ip.clone(),
                        request.content_id.clone().unwrap_or_default(),
                        byte_count,
                    ));
                }
                let frame = match response.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode response frame");
                        continue;
                    }
                };
                if write.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Ping(payload)) => {
                if write.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%peer, error = %e, "WebSocket read failed");
                break;
            }
        }
    }
    debug!(%peer, "WebSocket client disconnected");
}

fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let key_file = std::fs::File::open(key_path)?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))?
        .ok_or_else(|| EdgeMeshError::Transport("No private key found in key file".to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| EdgeMeshError::Transport(format!("Invalid TLS certificate: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ContentResponse;
    use crate::usage::UsageAggregator;
    use edgemesh_core::MemoryContentStore;
    use tokio_tungstenite::connect_async;

    async fn start_listener(content: Option<(&str, Vec<u8>)>) -> (WsListener, Arc<UsageAggregator>) {
        let store = Arc::new(MemoryContentStore::new());
        if let Some((content_id, bytes)) = content {
            store.insert(content_id, "file.bin", bytes::Bytes::from(bytes));
        }
        let aggregator = Arc::new(UsageAggregator::new());
        let (events, _) = broadcast::channel(64);
        let sink = UsageSink::new(aggregator.clone(), events.clone());
        let settings = WsTransportSettings {
            enabled: true,
            bind_ip: "127.0.0.1".to_string(),
            port: 0,
            tls_enabled: false,
            tls_cert: None,
            tls_key: None,
        };
        let listener = WsListener::new(settings, store, sink, events);
        listener.listen().await.unwrap();
        (listener, aggregator)
    }

    async fn request_piece(port: u16, body: &str) -> ContentResponse {
        let url = format!("ws://127.0.0.1:{port}");
        let (mut ws, _) = connect_async(&url).await.unwrap();
        ws.send(Message::Text(body.to_string())).await.unwrap();
        let reply = loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(frame) => break frame,
                _ => continue,
            }
        };
        let _ = ws.close(None).await;
        ContentResponse::decode(&reply).unwrap()
    }

    #[tokio::test]
    async fn serves_piece_and_records_usage() {
        let (listener, aggregator) = start_listener(Some(("abc123", vec![5u8; 4096]))).await;
        let port = listener.bound_port().unwrap();

        let response =
            request_piece(port, r#"{"contentId":"abc123","index":0,"offset":0}"#).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.data.unwrap().buffer.len(), 4096);

        let flushed = aggregator.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].byte_count, 4096);
        assert_eq!(flushed[0].client_ip, "127.0.0.1");

        listener.close().await;
    }

    #[tokio::test]
    async fn unknown_content_gets_404_and_no_usage() {
        let (listener, aggregator) = start_listener(None).await;
        let port = listener.bound_port().unwrap();

        let response =
            request_piece(port, r#"{"contentId":"missing","index":0,"offset":0}"#).await;
        assert_eq!(response.status, 404);
        assert!(response.error.unwrap().contains("missing"));
        assert!(aggregator.flush().is_empty());

        listener.close().await;
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let (listener, _aggregator) = start_listener(Some(("abc123", vec![1u8; 8]))).await;
        let port = listener.bound_port().unwrap();

        let response = request_piece(port, "not json at all").await;
        assert_eq!(response.status, 400);

        listener.close().await;
    }
}
