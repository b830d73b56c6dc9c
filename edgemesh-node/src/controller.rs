//! Local controller API
//!
//! A loopback HTTP surface for operators and desktop shells: inspect the
//! node's state and totals, list carried content, and request a shutdown.
//! Binds to localhost by default and is disabled unless configured on.

use crate::config::ControllerSettings;
use crate::master::MasterConnection;
use crate::state::StateStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use edgemesh_core::{ContentStore, EdgeMeshError, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Clone)]
struct ControllerState {
    node_id: String,
    version: String,
    master: Arc<MasterConnection>,
    store: Arc<dyn ContentStore>,
    state: Arc<StateStore>,
    shutdown: mpsc::Sender<()>,
}

#[derive(Serialize)]
struct StatusResponse {
    node_id: String,
    version: String,
    connection_state: crate::master::ConnectionState,
    assignment_address: Option<String>,
    uploaded_bytes: u64,
    downloaded_bytes: u64,
    connected_secs: u64,
}

#[derive(Serialize)]
struct ContentsResponse {
    content_ids: Vec<String>,
}

pub struct ControllerServer {
    settings: ControllerSettings,
    state: ControllerState,
}

impl ControllerServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: ControllerSettings,
        node_id: String,
        version: String,
        master: Arc<MasterConnection>,
        store: Arc<dyn ContentStore>,
        state: Arc<StateStore>,
        shutdown: mpsc::Sender<()>,
    ) -> Self {
        Self {
            settings,
            state: ControllerState {
                node_id,
                version,
                master,
                store,
                state,
                shutdown,
            },
        }
    }

    /// Bind and serve until the task is dropped
    pub async fn serve(self) -> Result<()> {
        let addr = format!("{}:{}", self.settings.bind_ip, self.settings.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| EdgeMeshError::BindFailed { addr: addr.clone(), source: e })?;
        info!(addr = %addr, "Controller API listening");

        let app = router(self.state);
        axum::serve(listener, app)
            .await
            .map_err(|e| EdgeMeshError::Transport(format!("Controller server failed: {e}")))?;
        Ok(())
    }
}

fn router(state: ControllerState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/contents", get(contents))
        .route("/api/shutdown", post(shutdown))
        .with_state(state)
}

async fn status(State(state): State<ControllerState>) -> Json<StatusResponse> {
    let totals = state.state.totals();
    Json(StatusResponse {
        node_id: state.node_id.clone(),
        version: state.version.clone(),
        connection_state: state.master.state().await,
        assignment_address: state.state.assignment_address(),
        uploaded_bytes: totals.uploaded_bytes,
        downloaded_bytes: totals.downloaded_bytes,
        connected_secs: totals.connected_secs,
    })
}

async fn contents(State(state): State<ControllerState>) -> Json<ContentsResponse> {
    Json(ContentsResponse {
        content_ids: state.store.list().await,
    })
}

async fn shutdown(State(state): State<ControllerState>) -> StatusCode {
    info!("Shutdown requested through controller API");
    if state.shutdown.send(()).await.is_err() {
        error!("Shutdown channel is gone");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire_ws::WsWireTransport;
    use edgemesh_core::{MemoryContentStore, NodeMetadata, TransportPorts};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_master(store: Arc<MemoryContentStore>) -> Arc<MasterConnection> {
        MasterConnection::new(
            Arc::new(WsWireTransport::new(Duration::from_secs(1))),
            store,
            None,
            NodeMetadata {
                node_id: "node-test".to_string(),
                version: "0.1.0".to_string(),
                wallet_address: None,
                domain: None,
                ports: TransportPorts::default(),
            },
        )
    }

    async fn raw_request(port: u16, method: &str, path: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request =
            format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).to_string()
    }

    #[tokio::test]
    async fn status_and_contents_endpoints() {
        let store = Arc::new(MemoryContentStore::new());
        store.insert("abc123", "file.bin", bytes::Bytes::from_static(b"data"));
        let state = Arc::new(StateStore::ephemeral());
        state.add_uploaded(2048);
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = router(ControllerState {
            node_id: "node-test".to_string(),
            version: "0.1.0".to_string(),
            master: test_master(store.clone()),
            store,
            state,
            shutdown: shutdown_tx,
        });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let response = raw_request(port, "GET", "/api/status").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""connection_state":"disconnected""#));
        assert!(response.contains(r#""uploaded_bytes":2048"#));

        let response = raw_request(port, "GET", "/api/contents").await;
        assert!(response.contains("abc123"));
    }

    #[tokio::test]
    async fn shutdown_endpoint_signals() {
        let store = Arc::new(MemoryContentStore::new());
        let state = Arc::new(StateStore::ephemeral());
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = router(ControllerState {
            node_id: "node-test".to_string(),
            version: "0.1.0".to_string(),
            master: test_master(store.clone()),
            store,
            state,
            shutdown: shutdown_tx,
        });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let response = raw_request(port, "POST", "/api/shutdown").await;
        assert!(response.starts_with("HTTP/1.1 202"));
        shutdown_rx.recv().await.unwrap();
    }
}
