//! Client-facing content transports
//!
//! Three listener families deliver content pieces to clients: plain HTTP
//! range requests, WebSocket request/response frames, and a WebRTC-style
//! pair of control (TCP) and data (UDP) channels. All three resolve content
//! through the shared [`ContentStore`] and feed per-chunk usage records into
//! the shared [`UsageAggregator`].

use crate::config::TransportSettings;
use crate::usage::UsageAggregator;
use edgemesh_core::{
    ContentStore, EdgeMeshError, Result, TransportKind, TransportPorts, UsageRecord,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod http;
pub mod webrtc;
pub mod ws;

pub use http::HttpListener;
pub use webrtc::WebRtcListener;
pub use ws::WsListener;

/// Chunk size used when streaming HTTP responses
pub const STREAM_CHUNK_BYTES: u64 = 64 * 1024;

/// A client's request for a slice of a content piece.
///
/// Fields are optional at the serde level so malformed requests surface as a
/// 400 response instead of a parse failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    pub content_id: Option<String>,
    pub index: Option<u32>,
    pub offset: Option<u64>,
    /// Bytes to read; absent or zero reads to the end of the piece
    #[serde(default)]
    pub length: Option<u64>,
}

impl ClientRequest {
    /// Check required fields, returning the description of the first one
    /// missing
    pub fn validate(&self) -> std::result::Result<(&str, u32, u64), &'static str> {
        let content_id = match self.content_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => return Err("contentId is required"),
        };
        let index = self.index.ok_or("index is required")?;
        let offset = self.offset.ok_or("offset is required")?;
        Ok((content_id, index, offset))
    }
}

/// Payload carried on a successful content response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseData {
    pub content_id: String,
    pub index: u32,
    pub offset: u64,
    pub buffer: Vec<u8>,
}

/// Binary response frame shared by the WS and WebRTC transports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentResponse {
    pub status: u16,
    pub error: Option<String>,
    pub data: Option<ResponseData>,
}

impl ContentResponse {
    pub fn ok(data: ResponseData) -> Self {
        Self {
            status: 200,
            error: None,
            data: Some(data),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            error: Some(message.into()),
            data: None,
        }
    }

    pub fn not_found(content_id: &str) -> Self {
        Self {
            status: 404,
            error: Some(format!("Content {content_id} not found")),
            data: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Resolve a piece request against the store.
///
/// Returns the response frame plus the number of payload bytes, which the
/// caller turns into a usage record on success. A store read failure yields
/// no frame at all: the caller logs and sends nothing rather than risk a
/// partial response.
pub async fn serve_piece(
    store: &dyn ContentStore,
    request: &ClientRequest,
) -> (Option<ContentResponse>, u64) {
    let (content_id, index, offset) = match request.validate() {
        Ok(parts) => parts,
        Err(reason) => return (Some(ContentResponse::bad_request(reason)), 0),
    };

    let handle = match store.get(content_id).await {
        Some(handle) => handle,
        None => return (Some(ContentResponse::not_found(content_id)), 0),
    };

    match handle.read_piece(index, offset, request.length.unwrap_or(0)).await {
        Ok(buffer) => {
            let byte_count = buffer.len() as u64;
            let response = ContentResponse::ok(ResponseData {
                content_id: content_id.to_string(),
                index,
                offset,
                buffer: buffer.to_vec(),
            });
            (Some(response), byte_count)
        }
        Err(EdgeMeshError::PieceOutOfBounds { .. }) | Err(EdgeMeshError::InvalidRange { .. }) => (
            Some(ContentResponse::bad_request("Requested range is out of bounds")),
            0,
        ),
        Err(e) => {
            warn!(content_id = %content_id, error = %e, "Piece read failed, dropping response");
            (None, 0)
        }
    }
}

/// Address details announced when a listener comes up
#[derive(Debug, Clone)]
pub struct ListeningInfo {
    pub transport: TransportKind,
    pub addr: SocketAddr,
}

/// Events fanned out by [`TransportSet`]
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Listening(ListeningInfo),
    Closed { transport: TransportKind },
    ResourceSent(UsageRecord),
    Error { transport: TransportKind, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Listening,
}

/// Shared listen/close lifecycle used by every listener.
///
/// `close` called while a concurrent `listen` is still binding waits for the
/// listener to come up first, so the socket is never leaked.
pub(crate) struct ListenerLifecycle {
    transport: TransportKind,
    phase: watch::Sender<Phase>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
    events: broadcast::Sender<TransportEvent>,
}

impl ListenerLifecycle {
    pub(crate) fn new(transport: TransportKind, events: broadcast::Sender<TransportEvent>) -> Self {
        Self {
            transport,
            phase: watch::Sender::new(Phase::Idle),
            tasks: parking_lot::Mutex::new(Vec::new()),
            local_addr: parking_lot::Mutex::new(None),
            events,
        }
    }

    /// Claim the `Starting` phase, failing closed if a listen is already in
    /// flight or the listener is already up
    pub(crate) fn begin_starting(&self) -> Result<()> {
        let mut claimed = false;
        self.phase.send_if_modified(|phase| {
            if *phase == Phase::Idle {
                *phase = Phase::Starting;
                claimed = true;
                true
            } else {
                false
            }
        });
        if claimed {
            Ok(())
        } else {
            Err(EdgeMeshError::Transport(format!(
                "{} listener is already running",
                self.transport
            )))
        }
    }

    /// Roll back to `Idle` after a failed bind
    pub(crate) fn abort_starting(&self) {
        self.phase.send_replace(Phase::Idle);
    }

    pub(crate) fn mark_listening(&self, addr: SocketAddr, tasks: Vec<JoinHandle<()>>) {
        *self.local_addr.lock() = Some(addr);
        *self.tasks.lock() = tasks;
        self.phase.send_replace(Phase::Listening);
        info!(transport = %self.transport, %addr, "Listener started");
        let _ = self.events.send(TransportEvent::Listening(ListeningInfo {
            transport: self.transport,
            addr,
        }));
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Tear the listener down. Returns `false` if there was nothing to close.
    pub(crate) async fn close(&self) -> bool {
        let mut rx = self.phase.subscribe();
        loop {
            let phase = *rx.borrow_and_update();
            match phase {
                Phase::Idle => return false,
                Phase::Starting => {
                    // A bind is in flight; wait for it to settle.
                    if rx.changed().await.is_err() {
                        return false;
                    }
                }
                Phase::Listening => break,
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.local_addr.lock() = None;
        self.phase.send_replace(Phase::Idle);
        debug!(transport = %self.transport, "Listener closed");
        let _ = self.events.send(TransportEvent::Closed {
            transport: self.transport,
        });
        true
    }
}

/// Sink the listeners push per-chunk usage records into
#[derive(Clone)]
pub struct UsageSink {
    aggregator: Arc<UsageAggregator>,
    events: broadcast::Sender<TransportEvent>,
}

impl UsageSink {
    pub fn new(
        aggregator: Arc<UsageAggregator>,
        events: broadcast::Sender<TransportEvent>,
    ) -> Self {
        Self { aggregator, events }
    }

    pub fn record(&self, record: UsageRecord) {
        crate::metrics::record_bytes_served(record.transport, record.byte_count);
        let _ = self.events.send(TransportEvent::ResourceSent(record.clone()));
        self.aggregator.record(record);
    }
}

/// The set of enabled listeners plus their shared event bus
pub struct TransportSet {
    http: Option<Arc<HttpListener>>,
    ws: Option<Arc<WsListener>>,
    webrtc: Option<Arc<WebRtcListener>>,
    events: broadcast::Sender<TransportEvent>,
    settings: TransportSettings,
}

impl TransportSet {
    pub fn new(
        settings: &TransportSettings,
        store: Arc<dyn ContentStore>,
        aggregator: Arc<UsageAggregator>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let sink = UsageSink::new(aggregator, events.clone());

        let http = settings.http.enabled.then(|| {
            Arc::new(HttpListener::new(
                settings.http.clone(),
                store.clone(),
                sink.clone(),
                events.clone(),
            ))
        });
        let ws = settings.ws.enabled.then(|| {
            Arc::new(WsListener::new(
                settings.ws.clone(),
                store.clone(),
                sink.clone(),
                events.clone(),
            ))
        });
        let webrtc = settings.webrtc.enabled.then(|| {
            Arc::new(WebRtcListener::new(
                settings.webrtc.clone(),
                store,
                sink,
                events.clone(),
            ))
        });

        Self {
            http,
            ws,
            webrtc,
            events,
            settings: settings.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Start every enabled listener. A bind failure tears down the ones
    /// already started and propagates.
    pub async fn listen_all(&self) -> Result<()> {
        if let Some(http) = &self.http {
            if let Err(e) = http.listen().await {
                self.close_all().await;
                return Err(e);
            }
        }
        if let Some(ws) = &self.ws {
            if let Err(e) = ws.listen().await {
                self.close_all().await;
                return Err(e);
            }
        }
        if let Some(webrtc) = &self.webrtc {
            if let Err(e) = webrtc.listen().await {
                self.close_all().await;
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        if let Some(http) = &self.http {
            http.close().await;
        }
        if let Some(ws) = &self.ws {
            ws.close().await;
        }
        if let Some(webrtc) = &self.webrtc {
            webrtc.close().await;
        }
    }

    pub fn http(&self) -> Option<&Arc<HttpListener>> {
        self.http.as_ref()
    }

    pub fn ws(&self) -> Option<&Arc<WsListener>> {
        self.ws.as_ref()
    }

    pub fn webrtc(&self) -> Option<&Arc<WebRtcListener>> {
        self.webrtc.as_ref()
    }

    /// Ports advertised to the master during the handshake. Bound ports win
    /// over configured ones so an OS-assigned port 0 is reported correctly.
    pub fn declared_ports(&self) -> TransportPorts {
        let bound = |lifecycle_port: Option<u16>, configured: u16| {
            Some(lifecycle_port.unwrap_or(configured))
        };
        TransportPorts {
            http: self
                .http
                .as_ref()
                .and_then(|l| bound(l.bound_port(), self.settings.http.port)),
            ws: self.ws.as_ref().and_then(|l| {
                if self.settings.ws.tls_enabled {
                    None
                } else {
                    bound(l.bound_port(), self.settings.ws.port)
                }
            }),
            wss: self.ws.as_ref().and_then(|l| {
                if self.settings.ws.tls_enabled {
                    bound(l.bound_port(), self.settings.ws.port)
                } else {
                    None
                }
            }),
            webrtc: self
                .webrtc
                .as_ref()
                .and_then(|l| bound(l.bound_port(), self.settings.webrtc.control_port)),
        }
    }

    /// Ports to expose through the router port lease
    pub fn lease_ports(&self) -> Vec<(edgemesh_core::PortProtocol, u16)> {
        use edgemesh_core::PortProtocol;
        let mut ports = Vec::new();
        if self.http.is_some() {
            ports.push((PortProtocol::Tcp, self.settings.http.port));
        }
        if self.ws.is_some() {
            ports.push((PortProtocol::Tcp, self.settings.ws.port));
        }
        if self.webrtc.is_some() {
            ports.push((PortProtocol::Tcp, self.settings.webrtc.control_port));
            ports.push((PortProtocol::Udp, self.settings.webrtc.data_port));
        }
        ports
    }
}
