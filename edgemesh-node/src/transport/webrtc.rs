//! WebRTC-style content listener
//!
//! A lightweight stand-in for a browser data channel: clients first hit a
//! TCP control port to learn the data port and receive a channel id, then
//! exchange piece requests and responses as single datagrams on the UDP data
//! port. Responses must fit one datagram, so requests are expected to carry
//! an explicit `length`; oversized slices get a 400 instead of a truncated
//! frame.

use super::{serve_piece, ClientRequest, ContentResponse, ListenerLifecycle, TransportEvent, UsageSink};
use crate::config::WebRtcTransportSettings;
use edgemesh_core::{
    normalize_client_ip, ContentStore, EdgeMeshError, Result, TransportKind, UsageRecord,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Largest response payload we are willing to put in one datagram
pub const MAX_DATAGRAM_PAYLOAD: usize = 60 * 1024;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelGreeting<'a> {
    channel_id: &'a str,
    data_port: u16,
}

pub struct WebRtcListener {
    settings: WebRtcTransportSettings,
    store: Arc<dyn ContentStore>,
    sink: UsageSink,
    lifecycle: ListenerLifecycle,
    data_port: parking_lot::Mutex<Option<u16>>,
}

impl WebRtcListener {
    pub fn new(
        settings: WebRtcTransportSettings,
        store: Arc<dyn ContentStore>,
        sink: UsageSink,
        events: broadcast::Sender<TransportEvent>,
    ) -> Self {
        Self {
            settings,
            store,
            sink,
            lifecycle: ListenerLifecycle::new(TransportKind::WebRtc, events),
            data_port: parking_lot::Mutex::new(None),
        }
    }

    pub async fn listen(&self) -> Result<()> {
        self.lifecycle.begin_starting()?;

        let control_addr = format!("{}:{}", self.settings.bind_ip, self.settings.control_port);
        let control = match TcpListener::bind(&control_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.lifecycle.abort_starting();
                return Err(EdgeMeshError::BindFailed {
                    addr: control_addr,
                    source: e,
                });
            }
        };
        let control_local = control.local_addr()?;

        let data_addr = format!("{}:{}", self.settings.bind_ip, self.settings.data_port);
        let data = match UdpSocket::bind(&data_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                self.lifecycle.abort_starting();
                return Err(EdgeMeshError::BindFailed {
                    addr: data_addr,
                    source: e,
                });
            }
        };
        let data_port = data.local_addr()?.port();
        *self.data_port.lock() = Some(data_port);

        let control_task = tokio::spawn(control_loop(control, data_port));
        let data_task = tokio::spawn(data_loop(data, self.store.clone(), self.sink.clone()));

        self.lifecycle
            .mark_listening(control_local, vec![control_task, data_task]);
        Ok(())
    }

    pub async fn close(&self) -> bool {
        let closed = self.lifecycle.close().await;
        if closed {
            *self.data_port.lock() = None;
        }
        closed
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.lifecycle.local_addr().map(|addr| addr.port())
    }

    pub fn bound_data_port(&self) -> Option<u16> {
        *self.data_port.lock()
    }
}

/// Answer control connections with the channel greeting, then hold the
/// socket open until the client goes away
async fn control_loop(control: TcpListener, data_port: u16) {
    loop {
        let (stream, peer) = match control.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "WebRTC control accept failed");
                continue;
            }
        };
        crate::metrics::record_channel_opened();
        tokio::spawn(async move {
            let channel_id = uuid::Uuid::new_v4().to_string();
            debug!(%peer, channel_id = %channel_id, "WebRTC control channel opened");
            let (read_half, mut write_half) = stream.into_split();

            let greeting = ChannelGreeting {
                channel_id: &channel_id,
                data_port,
            };
            let mut line = match serde_json::to_string(&greeting) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to encode channel greeting");
                    return;
                }
            };
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                return;
            }

            // Drain keepalive lines until EOF.
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(_)) = lines.next_line().await {}
            debug!(%peer, channel_id = %channel_id, "WebRTC control channel closed");
        });
    }
}

/// Serve piece requests arriving as single datagrams
async fn data_loop(socket: UdpSocket, store: Arc<dyn ContentStore>, sink: UsageSink) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "WebRTC data receive failed");
                continue;
            }
        };

        let request: ClientRequest = match serde_json::from_slice(&buf[..len]) {
            Ok(request) => request,
            Err(e) => {
                debug!(%peer, error = %e, "Unparseable datagram request");
                ClientRequest::default()
            }
        };

        let (response, byte_count) = serve_piece(store.as_ref(), &request).await;
        // A dropped frame means the store failed; send nothing.
        let Some(response) = response else { continue };
        let response = if byte_count as usize > MAX_DATAGRAM_PAYLOAD {
            ContentResponse::bad_request("Requested slice exceeds the datagram payload limit")
        } else {
            if byte_count > 0 {
                sink.record(UsageRecord::uploaded(
                    TransportKind::WebRtc,
                    normalize_client_ip(&peer.ip().to_string()),
                    request.content_id.clone().unwrap_or_default(),
                    byte_count,
                ));
            }
            response
        };

        match response.encode() {
            Ok(frame) => {
                if let Err(e) = socket.send_to(&frame, peer).await {
                    debug!(%peer, error = %e, "Failed to send datagram response");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode datagram response"),
        }
    }
}
