//! WebSocket wire transport to the master
//!
//! Frames are JSON: the node opens with a `HandshakePayload` text frame and
//! expects the master's `MasterMetadata` back as the first frame. After the
//! handshake, inbound text frames decode as `WireEvent` and outbound reports
//! are sent as `ReportPayload`. A close frame, a read error, or the stream
//! ending all surface as a `Closed` event so the state machine sees exactly
//! one termination.

use async_trait::async_trait;
use edgemesh_core::{
    CloseCode, ClosedInfo, EdgeMeshError, HandshakePayload, HandshakeValidator, MasterMetadata,
    ReportPayload, Result, WireChannel, WireConnection, WireEvent, WireTransport,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WsWireTransport {
    connect_timeout: Duration,
}

impl WsWireTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl WireTransport for WsWireTransport {
    async fn open(
        &self,
        address: &str,
        payload: HandshakePayload,
        validator: HandshakeValidator,
    ) -> Result<WireConnection> {
        let connect = connect_async(address);
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                EdgeMeshError::Transport(format!(
                    "Connect to {address} timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| EdgeMeshError::Transport(format!("Connect to {address} failed: {e}")))?;

        let (mut sink, stream) = ws.split();

        let handshake_frame = serde_json::to_string(&payload)?;
        sink.send(Message::Text(handshake_frame))
            .await
            .map_err(|e| EdgeMeshError::HandshakeFailed(format!("Handshake send failed: {e}")))?;

        let sink = Arc::new(Mutex::new(sink));
        let (event_tx, event_rx) = mpsc::channel(256);
        let (handshake_tx, handshake_rx) = oneshot::channel();

        tokio::spawn(read_loop(
            stream,
            sink.clone(),
            validator,
            handshake_tx,
            event_tx,
        ));

        let channel = Box::new(WsWireChannel {
            sink,
            handshake: Mutex::new(Some(handshake_rx)),
            closed: AtomicBool::new(false),
        });
        Ok(WireConnection {
            channel,
            events: event_rx,
        })
    }
}

struct WsWireChannel {
    sink: Arc<Mutex<WsSink>>,
    handshake: Mutex<Option<oneshot::Receiver<Result<MasterMetadata>>>>,
    closed: AtomicBool,
}

#[async_trait]
impl WireChannel for WsWireChannel {
    async fn handshake_result(&self) -> Result<MasterMetadata> {
        let rx = self.handshake.lock().await.take().ok_or_else(|| {
            EdgeMeshError::HandshakeFailed("Handshake result already consumed".to_string())
        })?;
        rx.await.map_err(|_| {
            EdgeMeshError::HandshakeFailed("Channel closed during handshake".to_string())
        })?
    }

    async fn send(&self, report: ReportPayload) -> Result<()> {
        let frame = serde_json::to_string(&report)?;
        self.sink
            .lock()
            .await
            .send(Message::Text(frame))
            .await
            .map_err(|e| EdgeMeshError::Wire(format!("Send failed: {e}")))
    }

    async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let frame = CloseFrame {
            code: WsCloseCode::from(code.as_u16()),
            reason: reason.to_string().into(),
        };
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "Close frame send failed");
        }
        Ok(())
    }
}

async fn read_loop(
    mut stream: futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    sink: Arc<Mutex<WsSink>>,
    validator: HandshakeValidator,
    handshake_tx: oneshot::Sender<Result<MasterMetadata>>,
    event_tx: mpsc::Sender<WireEvent>,
) {
    // First frame must be the master's handshake.
    let mut handshake_tx = Some(handshake_tx);
    let mut validated = false;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) if !validated => {
                let remote: MasterMetadata = match serde_json::from_str(&text) {
                    Ok(remote) => remote,
                    Err(e) => {
                        settle(
                            &mut handshake_tx,
                            Err(EdgeMeshError::HandshakeFailed(format!(
                                "Unparseable master handshake: {e}"
                            ))),
                        );
                        break;
                    }
                };
                if !validator(&remote) {
                    let frame = CloseFrame {
                        code: WsCloseCode::from(CloseCode::PolicyViolation.as_u16()),
                        reason: "Handshake validation failed".into(),
                    };
                    let _ = sink.lock().await.send(Message::Close(Some(frame))).await;
                    settle(
                        &mut handshake_tx,
                        Err(EdgeMeshError::HandshakeFailed(
                            "Master failed handshake validation".to_string(),
                        )),
                    );
                    break;
                }
                validated = true;
                settle(&mut handshake_tx, Ok(remote));
            }
            Ok(Message::Text(text)) => match serde_json::from_str::<WireEvent>(&text) {
                Ok(event) => {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Dropping unparseable wire event"),
            },
            Ok(Message::Ping(payload)) => {
                let _ = sink.lock().await.send(Message::Pong(payload)).await;
            }
            Ok(Message::Close(frame)) => {
                let info = frame
                    .map(|frame| ClosedInfo {
                        code: frame.code.into(),
                        reason: frame.reason.to_string(),
                        was_clean: true,
                    })
                    .unwrap_or(ClosedInfo {
                        code: CloseCode::NormalClosure.as_u16(),
                        reason: String::new(),
                        was_clean: true,
                    });
                let _ = event_tx.send(WireEvent::Closed(info)).await;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Wire read failed");
                let _ = event_tx
                    .send(WireEvent::Closed(ClosedInfo {
                        code: CloseCode::AbnormalClosure.as_u16(),
                        reason: e.to_string(),
                        was_clean: false,
                    }))
                    .await;
                break;
            }
        }
    }
    // Dropping event_tx ends the consumer's stream if no Closed was sent.
}

fn settle(
    slot: &mut Option<oneshot::Sender<Result<MasterMetadata>>>,
    result: Result<MasterMetadata>,
) {
    if let Some(tx) = slot.take() {
        let _ = tx.send(result);
    }
}
