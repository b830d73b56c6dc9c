//! In-process wire transport fake shared by the integration tests.

// Each test binary exercises a subset of the fake's surface.
#![allow(dead_code)]

use async_trait::async_trait;
use edgemesh_core::{
    CloseCode, EdgeMeshError, HandshakePayload, HandshakeValidator, MasterMetadata, NodeMetadata,
    ReportPayload, Result, TransportPorts, WireChannel, WireConnection, WireEvent, WireTransport,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Shared handle the test keeps to drive and inspect the fake link
#[derive(Default)]
pub struct FakeState {
    /// Reports the node sent over the channel
    pub sent: Mutex<Vec<ReportPayload>>,
    /// Close frames the node sent
    pub closes: Mutex<Vec<(u16, String)>>,
    /// Handshake payloads from each open attempt
    pub handshakes: Mutex<Vec<HandshakePayload>>,
    pub opens: AtomicUsize,
    /// Remote handshake payload handed to the validator
    pub remote: Mutex<MasterMetadata>,
    /// When set, the handshake parks until `gate` is notified
    pub gated: AtomicBool,
    pub gate: Notify,
    /// When set, the handshake resolves with an error
    pub reject: AtomicBool,
}

pub struct FakeWire {
    state: Arc<FakeState>,
    /// Sender side of the event stream handed to each new connection
    pub event_txs: Mutex<Vec<mpsc::Sender<WireEvent>>>,
}

impl FakeWire {
    pub fn new() -> (Arc<Self>, Arc<FakeState>) {
        let state = Arc::new(FakeState::default());
        (
            Arc::new(Self {
                state: state.clone(),
                event_txs: Mutex::new(Vec::new()),
            }),
            state,
        )
    }

    /// Event sender for the most recent connection
    pub fn events(&self) -> mpsc::Sender<WireEvent> {
        self.event_txs
            .lock()
            .last()
            .cloned()
            .expect("no connection opened")
    }
}

struct FakeChannel {
    state: Arc<FakeState>,
    validator: HandshakeValidator,
}

#[async_trait]
impl WireTransport for FakeWire {
    async fn open(
        &self,
        _address: &str,
        payload: HandshakePayload,
        validator: HandshakeValidator,
    ) -> Result<WireConnection> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        self.state.handshakes.lock().push(payload);
        let (tx, rx) = mpsc::channel(64);
        self.event_txs.lock().push(tx);
        Ok(WireConnection {
            channel: Box::new(FakeChannel {
                state: self.state.clone(),
                validator,
            }),
            events: rx,
        })
    }
}

#[async_trait]
impl WireChannel for FakeChannel {
    async fn handshake_result(&self) -> Result<MasterMetadata> {
        if self.state.gated.load(Ordering::SeqCst) {
            self.state.gate.notified().await;
        }
        if self.state.reject.load(Ordering::SeqCst) {
            return Err(EdgeMeshError::HandshakeFailed(
                "Master failed handshake validation".to_string(),
            ));
        }
        let remote = self.state.remote.lock().clone();
        if !(self.validator)(&remote) {
            return Err(EdgeMeshError::HandshakeFailed(
                "Remote handshake rejected".to_string(),
            ));
        }
        Ok(remote)
    }

    async fn send(&self, report: ReportPayload) -> Result<()> {
        self.state.sent.lock().push(report);
        Ok(())
    }

    async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        self.state
            .closes
            .lock()
            .push((code.as_u16(), reason.to_string()));
        Ok(())
    }
}

pub fn metadata() -> NodeMetadata {
    NodeMetadata {
        node_id: "node-test".to_string(),
        version: "0.1.0".to_string(),
        wallet_address: None,
        domain: None,
        ports: TransportPorts {
            http: Some(6767),
            ws: Some(7676),
            wss: None,
            webrtc: Some(8048),
        },
    }
}
