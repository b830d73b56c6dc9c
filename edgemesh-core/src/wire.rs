//! Wire channel abstraction
//!
//! The node-to-master protocol codec (framing, encryption) is an external
//! collaborator. The node consumes it as an opaque bidirectional channel:
//! opening it performs the handshake exchange, and afterwards it surfaces
//! named remote events and accepts outbound report payloads.

use crate::content::ContentMetadata;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// WebSocket-style close code vocabulary used on the master link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum CloseCode {
    /// The connection successfully completed its purpose
    NormalClosure = 1000,
    /// Closed abnormally, with no close frame sent
    AbnormalClosure = 1006,
    /// The endpoint received a message that violates its policy
    PolicyViolation = 1008,
    /// The server is terminating the connection because it is restarting
    ServiceRestarting = 1012,
}

impl CloseCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(CloseCode::NormalClosure),
            1006 => Some(CloseCode::AbnormalClosure),
            1008 => Some(CloseCode::PolicyViolation),
            1012 => Some(CloseCode::ServiceRestarting),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// A backoff hint derived from the close code. Policy violations ask the
    /// node to stay away longer before retrying.
    pub fn suggested_backoff_secs(self) -> Option<u64> {
        match self {
            CloseCode::PolicyViolation => Some(60),
            _ => None,
        }
    }
}

/// Ports the node declares for inbound client connections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportPorts {
    pub http: Option<u16>,
    pub ws: Option<u16>,
    pub wss: Option<u16>,
    pub webrtc: Option<u16>,
}

/// Node metadata sent during the handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub node_id: String,
    pub version: String,
    pub wallet_address: Option<String>,
    pub domain: Option<String>,
    pub ports: TransportPorts,
}

/// Extra handshake fields present only in ledger-gated mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedHandshake {
    /// Random nonce the node signed
    pub nonce: String,
    /// Signature over the nonce, made with the node's wallet key
    pub nonce_signed: String,
    pub job_post_address: String,
    pub work_order_address: Option<String>,
}

/// Full outbound handshake payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub metadata: NodeMetadata,
    pub signed: Option<SignedHandshake>,
}

/// Remote handshake payload. In ledger-gated mode the signature must recover
/// to the expected employer address; in direct mode the fields are absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterMetadata {
    pub nonce: Option<String>,
    pub nonce_signed: Option<String>,
}

/// Validates the remote handshake payload before the channel is accepted
pub type HandshakeValidator = Arc<dyn Fn(&MasterMetadata) -> bool + Send + Sync>;

/// Close details reported by the channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedInfo {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

/// A ledger payment-handshake request, relayed through the master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRequest {
    /// "accept", "accepted", "release" or "released"
    pub kind: String,
    pub work_order_address: String,
    pub beneficiary: Option<String>,
    pub signed_request: String,
    #[serde(default)]
    pub extend_work_order: bool,
}

/// Named events the master may send over an open channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum WireEvent {
    /// A work order was offered or updated
    WorkOrder { address: String },
    /// Payment-handshake message from the master
    SignedRequest(SignedRequest),
    /// Drop the named content items; an empty list means drop everything
    Clear { content_ids: Vec<String> },
    /// Start carrying a content item
    Seed { metadata: ContentMetadata },
    /// Response to a prior node-initiated request
    Response { payload: serde_json::Value },
    /// Statistics snapshot request/acknowledgement
    Statistics { payload: serde_json::Value },
    /// Non-fatal remote warning
    Warning { message: String },
    /// The channel closed
    Closed(ClosedInfo),
    /// Transport-level failure
    Error { message: String },
}

/// Outbound report payloads the node sends to the master
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "report", content = "data", rename_all = "camelCase")]
pub enum ReportPayload {
    Uploaded {
        content_id: String,
        client_ip: String,
        byte_count: u64,
    },
    Downloaded {
        content_id: String,
        client_ip: String,
        byte_count: u64,
    },
    Storage(StorageStats),
    Bandwidth(BandwidthStats),
    SignedRequest(SignedRequest),
    /// Acknowledge a `Clear` event
    Cleared { content_ids: Vec<String> },
    /// Announce the content ids currently being delivered
    Seeding { content_ids: Vec<String> },
}

/// Storage usage reported to the master
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

/// Measured connection quality reported to the master
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BandwidthStats {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
}

/// An open channel plus the stream of remote events it produces
pub struct WireConnection {
    pub channel: Box<dyn WireChannel>,
    pub events: mpsc::Receiver<WireEvent>,
}

/// Opens wire channels to a master endpoint
#[async_trait]
pub trait WireTransport: Send + Sync {
    /// Open a channel and begin the handshake. The validator is invoked with
    /// the remote handshake payload before `handshake_result` resolves
    /// successfully.
    async fn open(
        &self,
        address: &str,
        payload: HandshakePayload,
        validator: HandshakeValidator,
    ) -> Result<WireConnection>;
}

/// One open bidirectional channel to the master
#[async_trait]
pub trait WireChannel: Send + Sync {
    /// Resolves once the remote handshake payload arrives and passes
    /// validation. Resolving with an error leaves the channel unusable.
    async fn handshake_result(&self) -> Result<MasterMetadata>;

    /// Send an outbound report. Fire-and-forget from the caller's view.
    async fn send(&self, report: ReportPayload) -> Result<()>;

    /// Send a close frame and tear the channel down. Idempotent.
    async fn close(&self, code: CloseCode, reason: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_round_trip() {
        for code in [1000u16, 1006, 1008, 1012] {
            assert_eq!(CloseCode::from_u16(code).unwrap().as_u16(), code);
        }
        assert!(CloseCode::from_u16(4000).is_none());
    }

    #[test]
    fn test_policy_violation_suggests_backoff() {
        assert_eq!(
            CloseCode::PolicyViolation.suggested_backoff_secs(),
            Some(60)
        );
        assert_eq!(CloseCode::AbnormalClosure.suggested_backoff_secs(), None);
    }

    #[test]
    fn test_wire_event_serialization() {
        let event = WireEvent::WorkOrder {
            address: "0xabc".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("workOrder"));

        let parsed: WireEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, WireEvent::WorkOrder { address } if address == "0xabc"));
    }
}
