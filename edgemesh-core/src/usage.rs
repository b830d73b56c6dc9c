//! Usage accounting types
//!
//! One `UsageRecord` is produced per chunk delivered to (or received from) a
//! client. Records are ephemeral: they exist only until the next aggregation
//! flush picks them up.

use serde::{Deserialize, Serialize};

/// Which transport served a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    WebSocket,
    WebRtc,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Http => write!(f, "http"),
            TransportKind::WebSocket => write!(f, "ws"),
            TransportKind::WebRtc => write!(f, "webrtc"),
        }
    }
}

/// Transfer direction relative to the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Uploaded,
    Downloaded,
}

/// One accounting entry for bytes transferred for a specific client and
/// content item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub transport: TransportKind,
    pub client_ip: String,
    pub content_id: String,
    pub byte_count: u64,
    pub direction: Direction,
}

impl UsageRecord {
    pub fn uploaded(
        transport: TransportKind,
        client_ip: impl Into<String>,
        content_id: impl Into<String>,
        byte_count: u64,
    ) -> Self {
        Self {
            transport,
            client_ip: client_ip.into(),
            content_id: content_id.into(),
            byte_count,
            direction: Direction::Uploaded,
        }
    }
}

/// Strip the IPv4-mapped IPv6 prefix from a client address, so the same
/// client is accounted under one key whichever socket family it arrived on.
pub fn normalize_client_ip(ip: &str) -> String {
    ip.strip_prefix("::ffff:").unwrap_or(ip).to_string()
}
