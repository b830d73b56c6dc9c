//! External port-exposure collaborator
//!
//! The actual mapping protocol (NAT-PMP, UPnP) lives outside this crate; the
//! node only needs to request a lease and renew it before the TTL expires.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortProtocol::Tcp => write!(f, "tcp"),
            PortProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// Registers an external port mapping with a gateway device
#[cfg_attr(feature = "mocks", mockall::automock)]
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// Map `port` (same internal and external) for `ttl_secs` seconds
    async fn map(&self, protocol: PortProtocol, port: u16, ttl_secs: u64) -> Result<()>;
}
