//! Router port-lease renewal
//!
//! Keeps the client-facing ports reachable from outside the local NAT by
//! re-registering each lease before it expires. Renewal happens 5 seconds
//! before the TTL runs out; a TTL too short to leave room for that margin
//! disables renewal entirely. Exposure is best-effort: a failed registration
//! is logged and the loop stops, but the node keeps serving.

use edgemesh_core::{PortMapper, PortProtocol, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Seconds before expiry at which leases are renewed
const RENEW_MARGIN_SECS: u64 = 5;

pub struct PortLeaseManager {
    mapper: Arc<dyn PortMapper>,
    leases: Vec<(PortProtocol, u16)>,
    ttl_secs: u64,
}

impl PortLeaseManager {
    pub fn new(
        mapper: Arc<dyn PortMapper>,
        leases: Vec<(PortProtocol, u16)>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            mapper,
            leases,
            ttl_secs,
        }
    }

    /// Register all leases once
    pub async fn register_all(&self) -> Result<()> {
        for (protocol, port) in &self.leases {
            self.mapper.map(*protocol, *port, self.ttl_secs).await?;
            debug!(protocol = %protocol, port, ttl_secs = self.ttl_secs, "Port lease registered");
        }
        Ok(())
    }

    /// Register and keep renewing until a registration fails or the task is
    /// dropped
    pub async fn run(self: Arc<Self>) {
        if self.leases.is_empty() {
            debug!("No ports to lease");
            return;
        }
        info!(
            ports = self.leases.len(),
            ttl_secs = self.ttl_secs,
            "Starting port-lease renewal"
        );
        loop {
            if let Err(e) = self.register_all().await {
                error!(error = %e, "Port-lease registration failed, giving up renewal");
                return;
            }
            match compute_refresh_delay(self.ttl_secs) {
                Some(delay_secs) => {
                    tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                }
                None => {
                    warn!(
                        ttl_secs = self.ttl_secs,
                        "Lease TTL leaves no room for renewal, leases will expire"
                    );
                    return;
                }
            }
        }
    }
}

/// Seconds until the next renewal, or `None` when the TTL is too short to
/// renew before expiry
pub fn compute_refresh_delay(ttl_secs: u64) -> Option<u64> {
    (ttl_secs > RENEW_MARGIN_SECS).then(|| ttl_secs - RENEW_MARGIN_SECS)
}
