//! Prometheus metrics for the EdgeMesh node
//!
//! Exposes delivery throughput, master-link health, and listener state.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use edgemesh_core::TransportKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Metric names as constants
pub mod names {
    // Delivery metrics
    pub const BYTES_SERVED: &str = "edgemesh_bytes_served_total";
    pub const USAGE_RECORDS: &str = "edgemesh_usage_records_total";
    pub const USAGE_FLUSHES: &str = "edgemesh_usage_flushes_total";

    // Master link metrics
    pub const MASTER_CONNECTED: &str = "edgemesh_master_connected";
    pub const MASTER_RECONNECTS: &str = "edgemesh_master_reconnects_total";
    pub const REPORTS_SENT: &str = "edgemesh_reports_sent_total";
    pub const REPORTS_DROPPED: &str = "edgemesh_reports_dropped_total";

    // Transport metrics
    pub const WEBRTC_CHANNELS: &str = "edgemesh_webrtc_channels_total";

    // Health metrics
    pub const NODE_UP: &str = "edgemesh_node_up";
    pub const NODE_START_TIME: &str = "edgemesh_node_start_time_seconds";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    describe_counter!(
        names::BYTES_SERVED,
        "Total content bytes served to clients, by transport"
    );
    describe_counter!(
        names::USAGE_RECORDS,
        "Raw usage records produced by the transports"
    );
    describe_counter!(
        names::USAGE_FLUSHES,
        "Aggregation flush cycles that produced at least one entry"
    );

    describe_gauge!(
        names::MASTER_CONNECTED,
        "Whether the master link is up (1) or down (0)"
    );
    describe_counter!(
        names::MASTER_RECONNECTS,
        "Reconnection attempts against the master"
    );
    describe_counter!(names::REPORTS_SENT, "Reports delivered to the master");
    describe_counter!(
        names::REPORTS_DROPPED,
        "Reports dropped because the master link was down"
    );

    describe_counter!(
        names::WEBRTC_CHANNELS,
        "Control channels opened by WebRTC clients"
    );

    describe_gauge!(names::NODE_UP, "Whether the node is up (1) or down (0)");
    describe_gauge!(
        names::NODE_START_TIME,
        "Unix timestamp when the node started"
    );
}

pub fn record_bytes_served(transport: TransportKind, byte_count: u64) {
    let labels = [("transport", transport.to_string())];
    counter!(names::BYTES_SERVED, &labels).increment(byte_count);
    counter!(names::USAGE_RECORDS, &labels).increment(1);
}

pub fn record_usage_flush() {
    counter!(names::USAGE_FLUSHES).increment(1);
}

pub fn set_master_connected(connected: bool) {
    gauge!(names::MASTER_CONNECTED).set(if connected { 1.0 } else { 0.0 });
}

pub fn record_master_reconnect() {
    counter!(names::MASTER_RECONNECTS).increment(1);
}

pub fn record_report_sent() {
    counter!(names::REPORTS_SENT).increment(1);
}

pub fn record_report_dropped() {
    counter!(names::REPORTS_DROPPED).increment(1);
}

pub fn record_channel_opened() {
    counter!(names::WEBRTC_CHANNELS).increment(1);
}

pub fn mark_node_up() {
    gauge!(names::NODE_UP).set(1.0);
    gauge!(names::NODE_START_TIME).set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0),
    );
}

pub fn mark_node_down() {
    gauge!(names::NODE_UP).set(0.0);
}

/// HTTP server for metrics endpoint
pub struct MetricsServer {
    handle: PrometheusHandle,
    addr: SocketAddr,
}

impl MetricsServer {
    /// Create a new metrics server
    pub fn new(port: u16) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

        let builder = PrometheusBuilder::new();
        let handle = builder.install_recorder()?;

        Ok(Self { handle, addr })
    }

    /// Start the metrics HTTP server
    pub async fn start(
        self,
        health_path: String,
        metrics_path: String,
        health_state: Arc<RwLock<HealthState>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};

        let handle = self.handle;

        let health_handler = {
            let state = health_state.clone();
            move || {
                let state = state.clone();
                async move {
                    let health = state.read().await;
                    if health.is_healthy {
                        (StatusCode::OK, "OK").into_response()
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "UNHEALTHY").into_response()
                    }
                }
            }
        };

        let metrics_handler = move || {
            let handle = handle.clone();
            async move { handle.render() }
        };

        let app = Router::new()
            .route(&health_path, get(health_handler))
            .route(&metrics_path, get(metrics_handler));

        info!(addr = %self.addr, "Starting metrics server");

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health state for the node
#[derive(Debug, Clone)]
pub struct HealthState {
    pub is_healthy: bool,
    pub transports_ok: bool,
    pub master_ok: bool,
    pub last_check: std::time::Instant,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            is_healthy: true,
            transports_ok: true,
            master_ok: true,
            last_check: std::time::Instant::now(),
        }
    }
}

impl HealthState {
    /// Update health state. The master link being down marks the node
    /// unhealthy only together with broken transports, since a node can
    /// legitimately ride out master restarts.
    pub fn update(&mut self, transports_ok: bool, master_ok: bool) {
        self.transports_ok = transports_ok;
        self.master_ok = master_ok;
        self.is_healthy = transports_ok;
        self.last_check = std::time::Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state() {
        let mut state = HealthState::default();
        assert!(state.is_healthy);

        state.update(false, true);
        assert!(!state.is_healthy);

        state.update(true, false);
        assert!(state.is_healthy);
        assert!(!state.master_ok);
    }
}
