//! EdgeMesh Node Library
//!
//! Provides components for running a content-delivery edge node:
//! - Configuration management
//! - The master connection state machine and WebSocket wire transport
//! - Client-facing transports (HTTP, WebSocket, WebRTC-style)
//! - Usage aggregation and reporting
//! - Ledger job search and router port leasing
//! - Prometheus metrics and the local controller API

pub mod agent;
pub mod config;
pub mod controller;
pub mod jobs;
pub mod master;
pub mod metrics;
pub mod portmap;
pub mod state;
pub mod transport;
pub mod usage;
pub mod wire_ws;

pub use agent::NodeAgent;
pub use config::{
    ConfigError, ControllerSettings, HttpTransportSettings, LedgerSettings, MasterSettings,
    MetricsSettings, NodeConfig, NodeIdentity, PortLeaseSettings, StorageSettings,
    TransportSettings, WebRtcTransportSettings, WsTransportSettings,
};
pub use controller::ControllerServer;
pub use jobs::{JobSearchConfig, JobSearchSession};
pub use master::{ConnectionState, MasterConnection, MasterEvent};
pub use metrics::{init_metrics, HealthState, MetricsServer};
pub use portmap::PortLeaseManager;
pub use state::{PersistedState, StateStore, UsageTotals};
pub use transport::{ClientRequest, ContentResponse, TransportEvent, TransportSet};
pub use usage::{AggregatedUsage, UsageAggregator};
pub use wire_ws::WsWireTransport;

/// Version string reported during the master handshake
pub const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");
