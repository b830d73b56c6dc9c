//! Configuration management for the EdgeMesh node
//!
//! Supports loading from TOML files and environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity configuration
    #[serde(default)]
    pub node: NodeIdentity,

    /// Master connection configuration
    #[serde(default)]
    pub master: MasterSettings,

    /// Ledger (job search / handshake signing) configuration
    #[serde(default)]
    pub ledger: LedgerSettings,

    /// Client-facing transport listeners
    #[serde(default)]
    pub transports: TransportSettings,

    /// Content storage configuration
    #[serde(default)]
    pub storage: StorageSettings,

    /// Router port-lease configuration
    #[serde(default)]
    pub port_lease: PortLeaseSettings,

    /// Local controller HTTP API
    #[serde(default)]
    pub controller: ControllerSettings,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeIdentity::default(),
            master: MasterSettings::default(),
            ledger: LedgerSettings::default(),
            transports: TransportSettings::default(),
            storage: StorageSettings::default(),
            port_lease: PortLeaseSettings::default(),
            controller: ControllerSettings::default(),
            metrics: MetricsSettings::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ledger.enabled && self.master.address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "master.address is required when ledger job search is disabled".to_string(),
            ));
        }

        if self.transports.http.enabled && self.transports.http.port == 0 {
            return Err(ConfigError::ValidationError(
                "HTTP transport port cannot be 0".to_string(),
            ));
        }
        if self.transports.ws.enabled && self.transports.ws.port == 0 {
            return Err(ConfigError::ValidationError(
                "WebSocket transport port cannot be 0".to_string(),
            ));
        }
        if self.transports.webrtc.enabled
            && (self.transports.webrtc.control_port == 0 || self.transports.webrtc.data_port == 0)
        {
            return Err(ConfigError::ValidationError(
                "WebRTC transport ports cannot be 0".to_string(),
            ));
        }

        if self.transports.ws.tls_enabled && !self.transports.ws.tls_paths_exist() {
            return Err(ConfigError::ValidationError(
                "WebSocket TLS is enabled but certificate or key path is missing".to_string(),
            ));
        }

        if !self.state_dir().exists() {
            std::fs::create_dir_all(self.state_dir()).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "Cannot create state directory {:?}: {}",
                    self.state_dir(),
                    e
                ))
            })?;
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(
        mut self,
        master_address: Option<String>,
        http_port: Option<u16>,
    ) -> Self {
        if let Some(addr) = master_address {
            self.master.address = addr;
        }
        if let Some(p) = http_port {
            self.transports.http.port = p;
        }
        self
    }

    /// Apply environment variable overrides to all settings
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var("EDGEMESH_MASTER_ADDR") {
            self.master.address = addr;
        }
        if let Ok(id) = std::env::var("EDGEMESH_NODE_ID") {
            self.node.id = id;
        }
        if let Ok(domain) = std::env::var("EDGEMESH_DOMAIN") {
            self.node.domain = Some(domain);
        }
        if let Ok(port) = std::env::var("EDGEMESH_HTTP_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                self.transports.http.port = p;
            }
        }
        if let Ok(port) = std::env::var("EDGEMESH_WS_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                self.transports.ws.port = p;
            }
        }
        if let Ok(url) = std::env::var("EDGEMESH_LEDGER_URL") {
            self.ledger.provider_url = url;
        }
        self
    }

    /// Directory holding persistent node state (`state.json`)
    pub fn state_dir(&self) -> PathBuf {
        self.storage
            .state_dir
            .clone()
            .unwrap_or_else(default_state_dir)
    }

    /// Path of the persistent state file
    pub fn state_path(&self) -> PathBuf {
        self.state_dir().join("state.json")
    }
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique node identifier (auto-generated if not provided)
    #[serde(default = "generate_node_id")]
    pub id: String,

    /// Human-readable node name
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Public domain name, if the node is reachable by hostname
    #[serde(default)]
    pub domain: Option<String>,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            id: generate_node_id(),
            name: default_node_name(),
            domain: None,
        }
    }
}

fn generate_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_node_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "edgemesh-node".to_string())
}

/// Master connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterSettings {
    /// Master WebSocket address (ignored when ledger job search is enabled)
    #[serde(default)]
    pub address: String,

    /// Automatically reconnect after remote disconnects
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            address: String::new(),
            auto_reconnect: true,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

/// Ledger configuration for job search and handshake signing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// Enable ledger-gated mode (discover masters via on-chain job posts)
    #[serde(default)]
    pub enabled: bool,

    /// Ledger RPC provider URL
    #[serde(default = "default_provider_url")]
    pub provider_url: String,

    /// Allowed master hosts; empty or containing "*" accepts any host
    #[serde(default)]
    pub allowed_masters: Vec<String>,

    /// Job search timeout in seconds
    #[serde(default = "default_job_search_timeout")]
    pub search_timeout_secs: u64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            provider_url: default_provider_url(),
            allowed_masters: Vec::new(),
            search_timeout_secs: default_job_search_timeout(),
        }
    }
}

fn default_provider_url() -> String {
    "http://localhost:8545".to_string()
}

fn default_job_search_timeout() -> u64 {
    300
}

/// Client-facing transport listeners
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransportSettings {
    #[serde(default)]
    pub http: HttpTransportSettings,
    #[serde(default)]
    pub ws: WsTransportSettings,
    #[serde(default)]
    pub webrtc: WebRtcTransportSettings,
}

/// Plain HTTP content listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTransportSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpTransportSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_ip: default_bind_ip(),
            port: default_http_port(),
        }
    }
}

/// WebSocket content listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsTransportSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_ws_port")]
    pub port: u16,

    /// Serve wss:// (requires cert and key paths)
    #[serde(default)]
    pub tls_enabled: bool,

    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

impl Default for WsTransportSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_ip: default_bind_ip(),
            port: default_ws_port(),
            tls_enabled: false,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl WsTransportSettings {
    pub fn tls_paths_exist(&self) -> bool {
        matches!((&self.tls_cert, &self.tls_key), (Some(cert), Some(key)) if cert.exists() && key.exists())
    }
}

/// WebRTC-style content listener: TCP control channel plus UDP data channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcTransportSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_webrtc_control_port")]
    pub control_port: u16,

    #[serde(default = "default_webrtc_data_port")]
    pub data_port: u16,
}

impl Default for WebRtcTransportSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_ip: default_bind_ip(),
            control_port: default_webrtc_control_port(),
            data_port: default_webrtc_data_port(),
        }
    }
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    6767
}

fn default_ws_port() -> u16 {
    7676
}

fn default_webrtc_control_port() -> u16 {
    8048
}

fn default_webrtc_data_port() -> u16 {
    8058
}

/// Content storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory for persistent node state (defaults to ~/.edgemesh)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Advertised storage capacity in bytes (0 = unlimited)
    #[serde(default)]
    pub capacity_bytes: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            state_dir: None,
            capacity_bytes: 0,
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".edgemesh")
}

/// Router port-lease (NAT traversal) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortLeaseSettings {
    /// Enable periodic port-lease renewal against the local router
    #[serde(default)]
    pub enabled: bool,

    /// Lease lifetime in seconds
    #[serde(default = "default_lease_ttl")]
    pub ttl_secs: u64,
}

impl Default for PortLeaseSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_lease_ttl(),
        }
    }
}

fn default_lease_ttl() -> u64 {
    7200
}

/// Local controller HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_controller_ip")]
    pub bind_ip: String,

    #[serde(default = "default_controller_port")]
    pub port: u16,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_ip: default_controller_ip(),
            port: default_controller_port(),
        }
    }
}

fn default_controller_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_controller_port() -> u16 {
    9000
}

/// Metrics and monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Enable Prometheus metrics endpoint
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics HTTP server port
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Health check endpoint path
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Metrics endpoint path
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
            health_path: "/health".to_string(),
            metrics_path: "/metrics".to_string(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_true() -> bool {
    true
}
