//! EdgeMesh Core Library
//!
//! Core abstractions for the EdgeMesh content-delivery edge node.
//! This crate provides:
//! - The unified error type
//! - Collaborator interfaces: content store, wire channel, ledger client,
//!   port mapper
//! - Usage accounting types shared between the transport layer and the
//!   master connection

pub mod content;
pub mod error;
pub mod ledger;
pub mod port;
pub mod usage;
pub mod wire;

pub use content::{ContentHandle, ContentMetadata, ContentStore, MemoryContentStore};
pub use error::{EdgeMeshError, Result};
pub use ledger::{
    Assignment, AssignmentEvent, AssignmentWatcher, BlockPosition, EmployerInfo, JobDescriptor,
    LedgerClient,
};
#[cfg(feature = "mocks")]
pub use ledger::{MockAssignmentWatcher, MockLedgerClient};
#[cfg(feature = "mocks")]
pub use port::MockPortMapper;
pub use port::{PortMapper, PortProtocol};
pub use usage::{normalize_client_ip, Direction, TransportKind, UsageRecord};
pub use wire::{
    BandwidthStats, CloseCode, ClosedInfo, HandshakePayload, HandshakeValidator, MasterMetadata,
    NodeMetadata, ReportPayload, SignedHandshake, SignedRequest, StorageStats, TransportPorts,
    WireChannel, WireConnection, WireEvent, WireTransport,
};

/// Fixed lookback window (in blocks) when opening a fresh job-search
/// subscription without a checkpoint.
pub const JOB_SEARCH_LOOKBACK_BLOCKS: u64 = 1000;

/// Aggregation flush interval for usage records, in milliseconds.
pub const USAGE_FLUSH_INTERVAL_MS: u64 = 3000;

/// Default TTL for external port leases, in seconds (2 h).
pub const PORT_LEASE_TTL_SECS: u64 = 7200;
