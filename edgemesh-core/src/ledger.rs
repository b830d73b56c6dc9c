//! Ledger client abstraction
//!
//! The blockchain/governance client is an external collaborator consumed as
//! an async RPC facade: assignment lookup, funding checks, message signing,
//! and a replayable subscription to assignment-created events.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Position of a ledger event, used as the job-search checkpoint
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockPosition {
    pub block: u64,
    pub log_index: u64,
}

impl BlockPosition {
    pub fn new(block: u64, log_index: u64) -> Self {
        Self { block, log_index }
    }
}

impl std::fmt::Display for BlockPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.block, self.log_index)
    }
}

/// A ledger-recorded work assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub address: String,
    pub job_post_address: String,
    pub employer_address: String,
    /// Whether the assignment account holds any funds at all
    pub funded: bool,
    /// Whether locked value remains unreleased
    pub has_locked_value: bool,
}

/// Connection details an employer declares alongside a job post
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmployerInfo {
    pub wallet_address: String,
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// An assignment-created event observed on the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentEvent {
    pub assignment_address: String,
    pub position: BlockPosition,
}

/// Everything the master connection needs to know about an accepted job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub employer_address: String,
    pub job_post_address: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub block_position: Option<BlockPosition>,
}

/// Replayable subscription to assignment-created events.
///
/// Pausing is implicit: the owner simply stops calling `next_event` and keeps
/// the watcher around, so a later search resumes without rescanning.
#[cfg_attr(feature = "mocks", mockall::automock)]
#[async_trait]
pub trait AssignmentWatcher: Send + Sync {
    /// Next event, or `None` when the subscription ends upstream
    async fn next_event(&mut self) -> Result<Option<AssignmentEvent>>;
}

/// Async RPC facade over the ledger/governance client
#[cfg_attr(feature = "mocks", mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Wallet address of this node's signing key
    async fn wallet_address(&self) -> Result<String>;

    /// Current chain head block number
    async fn latest_block(&self) -> Result<u64>;

    /// Fetch an assignment by address, `None` if it does not exist
    async fn assignment(&self, address: &str) -> Result<Option<Assignment>>;

    /// Resolve the employer behind a job post address
    async fn employer_info(&self, job_post_address: &str) -> Result<EmployerInfo>;

    /// Subscribe to assignment-created events, replaying from `from_block`
    async fn subscribe_assignments(&self, from_block: u64) -> Result<Box<dyn AssignmentWatcher>>;

    /// Sign a message with the node's wallet key
    async fn sign_message(&self, message: &str) -> Result<String>;

    /// Recover the signer address from a signed message
    fn recover_address(&self, message: &str, signature: &str) -> Result<String>;
}
