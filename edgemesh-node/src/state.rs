//! Persistent node state
//!
//! A small JSON file holding everything that must survive restarts: the
//! accepted assignment address, the ledger scan checkpoint, and lifetime
//! usage totals. Writes go through a temp file and rename so a crash never
//! leaves a half-written state file.

use edgemesh_core::{BlockPosition, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Lifetime usage counters, reported through the controller API
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageTotals {
    pub uploaded_bytes: u64,
    pub downloaded_bytes: u64,
    pub connected_secs: u64,
}

/// State persisted across restarts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    /// Assignment (work order) the node last accepted
    #[serde(default)]
    pub assignment_address: Option<String>,

    /// Last ledger position already processed by job search
    #[serde(default)]
    pub checkpoint: Option<BlockPosition>,

    #[serde(default)]
    pub totals: UsageTotals,
}

/// File-backed state store shared across the node's services
pub struct StateStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
}

impl StateStore {
    /// Load state from `path`, starting fresh if the file is missing or unreadable
    pub fn load_or_init(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "State file is corrupt, starting fresh");
                    PersistedState::default()
                }
            },
            Err(_) => PersistedState::default(),
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// In-memory store for tests
    pub fn ephemeral() -> Self {
        Self {
            path: PathBuf::new(),
            state: Mutex::new(PersistedState::default()),
        }
    }

    pub fn assignment_address(&self) -> Option<String> {
        self.state.lock().assignment_address.clone()
    }

    pub fn set_assignment_address(&self, address: Option<String>) {
        {
            let mut state = self.state.lock();
            if state.assignment_address == address {
                return;
            }
            state.assignment_address = address;
        }
        self.persist();
    }

    pub fn checkpoint(&self) -> Option<BlockPosition> {
        self.state.lock().checkpoint
    }

    /// Advance the scan checkpoint. Positions at or behind the stored
    /// checkpoint are rejected so replayed ledger events cannot move it
    /// backwards.
    pub fn advance_checkpoint(&self, position: BlockPosition) -> bool {
        {
            let mut state = self.state.lock();
            if let Some(current) = state.checkpoint {
                if position <= current {
                    debug!(%position, %current, "Ignoring stale checkpoint");
                    return false;
                }
            }
            state.checkpoint = Some(position);
        }
        self.persist();
        true
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.state.lock().totals.uploaded_bytes += bytes;
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.state.lock().totals.downloaded_bytes += bytes;
    }

    pub fn add_connected_secs(&self, secs: u64) {
        self.state.lock().totals.connected_secs += secs;
    }

    pub fn totals(&self) -> UsageTotals {
        self.state.lock().totals.clone()
    }

    pub fn snapshot(&self) -> PersistedState {
        self.state.lock().clone()
    }

    /// Flush current state to disk. Totals are only written here and on
    /// mutation of the other fields, which is fine: they are advisory.
    pub fn save(&self) -> Result<()> {
        let snapshot = self.snapshot();
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        write_atomic(&self.path, &snapshot)
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!(path = %self.path.display(), error = %e, "Failed to persist node state");
        }
    }
}

fn write_atomic(path: &Path, state: &PersistedState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
