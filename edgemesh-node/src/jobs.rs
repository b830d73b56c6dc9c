//! Ledger job search
//!
//! Finds the next funded assignment this node should serve. A stored
//! assignment that is still funded short-circuits the search; otherwise the
//! session watches assignment-created events from a resumable subscription,
//! filters them against the employer allow-list, and returns the first match.
//!
//! Timing out does not drop the subscription: the watcher stays parked in
//! the session so the next search resumes where this one stopped. The
//! persisted checkpoint guards against replayed events after a restart.

use crate::state::StateStore;
use edgemesh_core::{
    AssignmentEvent, AssignmentWatcher, EdgeMeshError, JobDescriptor, LedgerClient, Result,
    JOB_SEARCH_LOOKBACK_BLOCKS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct JobSearchConfig {
    /// Employer hosts the node will work for; empty or containing "*"
    /// accepts any host
    pub allowed_masters: Vec<String>,
    pub timeout_secs: u64,
    pub lookback_blocks: u64,
}

impl Default for JobSearchConfig {
    fn default() -> Self {
        Self {
            allowed_masters: Vec::new(),
            timeout_secs: 300,
            lookback_blocks: JOB_SEARCH_LOOKBACK_BLOCKS,
        }
    }
}

pub struct JobSearchSession {
    ledger: Arc<dyn LedgerClient>,
    state: Arc<StateStore>,
    config: JobSearchConfig,
    watcher: Mutex<Option<Box<dyn AssignmentWatcher>>>,
}

impl JobSearchSession {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        state: Arc<StateStore>,
        config: JobSearchConfig,
    ) -> Self {
        Self {
            ledger,
            state,
            config,
            watcher: Mutex::new(None),
        }
    }

    /// Find the next job to serve. Only one search may run at a time.
    pub async fn find_next_job(&self) -> Result<JobDescriptor> {
        let mut guard = self
            .watcher
            .try_lock()
            .map_err(|_| EdgeMeshError::JobSearchActive)?;

        // A stored assignment that still holds funds wins outright.
        if let Some(address) = self.state.assignment_address() {
            if let Some(job) = self.resume_assignment(&address).await? {
                info!(assignment = %address, "Resuming stored assignment");
                return Ok(job);
            }
            info!(assignment = %address, "Stored assignment is no longer funded, searching");
            self.state.set_assignment_address(None);
        }

        if guard.is_none() {
            let latest = self.ledger.latest_block().await?;
            let from_block = self.subscription_start(latest);
            info!(from_block, latest, "Opening assignment subscription");
            *guard = Some(self.ledger.subscribe_assignments(from_block).await?);
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.timeout_secs);
        loop {
            let watcher = match guard.as_mut() {
                Some(watcher) => watcher,
                None => {
                    return Err(EdgeMeshError::Ledger(
                        "Assignment subscription is gone".to_string(),
                    ))
                }
            };

            let event = tokio::select! {
                // On timeout the watcher stays parked for the next search.
                _ = tokio::time::sleep_until(deadline) => {
                    info!(timeout_secs = self.config.timeout_secs, "Job search timed out");
                    return Err(EdgeMeshError::JobSearchTimeout(self.config.timeout_secs));
                }
                event = watcher.next_event() => event?,
            };

            let event = match event {
                Some(event) => event,
                None => {
                    *guard = None;
                    return Err(EdgeMeshError::Ledger(
                        "Assignment subscription ended".to_string(),
                    ));
                }
            };

            if let Some(checkpoint) = self.state.checkpoint() {
                if event.position <= checkpoint {
                    debug!(position = %event.position, "Skipping already-processed event");
                    continue;
                }
            }

            let job = self.evaluate_event(&event).await?;
            self.state.advance_checkpoint(event.position);
            if let Some(job) = job {
                return Ok(job);
            }
        }
    }

    /// Re-validate an assignment the node accepted in an earlier run
    async fn resume_assignment(&self, address: &str) -> Result<Option<JobDescriptor>> {
        let assignment = match self.ledger.assignment(address).await? {
            Some(assignment) => assignment,
            None => return Ok(None),
        };
        if !assignment.funded || !assignment.has_locked_value {
            return Ok(None);
        }
        let employer = self.ledger.employer_info(&assignment.job_post_address).await?;
        Ok(Some(JobDescriptor {
            employer_address: assignment.employer_address,
            job_post_address: assignment.job_post_address,
            host: employer.host,
            port: employer.port,
            block_position: None,
        }))
    }

    async fn evaluate_event(&self, event: &AssignmentEvent) -> Result<Option<JobDescriptor>> {
        let assignment = match self.ledger.assignment(&event.assignment_address).await? {
            Some(assignment) => assignment,
            None => {
                debug!(address = %event.assignment_address, "Assignment vanished before lookup");
                return Ok(None);
            }
        };
        if !assignment.funded || !assignment.has_locked_value {
            debug!(address = %assignment.address, "Skipping unfunded assignment");
            return Ok(None);
        }

        let employer = self.ledger.employer_info(&assignment.job_post_address).await?;
        if !host_allowed(&self.config.allowed_masters, employer.host.as_deref()) {
            info!(host = ?employer.host, "Employer host is not in the allow-list");
            return Ok(None);
        }

        Ok(Some(JobDescriptor {
            employer_address: assignment.employer_address,
            job_post_address: assignment.job_post_address,
            host: employer.host,
            port: employer.port,
            block_position: Some(event.position),
        }))
    }

    /// First block of a fresh subscription: the fixed lookback window,
    /// bounded below by the persisted checkpoint
    fn subscription_start(&self, latest_block: u64) -> u64 {
        let floor = latest_block.saturating_sub(self.config.lookback_blocks);
        match self.state.checkpoint() {
            Some(checkpoint) => floor.max(checkpoint.block),
            None => floor,
        }
    }
}

/// An empty list or a wildcard entry disables filtering
fn host_allowed(allowed: &[String], host: Option<&str>) -> bool {
    if allowed.is_empty() || allowed.iter().any(|entry| entry == "*") {
        return true;
    }
    match host {
        Some(host) => allowed.iter().any(|entry| entry == host),
        None => false,
    }
}
