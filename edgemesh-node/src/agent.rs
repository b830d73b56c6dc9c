//! Node agent
//!
//! Wires the pieces together at runtime: starts the listeners and usage
//! flushing, resolves which master to serve (configured address or ledger
//! job search), drives the reconnection policy, answers payment-handshake
//! requests, and forwards aggregated usage upstream.

use crate::config::NodeConfig;
use crate::jobs::JobSearchSession;
use crate::master::{MasterConnection, MasterEvent};
use crate::metrics;
use crate::portmap::PortLeaseManager;
use crate::state::StateStore;
use crate::transport::TransportSet;
use crate::usage::{AggregatedUsage, UsageAggregator};
use edgemesh_core::{
    ClosedInfo, CloseCode, ContentStore, Direction, JobDescriptor, LedgerClient, PortMapper,
    Result, SignedRequest, StorageStats,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Delay before restarting the job search after a ledger-gated failure or a
/// normal remote closure, in seconds
const JOB_RESTART_DELAY_SECS: u64 = 15;

/// Cap on the exponential reconnect backoff, in seconds
const MAX_BACKOFF_SECS: u64 = 300;

/// Reconnect delay after a ServiceRestarting close. The restart is not a
/// failure, so the backoff counter is left alone.
const RESTART_RECONNECT_DELAY_SECS: u64 = 5;

pub struct NodeAgent {
    config: NodeConfig,
    master: Arc<MasterConnection>,
    transports: Arc<TransportSet>,
    aggregator: Arc<UsageAggregator>,
    store: Arc<dyn ContentStore>,
    state: Arc<StateStore>,
    ledger: Option<Arc<dyn LedgerClient>>,
    jobs: Option<Arc<JobSearchSession>>,
    port_mapper: Option<Arc<dyn PortMapper>>,
    failures: AtomicU32,
}

impl NodeAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NodeConfig,
        master: Arc<MasterConnection>,
        transports: Arc<TransportSet>,
        aggregator: Arc<UsageAggregator>,
        store: Arc<dyn ContentStore>,
        state: Arc<StateStore>,
        ledger: Option<Arc<dyn LedgerClient>>,
        jobs: Option<Arc<JobSearchSession>>,
        port_mapper: Option<Arc<dyn PortMapper>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            master,
            transports,
            aggregator,
            store,
            state,
            ledger,
            jobs,
            port_mapper,
            failures: AtomicU32::new(0),
        })
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        self.transports.listen_all().await?;

        let (usage_tx, mut usage_rx) = mpsc::channel::<AggregatedUsage>(256);
        tokio::spawn(self.aggregator.clone().run(usage_tx));

        if self.config.port_lease.enabled {
            match &self.port_mapper {
                Some(mapper) => {
                    let manager = Arc::new(PortLeaseManager::new(
                        mapper.clone(),
                        self.transports.lease_ports(),
                        self.config.port_lease.ttl_secs,
                    ));
                    tokio::spawn(manager.run());
                }
                None => warn!("Port leasing enabled but no router mapper is available"),
            }
        }

        self.start_master_connection();

        let mut master_events = self.master.subscribe();
        let mut connected_tick = tokio::time::interval(Duration::from_secs(1));
        let mut report_tick = tokio::time::interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down");
                    break;
                }
                event = master_events.recv() => match event {
                    Ok(event) => self.handle_master_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Master event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(aggregate) = usage_rx.recv() => {
                    self.forward_usage(aggregate).await;
                }
                _ = connected_tick.tick() => {
                    if self.master.is_connected().await {
                        self.state.add_connected_secs(1);
                    }
                }
                _ = report_tick.tick() => {
                    if self.master.is_connected().await {
                        self.master.report_storage(self.storage_stats().await).await;
                    }
                }
            }
        }

        self.master.close().await;
        self.transports.close_all().await;
        if let Err(e) = self.state.save() {
            warn!(error = %e, "Failed to persist state on shutdown");
        }
        Ok(())
    }

    /// Kick off the first connection: the configured address in direct mode,
    /// a job search in ledger-gated mode
    fn start_master_connection(self: &Arc<Self>) {
        if self.jobs.is_some() {
            self.spawn_job_search(0);
        } else {
            let this = self.clone();
            let address = self.config.master.address.clone();
            tokio::spawn(async move {
                if let Err(e) = this.master.connect(&address, None).await {
                    debug!(error = %e, "Initial connect failed");
                }
            });
        }
    }

    async fn handle_master_event(self: &Arc<Self>, event: MasterEvent) {
        match event {
            MasterEvent::Connected => {
                self.failures.store(0, Ordering::Relaxed);
                self.master.report_storage(self.storage_stats().await).await;
                self.master
                    .report_bandwidth(edgemesh_core::BandwidthStats::default(), true)
                    .await;
            }
            MasterEvent::Closed(Some(info)) => self.handle_closed(info).await,
            MasterEvent::Closed(None) => {
                debug!("Master link closed locally");
            }
            MasterEvent::Error {
                message,
                suggested_backoff_secs,
            } => {
                warn!(message = %message, "Master link error");
                if self.jobs.is_some() {
                    // Ledger-gated failures go back through the job search.
                    self.spawn_job_search(JOB_RESTART_DELAY_SECS);
                } else if self.config.master.auto_reconnect {
                    let delay = suggested_backoff_secs.unwrap_or_else(|| self.next_backoff());
                    self.master.reconnect(delay).await;
                }
            }
            MasterEvent::WorkOrder { address } => {
                info!(address = %address, "Work order updated");
                self.state.set_assignment_address(Some(address));
            }
            MasterEvent::SignedRequest(request) => {
                self.handle_signed_request(request).await;
            }
            MasterEvent::Reconnecting { delay_secs } => {
                debug!(delay_secs, "Reconnect pending");
            }
            MasterEvent::StateChanged(_)
            | MasterEvent::Response(_)
            | MasterEvent::Statistics(_) => {}
        }
    }

    /// Remote closes arriving here are clean by construction; unclean ones
    /// come through the error path instead
    async fn handle_closed(self: &Arc<Self>, info: ClosedInfo) {
        match CloseCode::from_u16(info.code) {
            Some(CloseCode::ServiceRestarting) => {
                // Same master is coming back; keep the job.
                info!("Master is restarting, reconnecting");
                self.master.reconnect(RESTART_RECONNECT_DELAY_SECS).await;
            }
            _ if self.jobs.is_some() => {
                info!("Assignment ended, searching for the next job");
                self.state.set_assignment_address(None);
                self.spawn_job_search(JOB_RESTART_DELAY_SECS);
            }
            _ => {
                info!(code = info.code, "Master closed the link, staying down");
            }
        }
    }

    /// Payment handshake: countersign accept/release requests and relay the
    /// signed acknowledgement back through the master
    async fn handle_signed_request(&self, request: SignedRequest) {
        let ledger = match &self.ledger {
            Some(ledger) => ledger,
            None => {
                warn!(kind = %request.kind, "Ignoring signed request without a ledger client");
                return;
            }
        };

        let reply_kind = match request.kind.as_str() {
            "accept" => "accepted",
            "release" => "released",
            other => {
                debug!(kind = %other, "Ignoring signed request of unknown kind");
                return;
            }
        };

        let signed = match ledger.sign_message(&request.signed_request).await {
            Ok(signed) => signed,
            Err(e) => {
                error!(error = %e, "Failed to countersign request");
                return;
            }
        };

        if request.kind == "accept" {
            self.state
                .set_assignment_address(Some(request.work_order_address.clone()));
            self.master
                .set_work_order(Some(request.work_order_address.clone()))
                .await;
        }

        self.master
            .send_signed_request(SignedRequest {
                kind: reply_kind.to_string(),
                work_order_address: request.work_order_address,
                beneficiary: request.beneficiary,
                signed_request: signed,
                extend_work_order: request.extend_work_order,
            })
            .await;
    }

    async fn forward_usage(&self, aggregate: AggregatedUsage) {
        metrics::record_usage_flush();
        match aggregate.direction {
            Direction::Uploaded => {
                self.state.add_uploaded(aggregate.byte_count);
                self.master
                    .report_uploaded(
                        aggregate.content_id,
                        aggregate.client_ip,
                        aggregate.byte_count,
                    )
                    .await;
            }
            Direction::Downloaded => {
                self.state.add_downloaded(aggregate.byte_count);
                self.master
                    .report_downloaded(
                        aggregate.content_id,
                        aggregate.client_ip,
                        aggregate.byte_count,
                    )
                    .await;
            }
        }
    }

    /// Run the job search after `delay_secs`, then connect to the winner.
    /// Timeouts retry immediately (the subscription stays warm); other
    /// failures retry after the restart delay.
    fn spawn_job_search(self: &Arc<Self>, delay_secs: u64) {
        let Some(jobs) = self.jobs.clone() else {
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            loop {
                match jobs.find_next_job().await {
                    Ok(job) => {
                        let Some(address) = master_address(&job) else {
                            warn!(
                                job_post = %job.job_post_address,
                                "Job has no reachable master address, searching again"
                            );
                            continue;
                        };
                        info!(address = %address, employer = %job.employer_address, "Job found");
                        if let Err(e) = this.master.connect(&address, Some(job)).await {
                            debug!(error = %e, "Connect to job master failed");
                        }
                        return;
                    }
                    Err(edgemesh_core::EdgeMeshError::JobSearchTimeout(secs)) => {
                        debug!(timeout_secs = secs, "Job search timed out, retrying");
                    }
                    Err(edgemesh_core::EdgeMeshError::JobSearchActive) => {
                        debug!("Job search already running elsewhere");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "Job search failed");
                        tokio::time::sleep(Duration::from_secs(JOB_RESTART_DELAY_SECS)).await;
                    }
                }
            }
        });
    }

    fn next_backoff(&self) -> u64 {
        backoff_delay(self.failures.fetch_add(1, Ordering::Relaxed))
    }

    async fn storage_stats(&self) -> StorageStats {
        let mut used_bytes = 0;
        for content_id in self.store.list().await {
            if let Some(handle) = self.store.get(&content_id).await {
                used_bytes += handle.total_length();
            }
        }
        let total_bytes = self.config.storage.capacity_bytes;
        StorageStats {
            total_bytes,
            used_bytes,
            available_bytes: total_bytes.saturating_sub(used_bytes),
        }
    }
}

/// Exponential reconnect backoff: 2^failures seconds, capped
fn backoff_delay(failures: u32) -> u64 {
    2u64.saturating_pow(failures.min(16)).min(MAX_BACKOFF_SECS)
}

/// WebSocket address of the master that posted a job
fn master_address(job: &JobDescriptor) -> Option<String> {
    let host = job.host.as_deref()?;
    let port = job.port?;
    Some(format!("ws://{host}:{port}"))
}
