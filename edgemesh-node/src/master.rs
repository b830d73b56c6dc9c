//! Master connection state machine
//!
//! Owns the single upstream link to the master: Disconnected, Connecting, or
//! Connected, all transitions behind one async lock. A generation counter is
//! bumped on every connect and local teardown, so a handshake that completes
//! after `close()` or `disconnect()` raced it is discarded instead of
//! resurrecting the link.
//!
//! Remote events arrive through a per-connection pump task and fan out to
//! subscribers over a broadcast channel. Outbound reports are guarded: while
//! the link is down they are logged and dropped, never queued.

use crate::metrics;
use edgemesh_core::{
    CloseCode, ClosedInfo, ContentStore, EdgeMeshError, HandshakePayload, HandshakeValidator,
    JobDescriptor, LedgerClient, MasterMetadata, NodeMetadata, ReportPayload, Result,
    SignedHandshake, SignedRequest, StorageStats, WireChannel, WireConnection, WireEvent,
    WireTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Link state, exposed to the controller API and the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events fanned out to subscribers
#[derive(Debug, Clone)]
pub enum MasterEvent {
    StateChanged(ConnectionState),
    Connected,
    /// The link went down. `None` means a locally initiated terminal close.
    Closed(Option<ClosedInfo>),
    Reconnecting {
        delay_secs: u64,
    },
    Error {
        message: String,
        suggested_backoff_secs: Option<u64>,
    },
    WorkOrder {
        address: String,
    },
    SignedRequest(SignedRequest),
    Response(serde_json::Value),
    Statistics(serde_json::Value),
}

struct Inner {
    state: ConnectionState,
    address: Option<String>,
    job: Option<JobDescriptor>,
    work_order: Option<String>,
    can_reconnect: bool,
    is_reconnecting: bool,
    generation: u64,
    channel: Option<Arc<dyn WireChannel>>,
    pump: Option<JoinHandle<()>>,
}

pub struct MasterConnection {
    wire: Arc<dyn WireTransport>,
    store: Arc<dyn ContentStore>,
    ledger: Option<Arc<dyn LedgerClient>>,
    metadata: NodeMetadata,
    events: broadcast::Sender<MasterEvent>,
    inner: Mutex<Inner>,
}

impl MasterConnection {
    pub fn new(
        wire: Arc<dyn WireTransport>,
        store: Arc<dyn ContentStore>,
        ledger: Option<Arc<dyn LedgerClient>>,
        metadata: NodeMetadata,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            wire,
            store,
            ledger,
            metadata,
            events,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                address: None,
                job: None,
                work_order: None,
                can_reconnect: true,
                is_reconnecting: false,
                generation: 0,
                channel: None,
                pump: None,
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MasterEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.state == ConnectionState::Connected
    }

    pub async fn current_job(&self) -> Option<JobDescriptor> {
        self.inner.lock().await.job.clone()
    }

    /// Record the accepted work order, included in later handshakes
    pub async fn set_work_order(&self, address: Option<String>) {
        self.inner.lock().await.work_order = address;
    }

    /// Open the link. A no-op while already Connecting or Connected; an
    /// empty address is logged and ignored.
    pub async fn connect(
        self: &Arc<Self>,
        address: &str,
        job: Option<JobDescriptor>,
    ) -> Result<()> {
        if address.trim().is_empty() {
            warn!("Ignoring connect request with empty master address");
            return Ok(());
        }

        let generation;
        let job_snapshot;
        {
            let mut inner = self.inner.lock().await;
            if inner.state != ConnectionState::Disconnected {
                debug!(state = ?inner.state, "Connect ignored, link already active");
                return Ok(());
            }
            if self.ledger.is_some() && job.is_none() && inner.job.is_none() {
                return Err(EdgeMeshError::MissingJobDescriptor);
            }
            if let Some(job) = job {
                inner.job = Some(job);
            }
            inner.address = Some(address.to_string());
            inner.can_reconnect = true;
            inner.generation += 1;
            generation = inner.generation;
            job_snapshot = inner.job.clone();
            self.set_state(&mut inner, ConnectionState::Connecting);
        }

        info!(address = %address, "Connecting to master");
        match self.open_channel(address, job_snapshot).await {
            Ok(connection) => self.finish_connect(generation, connection).await,
            Err(e) => {
                self.fail_connect(generation, &e).await;
                Err(e)
            }
        }
    }

    /// Close the current link without latching reconnection off. Used for
    /// remote-requested restarts and employer switches.
    pub async fn disconnect(&self, restarting: bool) {
        let (code, reason) = if restarting {
            (CloseCode::ServiceRestarting, "Node restarting")
        } else {
            (CloseCode::NormalClosure, "Node disconnecting")
        };

        let channel;
        {
            let mut inner = self.inner.lock().await;
            if inner.state != ConnectionState::Connected {
                debug!(state = ?inner.state, "Disconnect ignored, link not connected");
                return;
            }
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            channel = inner.channel.take();
            inner.generation += 1;
            self.set_state(&mut inner, ConnectionState::Disconnected);
        }

        if let Some(channel) = channel {
            if let Err(e) = channel.close(code, reason).await {
                debug!(error = %e, "Close frame failed");
            }
        }
        self.emit(MasterEvent::Closed(Some(ClosedInfo {
            code: code.as_u16(),
            reason: reason.to_string(),
            was_clean: true,
        })));
    }

    /// Terminal close: tears the link down and latches reconnection off
    /// until the next explicit `connect`.
    pub async fn close(&self) {
        let channel;
        {
            let mut inner = self.inner.lock().await;
            inner.can_reconnect = false;
            inner.generation += 1;
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            channel = inner.channel.take();
            if inner.state != ConnectionState::Disconnected {
                self.set_state(&mut inner, ConnectionState::Disconnected);
            }
        }

        if let Some(channel) = channel {
            if let Err(e) = channel
                .close(CloseCode::NormalClosure, "Node shutting down")
                .await
            {
                debug!(error = %e, "Close frame failed");
            }
        }
        self.emit(MasterEvent::Closed(None));
    }

    /// Schedule a reconnect after `delay_secs`. Ignored while a previous
    /// reconnect is pending, while the link is up, or after `close()`.
    pub async fn reconnect(self: &Arc<Self>, delay_secs: u64) {
        let address;
        let job;
        {
            let mut inner = self.inner.lock().await;
            if !inner.can_reconnect {
                info!("Reconnection is latched off");
                return;
            }
            if inner.is_reconnecting {
                debug!("Reconnect already pending");
                return;
            }
            if inner.state != ConnectionState::Disconnected {
                debug!(state = ?inner.state, "Reconnect ignored, link active");
                return;
            }
            match inner.address.clone() {
                Some(addr) => address = addr,
                None => {
                    warn!("Reconnect requested before any connect");
                    return;
                }
            }
            inner.is_reconnecting = true;
            job = inner.job.clone();
        }

        metrics::record_master_reconnect();
        info!(delay_secs, "Scheduling reconnect");
        self.emit(MasterEvent::Reconnecting { delay_secs });

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            {
                let mut inner = this.inner.lock().await;
                inner.is_reconnecting = false;
                if !inner.can_reconnect {
                    return;
                }
            }
            if let Err(e) = this.connect(&address, job).await {
                debug!(error = %e, "Reconnect attempt failed");
            }
        });
    }

    // ===== Outbound reports =====

    pub async fn report_uploaded(&self, content_id: String, client_ip: String, byte_count: u64) {
        self.send_guarded(ReportPayload::Uploaded {
            content_id,
            client_ip,
            byte_count,
        })
        .await;
    }

    pub async fn report_downloaded(&self, content_id: String, client_ip: String, byte_count: u64) {
        self.send_guarded(ReportPayload::Downloaded {
            content_id,
            client_ip,
            byte_count,
        })
        .await;
    }

    pub async fn report_storage(&self, stats: StorageStats) {
        self.send_guarded(ReportPayload::Storage(stats)).await;
    }

    /// Report measured bandwidth. With `skippable` the caller signals the
    /// measurement can be cheaply skipped, so a down link drops it silently.
    pub async fn report_bandwidth(&self, stats: edgemesh_core::BandwidthStats, skippable: bool) {
        if skippable && !self.is_connected().await {
            return;
        }
        self.send_guarded(ReportPayload::Bandwidth(stats)).await;
    }

    pub async fn send_signed_request(&self, request: SignedRequest) {
        self.send_guarded(ReportPayload::SignedRequest(request))
            .await;
    }

    async fn send_guarded(&self, report: ReportPayload) {
        let channel = {
            let inner = self.inner.lock().await;
            if inner.state != ConnectionState::Connected {
                warn!(state = ?inner.state, "Master link down, dropping report");
                metrics::record_report_dropped();
                return;
            }
            inner.channel.clone()
        };
        if let Some(channel) = channel {
            match channel.send(report).await {
                Ok(()) => metrics::record_report_sent(),
                Err(e) => warn!(error = %e, "Failed to send report"),
            }
        }
    }

    // ===== Connect plumbing =====

    async fn open_channel(
        &self,
        address: &str,
        job: Option<JobDescriptor>,
    ) -> Result<WireConnection> {
        let payload = self.build_handshake(&job).await?;
        let validator = self.build_validator(&job);
        let connection = self.wire.open(address, payload, validator).await?;
        connection.channel.handshake_result().await?;
        Ok(connection)
    }

    async fn build_handshake(&self, job: &Option<JobDescriptor>) -> Result<HandshakePayload> {
        let signed = match (&self.ledger, job) {
            (Some(ledger), Some(job)) => {
                let nonce = random_nonce();
                let nonce_signed = ledger.sign_message(&nonce).await?;
                let work_order_address = self.inner.lock().await.work_order.clone();
                Some(SignedHandshake {
                    nonce,
                    nonce_signed,
                    job_post_address: job.job_post_address.clone(),
                    work_order_address,
                })
            }
            _ => None,
        };
        Ok(HandshakePayload {
            metadata: self.metadata.clone(),
            signed,
        })
    }

    /// In ledger-gated mode the master must prove it holds the employer key
    /// by signing our view of its nonce. Direct mode accepts anything.
    fn build_validator(&self, job: &Option<JobDescriptor>) -> HandshakeValidator {
        match (self.ledger.clone(), job.clone()) {
            (Some(ledger), Some(job)) => Arc::new(move |remote: &MasterMetadata| {
                let (nonce, signature) = match (&remote.nonce, &remote.nonce_signed) {
                    (Some(nonce), Some(signature)) => (nonce, signature),
                    _ => {
                        warn!("Master handshake is missing its signature");
                        return false;
                    }
                };
                match ledger.recover_address(nonce, signature) {
                    Ok(recovered) => {
                        let ok = recovered.eq_ignore_ascii_case(&job.employer_address);
                        if !ok {
                            warn!(
                                recovered = %recovered,
                                expected = %job.employer_address,
                                "Master signature recovered to the wrong address"
                            );
                        }
                        ok
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to recover master signature");
                        false
                    }
                }
            }),
            _ => Arc::new(|_| true),
        }
    }

    async fn finish_connect(
        self: &Arc<Self>,
        generation: u64,
        connection: WireConnection,
    ) -> Result<()> {
        let WireConnection { channel, events } = connection;
        let channel: Arc<dyn WireChannel> = Arc::from(channel);

        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.state != ConnectionState::Connecting {
            // A close raced the handshake; settle without resurrecting.
            debug!("Discarding superseded handshake completion");
            drop(inner);
            let _ = channel
                .close(CloseCode::NormalClosure, "Connection superseded")
                .await;
            return Ok(());
        }

        inner.channel = Some(channel);
        inner.pump = Some(tokio::spawn(self.clone().pump(generation, events)));
        self.set_state(&mut inner, ConnectionState::Connected);
        drop(inner);

        info!("Master link established");
        self.emit(MasterEvent::Connected);
        Ok(())
    }

    async fn fail_connect(&self, generation: u64, error: &EdgeMeshError) {
        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            self.set_state(&mut inner, ConnectionState::Disconnected);
        }
        error!(error = %error, "Master connection failed");
        self.emit(MasterEvent::Error {
            message: error.to_string(),
            suggested_backoff_secs: backoff_hint(error),
        });
    }

    // ===== Remote event pump =====

    async fn pump(self: Arc<Self>, generation: u64, mut events: mpsc::Receiver<WireEvent>) {
        loop {
            match events.recv().await {
                Some(WireEvent::Warning { message }) => {
                    warn!(message = %message, "Warning from master");
                }
                Some(WireEvent::Seed { metadata }) => {
                    info!(content_id = %metadata.content_id, "Seed request from master");
                    match self.store.add(metadata).await {
                        Ok(()) => {
                            let content_ids = self.store.list().await;
                            self.send_guarded(ReportPayload::Seeding { content_ids }).await;
                        }
                        Err(e) => warn!(error = %e, "Failed to register seeded content"),
                    }
                }
                Some(WireEvent::Clear { content_ids }) => {
                    self.handle_clear(content_ids).await;
                }
                Some(WireEvent::WorkOrder { address }) => {
                    self.inner.lock().await.work_order = Some(address.clone());
                    self.emit(MasterEvent::WorkOrder { address });
                }
                Some(WireEvent::SignedRequest(request)) => {
                    self.emit(MasterEvent::SignedRequest(request));
                }
                Some(WireEvent::Response { payload }) => {
                    self.emit(MasterEvent::Response(payload));
                }
                Some(WireEvent::Statistics { payload }) => {
                    self.emit(MasterEvent::Statistics(payload));
                }
                Some(WireEvent::Error { message }) => {
                    error!(message = %message, "Wire error from master");
                    self.emit(MasterEvent::Error {
                        message,
                        suggested_backoff_secs: None,
                    });
                }
                Some(WireEvent::Closed(info)) => {
                    self.on_remote_closed(generation, info).await;
                    return;
                }
                None => {
                    self.on_remote_closed(
                        generation,
                        ClosedInfo {
                            code: CloseCode::AbnormalClosure.as_u16(),
                            reason: "Channel ended".to_string(),
                            was_clean: false,
                        },
                    )
                    .await;
                    return;
                }
            }
        }
    }

    /// An empty clear list means drop everything the node carries
    async fn handle_clear(&self, content_ids: Vec<String>) {
        let targets = if content_ids.is_empty() {
            self.store.list().await
        } else {
            content_ids
        };
        let mut cleared = Vec::with_capacity(targets.len());
        for content_id in targets {
            if self.store.remove(&content_id).await {
                cleared.push(content_id);
            }
        }
        info!(count = cleared.len(), "Cleared content");
        self.send_guarded(ReportPayload::Cleared {
            content_ids: cleared,
        })
        .await;
    }

    /// A clean NormalClosure or ServiceRestarting surfaces as `Closed`;
    /// every other remote close is an `Error` carrying the backoff hint
    /// derived from the close code.
    async fn on_remote_closed(&self, generation: u64, info: ClosedInfo) {
        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation || inner.state == ConnectionState::Disconnected {
                return;
            }
            inner.channel = None;
            inner.pump = None;
            self.set_state(&mut inner, ConnectionState::Disconnected);
        }
        let clean = info.was_clean
            && matches!(
                CloseCode::from_u16(info.code),
                Some(CloseCode::NormalClosure | CloseCode::ServiceRestarting)
            );
        if clean {
            info!(code = info.code, reason = %info.reason, "Master closed the link");
            self.emit(MasterEvent::Closed(Some(info)));
        } else {
            let error = EdgeMeshError::ConnectionClosed {
                code: info.code,
                reason: info.reason,
            };
            warn!(error = %error, "Master link dropped");
            self.emit(MasterEvent::Error {
                suggested_backoff_secs: backoff_hint(&error),
                message: error.to_string(),
            });
        }
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state == state {
            return;
        }
        debug!(from = ?inner.state, to = ?state, "Link state changed");
        inner.state = state;
        metrics::set_master_connected(state == ConnectionState::Connected);
        self.emit(MasterEvent::StateChanged(state));
    }

    fn emit(&self, event: MasterEvent) {
        // Returns Err only when nobody is subscribed.
        let _ = self.events.send(event);
    }
}

/// Backoff hint the agent honors when the failure carried a close code
pub fn backoff_hint(error: &EdgeMeshError) -> Option<u64> {
    match error {
        EdgeMeshError::ConnectionClosed { code, .. } => {
            CloseCode::from_u16(*code).and_then(CloseCode::suggested_backoff_secs)
        }
        _ => None,
    }
}

fn random_nonce() -> String {
    let bytes: [u8; 4] = rand::random();
    hex::encode(bytes)
}
