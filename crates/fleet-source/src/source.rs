//! Node source — one backend, one policy, a set of member ids.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fleet_types::{AccessType, Client, FleetError, FleetResult, NodeHandle, NodeId};

use crate::backend::InfrastructureBackend;
use crate::policy::{NodeSourcePolicy, PoolDecision, SourceKind};
use crate::registrar::NodeRegistrar;

/// Timeouts and retry budget of a source.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Deadline for one backend acquisition.
    pub acquire_timeout: Duration,
    /// Deadline for one backend termination.
    pub terminate_timeout: Duration,
    /// Period of the acquisition loop.
    pub check_interval: Duration,
    /// Attempts per acquisition or termination before raising an alert.
    pub max_attempts: u32,
    /// First retry delay; doubles per failure.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(120),
            terminate_timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(10),
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Source-level alert state for failed backend calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceAlert {
    /// Acquisition failures since the last successful acquisition.
    pub consecutive_failures: u32,
    pub total_failures: u64,
    /// Terminations given up after the retry budget.
    pub failed_terminations: u64,
    pub last_error: Option<String>,
    /// Set when a retry budget was exhausted; cleared by the next
    /// successful acquisition.
    pub raised: bool,
}

/// Background acquisition loop of a dynamic source.
struct LoopSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// A named pool of nodes from one backend, governed by one policy.
pub struct NodeSource {
    name: String,
    owner: Client,
    backend: Arc<dyn InfrastructureBackend>,
    policy: Arc<dyn NodeSourcePolicy>,
    settings: SourceSettings,
    members: Mutex<BTreeSet<NodeId>>,
    alert: Mutex<SourceAlert>,
    wake: Notify,
    acquisition: Mutex<Option<LoopSlot>>,
}

impl NodeSource {
    pub fn new(
        name: impl Into<String>,
        owner: Client,
        backend: Arc<dyn InfrastructureBackend>,
        policy: Arc<dyn NodeSourcePolicy>,
    ) -> Self {
        Self {
            name: name.into(),
            owner,
            backend,
            policy,
            settings: SourceSettings::default(),
            members: Mutex::new(BTreeSet::new()),
            alert: Mutex::new(SourceAlert::default()),
            wake: Notify::new(),
            acquisition: Mutex::new(None),
        }
    }

    pub fn with_settings(mut self, settings: SourceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The client that created the source.
    pub fn owner(&self) -> &Client {
        &self.owner
    }

    pub fn kind(&self) -> SourceKind {
        self.policy.kind()
    }

    pub fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    pub fn user_access(&self) -> AccessType {
        self.policy.user_access()
    }

    pub fn provider_access(&self) -> AccessType {
        self.policy.provider_access()
    }

    /// Whether `client` may reserve nodes from this source.
    pub fn permits_user(&self, client: &Client) -> bool {
        self.policy.user_access().permits(client, &self.owner)
    }

    /// Whether `client` may add nodes to this source.
    pub fn permits_provider(&self, client: &Client) -> bool {
        self.policy.provider_access().permits(client, &self.owner)
    }

    // ── Membership ─────────────────────────────────────────────────

    pub fn members(&self) -> Vec<NodeId> {
        self.members.lock().iter().copied().collect()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.lock().contains(&id)
    }

    /// Record a node as provided by this source. Called by the registry.
    pub fn attach_node(&self, id: NodeId) {
        self.members.lock().insert(id);
    }

    /// Forget a node. Called by the registry. Returns whether it was a member.
    pub fn detach_node(&self, id: NodeId) -> bool {
        self.members.lock().remove(&id)
    }

    pub fn alert(&self) -> SourceAlert {
        self.alert.lock().clone()
    }

    // ── Node lifecycle ─────────────────────────────────────────────

    /// Register a node obtained outside the acquisition loop.
    pub async fn internal_add_node(
        &self,
        registrar: &dyn NodeRegistrar,
        handle: Arc<dyn NodeHandle>,
    ) -> FleetResult<NodeId> {
        registrar.register_node(&self.name, handle).await
    }

    /// Terminate the resource behind a node.
    ///
    /// `force` skips graceful drain and is used for confirmed-down or
    /// preempted nodes. Membership is left to the registry, which detaches
    /// the id when the node is deleted. Transient backend failures are
    /// retried like acquisitions; an exhausted budget raises the alert.
    pub async fn internal_remove_node(
        &self,
        id: NodeId,
        handle: Arc<dyn NodeHandle>,
        force: bool,
    ) -> FleetResult<()> {
        let url = handle.url().to_string();
        self.terminate_with_retry(handle, force).await?;
        info!(source = %self.name, node_id = %id, %url, force, "node terminated");
        Ok(())
    }

    async fn terminate_with_retry(&self, handle: Arc<dyn NodeHandle>, force: bool) -> FleetResult<()> {
        let url = handle.url().to_string();
        let attempts = self.settings.max_attempts.max(1);
        let mut backoff = self.settings.base_backoff;
        let mut attempt = 1;

        loop {
            let err = match tokio::time::timeout(
                self.settings.terminate_timeout,
                self.backend.terminate(Arc::clone(&handle), force),
            )
            .await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => FleetError::Timeout {
                    operation: format!("terminate {url}"),
                },
            };
            warn!(
                source = %self.name,
                %url,
                attempt,
                max_attempts = attempts,
                error = %err,
                "node termination failed"
            );

            if !err.is_transient() || attempt >= attempts {
                let mut alert = self.alert.lock();
                alert.total_failures += 1;
                alert.failed_terminations += 1;
                alert.last_error = Some(err.to_string());
                alert.raised = true;
                error!(source = %self.name, %url, "node termination abandoned, source alert raised");
                return Err(err);
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.settings.max_backoff);
            attempt += 1;
        }
    }

    /// Tell the policy a member went down; dynamic policies wake the
    /// acquisition loop for a replacement.
    pub fn notify_node_down(&self, id: NodeId) {
        if self.policy.on_node_down(id) {
            debug!(source = %self.name, node_id = %id, "replacement requested");
            self.wake.notify_one();
        }
    }

    /// Acquire one node, retrying with exponential backoff.
    ///
    /// Timeouts count as failed attempts. When the budget is exhausted the
    /// source alert is raised and `FleetError::Acquisition` is returned.
    pub async fn acquire_with_retry(&self) -> FleetResult<Arc<dyn NodeHandle>> {
        let mut backoff = self.settings.base_backoff;
        let attempts = self.settings.max_attempts.max(1);

        for attempt in 1..=attempts {
            let reason = match tokio::time::timeout(self.settings.acquire_timeout, self.backend.acquire()).await {
                Ok(Ok(handle)) => {
                    let mut alert = self.alert.lock();
                    alert.consecutive_failures = 0;
                    alert.raised = false;
                    debug!(source = %self.name, url = %handle.url(), attempt, "node acquired");
                    return Ok(handle);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("acquisition timed out after {:?}", self.settings.acquire_timeout),
            };

            {
                let mut alert = self.alert.lock();
                alert.consecutive_failures += 1;
                alert.total_failures += 1;
                alert.last_error = Some(reason.clone());
            }
            warn!(
                source = %self.name,
                backend = %self.backend.kind(),
                attempt,
                max_attempts = attempts,
                error = %reason,
                "node acquisition failed"
            );

            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.settings.max_backoff);
            }
        }

        let mut alert = self.alert.lock();
        alert.raised = true;
        let reason = alert.last_error.clone().unwrap_or_default();
        error!(
            source = %self.name,
            consecutive_failures = alert.consecutive_failures,
            "acquisition retry budget exhausted, source alert raised"
        );
        Err(FleetError::Acquisition {
            source_name: self.name.clone(),
            reason,
        })
    }

    /// Run one pool evaluation and apply its decision.
    pub async fn run_cycle(&self, registrar: &dyn NodeRegistrar) -> FleetResult<PoolDecision> {
        let status = registrar.pool_status(&self.name)?;
        let decision = self.policy.evaluate(&status);

        match &decision {
            PoolDecision::Grow(count) => {
                for _ in 0..*count {
                    let handle = self.acquire_with_retry().await?;
                    let url = handle.url().to_string();
                    let Err(e) = registrar.register_node(&self.name, Arc::clone(&handle)).await else {
                        continue;
                    };
                    warn!(source = %self.name, %url, error = %e, "acquired node not registered");
                    // Never entered the registry, so no removal path
                    // terminates it.
                    if matches!(e, FleetError::Registration(_) | FleetError::DuplicateNode(_)) {
                        if let Err(e) = self.terminate_with_retry(handle, true).await {
                            warn!(source = %self.name, %url, error = %e, "refused node not returned to the backend");
                        }
                    }
                }
            }
            PoolDecision::Shrink(ids) => {
                for id in ids {
                    if let Err(e) = registrar.retire_node(*id).await {
                        debug!(source = %self.name, node_id = %id, error = %e, "idle node not retired");
                    }
                }
            }
            PoolDecision::NoChange => {}
        }

        Ok(decision)
    }

    // ── Acquisition loop ───────────────────────────────────────────

    /// Start the acquisition loop. Static sources have none; starting twice
    /// is a no-op. Returns whether a loop was started.
    pub fn start(self: &Arc<Self>, registrar: Weak<dyn NodeRegistrar>) -> bool {
        if self.kind() != SourceKind::Dynamic {
            return false;
        }

        let mut slot = self.acquisition.lock();
        if slot.is_some() {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let source = Arc::clone(self);
        let handle = tokio::spawn(async move {
            source.run_acquisition_loop(registrar, shutdown_rx).await;
        });
        *slot = Some(LoopSlot { handle, shutdown_tx });

        info!(source = %self.name, interval = ?self.settings.check_interval, "acquisition loop started");
        true
    }

    pub fn is_running(&self) -> bool {
        self.acquisition.lock().is_some()
    }

    /// Stop the acquisition loop and wait for it to exit.
    pub async fn stop(&self) {
        let slot = self.acquisition.lock().take();
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
            if let Err(e) = slot.handle.await {
                warn!(source = %self.name, error = %e, "acquisition loop did not exit cleanly");
            }
            info!(source = %self.name, "acquisition loop stopped");
        }
    }

    /// Drain and remove every member by removing the whole source.
    pub async fn shutdown(&self, registrar: &dyn NodeRegistrar) -> FleetResult<()> {
        registrar.remove_node_source(&self.name, false).await
    }

    async fn run_acquisition_loop(
        &self,
        registrar: Weak<dyn NodeRegistrar>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.check_interval) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => {
                    debug!(source = %self.name, "acquisition loop shutting down");
                    break;
                }
            }

            let Some(registrar) = registrar.upgrade() else {
                debug!(source = %self.name, "registry gone, acquisition loop exiting");
                break;
            };

            // A shutdown during a slow acquisition abandons the cycle.
            tokio::select! {
                result = self.run_cycle(registrar.as_ref()) => {
                    if let Err(e) = result {
                        warn!(source = %self.name, error = %e, "acquisition cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!(source = %self.name, "acquisition loop shutting down");
                    break;
                }
            }
        }
    }
}
