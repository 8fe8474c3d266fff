//! Health monitor — the background probe loop over all registered nodes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use fleet_core::RmCore;
use fleet_types::NodeId;

use crate::checker::{HealthStatus, HealthTracker, ProbeResult};

/// Probe loop tunables.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    /// Period between probe cycles.
    pub interval: Duration,
    /// Deadline of a single probe.
    pub timeout: Duration,
    /// Consecutive failed probes before a node is reported down.
    pub failure_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            failure_threshold: 3,
        }
    }
}

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Probes every node once per interval and reports unreachable ones.
pub struct HealthMonitor {
    core: Arc<RmCore>,
    settings: HealthSettings,
    /// Per-node trackers, dropped once the node leaves the registry.
    trackers: Mutex<HashMap<NodeId, HealthTracker>>,
    task: Mutex<Option<MonitorSlot>>,
}

impl HealthMonitor {
    pub fn new(core: Arc<RmCore>, settings: HealthSettings) -> Self {
        Self {
            core,
            settings,
            trackers: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Start the probe loop. Returns false if it was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock();
        if task.is_some() {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            monitor.run_probe_loop(shutdown_rx).await;
        });
        *task = Some(MonitorSlot {
            handle,
            shutdown_tx,
        });

        info!(
            interval = ?self.settings.interval,
            timeout = ?self.settings.timeout,
            threshold = self.settings.failure_threshold,
            "health monitor started"
        );
        true
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Stop the probe loop and wait for it to exit. No-op when stopped.
    pub async fn stop(&self) {
        let slot = self.task.lock().take();
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
            if let Err(e) = slot.handle.await {
                warn!(error = %e, "health loop did not exit cleanly");
            }
            info!("health monitor stopped");
        }
    }

    /// Current tracker status of a node.
    pub fn status(&self, id: NodeId) -> Option<HealthStatus> {
        self.trackers.lock().get(&id).map(HealthTracker::status)
    }

    /// Run one probe cycle. Returns the nodes that went down in this cycle.
    ///
    /// Probes run concurrently, each bounded by the probe timeout; a probe
    /// that times out counts as a failure.
    pub async fn probe_cycle(&self) -> Vec<NodeId> {
        let targets = self.core.probe_targets();
        let timeout = self.settings.timeout;

        let mut probes = JoinSet::new();
        for (id, handle) in targets {
            probes.spawn(async move {
                let reachable = tokio::time::timeout(timeout, handle.is_reachable(timeout))
                    .await
                    .unwrap_or(false);
                (id, handle.url().to_string(), reachable)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }

        let newly_unhealthy: Vec<(NodeId, String)> = {
            let mut trackers = self.trackers.lock();
            let probed: HashSet<NodeId> = results.iter().map(|(id, _, _)| *id).collect();
            trackers.retain(|id, _| probed.contains(id));

            let threshold = self.settings.failure_threshold;
            results
                .into_iter()
                .filter_map(|(id, url, reachable)| {
                    let tracker = trackers
                        .entry(id)
                        .or_insert_with(|| HealthTracker::new(threshold));
                    let before = tracker.status();
                    let outcome = if reachable {
                        ProbeResult::Healthy
                    } else {
                        ProbeResult::Failed
                    };
                    let after = tracker.record(outcome);
                    if !reachable {
                        debug!(node_id = %id, %url, failures = tracker.consecutive_failures(), "probe failed");
                    }
                    (after == HealthStatus::Unhealthy && before != HealthStatus::Unhealthy)
                        .then_some((id, url))
                })
                .collect()
        };

        let mut down = Vec::new();
        for (id, url) in newly_unhealthy {
            if self.core.detected_pinged_down_node(&url).await {
                down.push(id);
            }
        }
        down
    }

    async fn run_probe_loop(&self, mut shutdown: watch::Receiver<bool>) {
        debug!("health loop starting");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {
                    tokio::select! {
                        down = self.probe_cycle() => {
                            if !down.is_empty() {
                                info!(count = down.len(), "nodes reported down");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("health loop shutting down");
    }
}
