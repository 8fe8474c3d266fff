//! RmCore — the node registry and its state machine.
//!
//! Every operation that changes a node's state goes through a slot
//! compare-and-set, so racing callers observe exactly one winner. Work that
//! talks to the outside world (reachability probes, backend termination)
//! happens after the registry lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use fleet_source::{NodeRegistrar, NodeSource, PoolMember, PoolStatus, SourceAlert};
use fleet_topology::{
    HostnameProximity, ProximityMetric, SelectionContext, SelectionPolicyKind, TopologyConstraint,
    TopologyIndex,
};
use fleet_types::{
    Client, FleetError, FleetResult, FleetSnapshot, NodeHandle, NodeId, NodeInfo, NodeState,
    NodeView,
};

use crate::registry::{NodeSlot, Registry};
use crate::reservation::{Reservation, SelectionRequest};

/// Tunables of the registry.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    /// Deadline for the reachability probe that confirms a registration.
    pub registration_timeout: Duration,
    /// Nodes closer than this share a topology cluster.
    pub topology_threshold: u64,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            registration_timeout: Duration::from_secs(10),
            topology_threshold: 2,
        }
    }
}

/// The central authority over nodes.
pub struct RmCore {
    settings: CoreSettings,
    registry: RwLock<Registry>,
    topology: RwLock<TopologyIndex>,
    metric: Arc<dyn ProximityMetric>,
    next_id: AtomicU64,
}

impl RmCore {
    pub fn new(settings: CoreSettings) -> Self {
        Self {
            topology: RwLock::new(TopologyIndex::new(settings.topology_threshold)),
            settings,
            registry: RwLock::new(Registry::default()),
            metric: Arc::new(HostnameProximity),
            next_id: AtomicU64::new(1),
        }
    }

    /// Replace the proximity metric used for topology clustering.
    pub fn with_metric(mut self, metric: Arc<dyn ProximityMetric>) -> Self {
        self.metric = metric;
        self
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    // ── Node sources ───────────────────────────────────────────────

    /// Add a node source and start its acquisition loop if it is dynamic.
    pub fn add_node_source(self: &Arc<Self>, source: NodeSource) -> FleetResult<Arc<NodeSource>> {
        let source = Arc::new(source);
        {
            let mut registry = self.registry.write();
            if registry.sources.contains_key(source.name()) {
                return Err(FleetError::DuplicateSource(source.name().to_string()));
            }
            registry
                .sources
                .insert(source.name().to_string(), Arc::clone(&source));
        }

        let weak: Weak<RmCore> = Arc::downgrade(self);
        let registrar: Weak<dyn NodeRegistrar> = weak;
        source.start(registrar);

        info!(
            source = %source.name(),
            kind = ?source.kind(),
            owner = %source.owner(),
            "node source added"
        );
        Ok(source)
    }

    /// Remove a source: every member goes to `Lost` and is deleted, then
    /// the backend terminates the resources.
    pub async fn remove_node_source(&self, name: &str, force: bool) -> FleetResult<()> {
        let (source, removed) = {
            let mut registry = self.registry.write();
            let source = registry
                .sources
                .get(name)
                .cloned()
                .ok_or_else(|| FleetError::UnknownSource(name.to_string()))?;

            let members: Vec<Arc<NodeSlot>> = registry
                .nodes
                .values()
                .filter(|slot| slot.source == name)
                .cloned()
                .collect();

            let mut removed = Vec::with_capacity(members.len());
            for slot in members {
                match slot.transition(
                    &[
                        NodeState::Configuring,
                        NodeState::Free,
                        NodeState::Busy,
                        NodeState::Down,
                    ],
                    NodeState::Lost,
                    None,
                ) {
                    Ok(previous) => {
                        debug!(node_id = %slot.id, %previous, "node lost with its source");
                        registry.delete(slot.id);
                        removed.push((slot, previous));
                    }
                    Err(refusal) => {
                        debug!(node_id = %slot.id, ?refusal, "node already leaving");
                    }
                }
            }

            registry.sources.remove(name);
            (source, removed)
        };

        source.stop().await;
        for (slot, previous) in &removed {
            // Down nodes were terminated when they were detected.
            if *previous != NodeState::Down {
                self.terminate_node(&source, slot.id, Arc::clone(&slot.handle), force).await;
            }
        }
        self.rebuild_topology();

        info!(source = %name, nodes = removed.len(), force, "node source removed");
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<Arc<NodeSource>> {
        self.registry.read().sources.get(name).cloned()
    }

    pub fn sources(&self) -> Vec<Arc<NodeSource>> {
        let registry = self.registry.read();
        let mut sources: Vec<Arc<NodeSource>> = registry.sources.values().cloned().collect();
        sources.sort_by(|a, b| a.name().cmp(b.name()));
        sources
    }

    /// Acquisition alert state per source.
    pub fn source_alerts(&self) -> Vec<(String, SourceAlert)> {
        self.sources()
            .into_iter()
            .map(|s| (s.name().to_string(), s.alert()))
            .collect()
    }

    /// Members of a source with their state and time in state.
    pub fn pool_status(&self, name: &str) -> FleetResult<PoolStatus> {
        let registry = self.registry.read();
        if !registry.sources.contains_key(name) {
            return Err(FleetError::UnknownSource(name.to_string()));
        }
        let members = registry
            .nodes
            .values()
            .filter(|slot| slot.source == name)
            .map(|slot| {
                let record = slot.record();
                PoolMember {
                    id: slot.id,
                    state: record.state,
                    in_state_for: record.since.elapsed(),
                }
            })
            .collect();
        Ok(PoolStatus { members })
    }

    // ── Registration ───────────────────────────────────────────────

    /// Register a node into a source. The node starts `Configuring` and
    /// becomes `Free` once its handle answers a reachability probe, or
    /// `Down` if it does not.
    ///
    /// `Registration` and `DuplicateNode` mean the handle never entered the
    /// registry. A node whose source is removed while it configures fails
    /// with `InconsistentTransition`; the removal has terminated it.
    pub async fn register_node(
        &self,
        source_name: &str,
        handle: Arc<dyn NodeHandle>,
    ) -> FleetResult<NodeId> {
        let slot = {
            let mut registry = self.registry.write();
            if !registry.sources.contains_key(source_name) {
                warn!(source = %source_name, url = %handle.url(), "registration for unknown node source, node discarded");
                return Err(FleetError::Registration(source_name.to_string()));
            }
            if registry.by_url.contains_key(handle.url()) {
                warn!(source = %source_name, url = %handle.url(), "node already registered, node discarded");
                return Err(FleetError::DuplicateNode(handle.url().to_string()));
            }
            let id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let slot = Arc::new(NodeSlot::new(id, source_name, handle));
            registry.insert(Arc::clone(&slot));
            slot
        };
        debug!(node_id = %slot.id, url = %slot.url, source = %source_name, "node configuring");

        let timeout = self.settings.registration_timeout;
        let reachable = tokio::time::timeout(timeout, slot.handle.is_reachable(timeout))
            .await
            .unwrap_or(false);
        let target = if reachable {
            NodeState::Free
        } else {
            NodeState::Down
        };

        if let Err(refusal) = slot.transition(&[NodeState::Configuring], target, None) {
            warn!(node_id = %slot.id, ?refusal, "node left the registry during configuration");
            return Err(FleetError::InconsistentTransition {
                node: slot.id,
                from: slot.state(),
                to: target,
            });
        }
        self.rebuild_topology();

        if reachable {
            info!(node_id = %slot.id, url = %slot.url, source = %source_name, "node registered");
        } else {
            warn!(node_id = %slot.id, url = %slot.url, source = %source_name, "node unreachable at registration, marked down");
            if let Some(source) = self.source(source_name) {
                self.terminate_node(&source, slot.id, Arc::clone(&slot.handle), true).await;
            }
        }
        Ok(slot.id)
    }

    /// Register a node on behalf of a client, checking the source's
    /// provider access.
    pub async fn add_node(
        &self,
        source_name: &str,
        handle: Arc<dyn NodeHandle>,
        client: &Client,
    ) -> FleetResult<NodeId> {
        {
            let registry = self.registry.read();
            let source = registry
                .sources
                .get(source_name)
                .ok_or_else(|| FleetError::Registration(source_name.to_string()))?;
            if !source.permits_provider(client) {
                return Err(FleetError::PermissionDenied(format!(
                    "{client} may not add nodes to {source_name}"
                )));
            }
        }
        self.register_node(source_name, handle).await
    }

    // ── Reservation ────────────────────────────────────────────────

    /// Reserve up to `request.count` free nodes for the client.
    ///
    /// Candidates are the free, unlocked nodes of sources whose user access
    /// admits the client, in registration order. The topology constraint
    /// narrows them, the selection policy orders them, and each pick is
    /// claimed with a compare-and-set. A lost race drops that node and the
    /// policy is asked again with what is left. Never waits for nodes.
    pub fn reserve(&self, request: &SelectionRequest) -> Reservation {
        let client = &request.client;

        let (mut pool, slots, owned) = {
            let registry = self.registry.read();
            let mut permitted: HashMap<String, bool> = HashMap::new();
            let mut pool = Vec::new();
            let mut slots: HashMap<NodeId, Arc<NodeSlot>> = HashMap::new();
            let mut owned = Vec::new();

            for (id, slot) in &registry.nodes {
                let record = slot.record();
                if record.state == NodeState::Busy && record.owner.as_ref() == Some(client) {
                    owned.push(*id);
                    continue;
                }
                if record.state != NodeState::Free || record.locked {
                    continue;
                }
                let allowed = *permitted.entry(slot.source.clone()).or_insert_with(|| {
                    registry
                        .sources
                        .get(&slot.source)
                        .is_some_and(|source| source.permits_user(client))
                });
                if allowed {
                    pool.push(*id);
                    slots.insert(*id, Arc::clone(slot));
                }
            }
            (pool, slots, owned)
        };

        let mut won = Vec::with_capacity(request.count.min(pool.len()));
        {
            let topology = self.topology.read();
            let ctx = SelectionContext {
                client,
                owned: &owned,
                topology: &topology,
            };

            while won.len() < request.count && !pool.is_empty() {
                let need = request.count - won.len();
                let group = match request.constraint {
                    TopologyConstraint::Arbitrary => pool.clone(),
                    constraint => topology.arrange(need, &pool, constraint),
                };
                let picks = request.policy.arrange(need, &group, &ctx);

                let before = pool.len();
                for id in picks.into_iter().take(need) {
                    if !pool.contains(&id) {
                        continue;
                    }
                    pool.retain(|p| *p != id);
                    let Some(slot) = slots.get(&id) else {
                        continue;
                    };
                    match slot.transition(&[NodeState::Free], NodeState::Busy, Some(client)) {
                        Ok(_) => {
                            debug!(node_id = %id, client = %client, "node reserved");
                            won.push(id);
                        }
                        Err(refusal) => {
                            debug!(node_id = %id, ?refusal, "node taken concurrently, skipping");
                        }
                    }
                }
                if pool.len() == before {
                    break;
                }
            }
        }

        let outcome = if won.len() == request.count {
            Reservation::Full(won)
        } else {
            Reservation::Partial {
                nodes: won,
                requested: request.count,
            }
        };

        info!(
            client = %client,
            requested = request.count,
            reserved = outcome.len(),
            policy = request.policy.name(),
            constraint = ?request.constraint,
            partial = outcome.is_partial(),
            "reservation completed"
        );
        outcome
    }

    /// Reserve with a built-in policy selected by name.
    pub fn reserve_by_name(
        &self,
        count: usize,
        policy_name: &str,
        client: &Client,
    ) -> FleetResult<Reservation> {
        let kind: SelectionPolicyKind = policy_name.parse().map_err(FleetError::InvalidRequest)?;
        let request = SelectionRequest::new(client.clone(), count).with_policy(Arc::new(kind));
        Ok(self.reserve(&request))
    }

    /// Return busy nodes to the pool.
    ///
    /// Every node must be owned by `client` unless the client is an admin;
    /// otherwise nothing is released. Nodes that are not busy are skipped.
    /// Nodes flagged for removal are removed instead of freed. Returns how
    /// many nodes left the busy state.
    pub async fn release(&self, ids: &[NodeId], client: &Client) -> FleetResult<usize> {
        let slots = {
            let registry = self.registry.read();
            let mut slots = Vec::with_capacity(ids.len());
            for id in ids {
                let slot = registry
                    .nodes
                    .get(id)
                    .cloned()
                    .ok_or_else(|| FleetError::UnknownNode(id.to_string()))?;
                let record = slot.record();
                if record.state == NodeState::Busy
                    && !client.is_admin()
                    && record.owner.as_ref() != Some(client)
                {
                    warn!(node_id = %id, client = %client, "release of a node owned by another client");
                    return Err(FleetError::PermissionDenied(format!(
                        "{client} does not own {id}"
                    )));
                }
                slots.push(slot);
            }
            slots
        };

        let mut released = 0;
        for slot in slots {
            match slot.release(client) {
                Ok(NodeState::ToRemove) => {
                    released += 1;
                    let source = self.delete_node(slot.id);
                    if let Some(source) = source {
                        self.terminate_node(&source, slot.id, Arc::clone(&slot.handle), false).await;
                    }
                }
                Ok(_) => {
                    released += 1;
                    debug!(node_id = %slot.id, client = %client, "node released");
                }
                Err(refusal) => {
                    debug!(node_id = %slot.id, ?refusal, "release ignored");
                }
            }
        }

        info!(client = %client, requested = ids.len(), released, "nodes released");
        Ok(released)
    }

    // ── Failure handling ───────────────────────────────────────────

    /// Handle a node reported unreachable by the health monitor.
    ///
    /// A `Free` or `Busy` node goes `Down` and its source terminates it
    /// with `force`. Any other state makes this a no-op, so repeated
    /// reports act once per transition. Returns whether the node went down.
    pub async fn detected_pinged_down_node(&self, url: &str) -> bool {
        let found = {
            let registry = self.registry.read();
            let found = registry
                .by_url(url)
                .map(|slot| (Arc::clone(slot), registry.sources.get(&slot.source).cloned()));
            found
        };
        let Some((slot, source)) = found else {
            debug!(%url, "down report for unknown node");
            return false;
        };

        match slot.transition(&[NodeState::Free, NodeState::Busy], NodeState::Down, None) {
            Ok(previous) => {
                warn!(node_id = %slot.id, %url, %previous, "node detected down");
                if let Some(source) = source {
                    source.notify_node_down(slot.id);
                    self.terminate_node(&source, slot.id, Arc::clone(&slot.handle), true).await;
                }
                true
            }
            Err(refusal) => {
                debug!(node_id = %slot.id, %url, ?refusal, "down report ignored");
                false
            }
        }
    }

    /// Delete nodes that have been `Down` for at least `ttl`. Returns the
    /// purged ids.
    pub fn purge_stale(&self, ttl: Duration) -> Vec<NodeId> {
        let stale: Vec<Arc<NodeSlot>> = {
            let registry = self.registry.read();
            registry
                .nodes
                .values()
                .filter(|slot| {
                    let record = slot.record();
                    record.state == NodeState::Down && record.since.elapsed() >= ttl
                })
                .cloned()
                .collect()
        };

        let purged: Vec<NodeId> = stale
            .iter()
            .filter(|slot| {
                slot.transition(&[NodeState::Down], NodeState::ToRemove, None)
                    .is_ok()
            })
            .map(|slot| slot.id)
            .collect();

        if !purged.is_empty() {
            {
                let mut registry = self.registry.write();
                for id in &purged {
                    registry.delete(*id);
                }
            }
            self.rebuild_topology();
            info!(count = purged.len(), ttl = ?ttl, "stale nodes purged");
        }
        purged
    }

    /// Remove one node on behalf of a client.
    ///
    /// Free nodes are removed now. Busy nodes are removed now with
    /// `preempt`, otherwise when their owner releases them. Down nodes are
    /// deleted without a second termination.
    pub async fn remove_node(&self, id: NodeId, client: &Client, preempt: bool) -> FleetResult<()> {
        let (slot, source) = {
            let registry = self.registry.read();
            let slot = registry
                .nodes
                .get(&id)
                .cloned()
                .ok_or_else(|| FleetError::UnknownNode(id.to_string()))?;
            let source = registry.sources.get(&slot.source).cloned();
            (slot, source)
        };

        let allowed = client.is_admin()
            || source
                .as_ref()
                .is_some_and(|source| source.permits_provider(client));
        if !allowed {
            return Err(FleetError::PermissionDenied(format!(
                "{client} may not remove {id}"
            )));
        }

        let (from, force) = match slot.state() {
            NodeState::Free => (NodeState::Free, Some(false)),
            NodeState::Busy if preempt => (NodeState::Busy, Some(true)),
            NodeState::Busy => {
                if slot.mark_pending_removal() {
                    info!(node_id = %id, "node will be removed when released");
                }
                return Ok(());
            }
            NodeState::Down => (NodeState::Down, None),
            other => {
                debug!(node_id = %id, state = %other, "removal ignored");
                return Ok(());
            }
        };

        if let Err(refusal) = slot.transition(&[from], NodeState::ToRemove, None) {
            debug!(node_id = %id, ?refusal, "removal raced with another transition");
            return Ok(());
        }
        self.delete_node(id);
        info!(node_id = %id, client = %client, preempt, "node removed");

        if let (Some(force), Some(source)) = (force, source) {
            self.terminate_node(&source, id, Arc::clone(&slot.handle), force).await;
        }
        Ok(())
    }

    /// Gracefully remove an idle node of a dynamic source.
    pub async fn retire_node(&self, id: NodeId) -> FleetResult<()> {
        let slot = self
            .registry
            .read()
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| FleetError::UnknownNode(id.to_string()))?;

        if let Err(refusal) = slot.transition(&[NodeState::Free], NodeState::ToRemove, None) {
            debug!(node_id = %id, ?refusal, "retire ignored");
            return Err(FleetError::InconsistentTransition {
                node: id,
                from: slot.state(),
                to: NodeState::ToRemove,
            });
        }
        if let Some(source) = self.delete_node(id) {
            self.terminate_node(&source, id, Arc::clone(&slot.handle), false).await;
        }
        info!(node_id = %id, "idle node retired");
        Ok(())
    }

    // ── Locking ────────────────────────────────────────────────────

    /// Exclude nodes from reservations. Admins and source owners only.
    pub fn lock_nodes(&self, ids: &[NodeId], client: &Client) -> FleetResult<usize> {
        self.set_locked(ids, client, true)
    }

    pub fn unlock_nodes(&self, ids: &[NodeId], client: &Client) -> FleetResult<usize> {
        self.set_locked(ids, client, false)
    }

    fn set_locked(&self, ids: &[NodeId], client: &Client, locked: bool) -> FleetResult<usize> {
        let registry = self.registry.read();
        let mut slots = Vec::with_capacity(ids.len());
        for id in ids {
            let slot = registry
                .nodes
                .get(id)
                .ok_or_else(|| FleetError::UnknownNode(id.to_string()))?;
            let is_owner = registry
                .sources
                .get(&slot.source)
                .is_some_and(|source| source.owner() == client);
            if !client.is_admin() && !is_owner {
                return Err(FleetError::PermissionDenied(format!(
                    "{client} may not lock {id}"
                )));
            }
            slots.push(slot);
        }

        let changed = slots.iter().filter(|slot| slot.set_locked(locked)).count();
        info!(client = %client, locked, changed, "node lock updated");
        Ok(changed)
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Node counts per state.
    pub fn snapshot(&self) -> FleetSnapshot {
        let registry = self.registry.read();
        let mut snapshot = FleetSnapshot::default();
        for slot in registry.nodes.values() {
            snapshot.record(slot.state());
        }
        snapshot
    }

    pub fn node(&self, id: NodeId) -> Option<NodeView> {
        self.registry.read().nodes.get(&id).map(|slot| slot.view())
    }

    pub fn node_by_url(&self, url: &str) -> Option<NodeView> {
        self.registry.read().by_url(url).map(|slot| slot.view())
    }

    pub fn node_state(&self, id: NodeId) -> Option<NodeState> {
        self.registry.read().nodes.get(&id).map(|slot| slot.state())
    }

    /// All registered nodes in registration order.
    pub fn nodes(&self) -> Vec<NodeView> {
        self.registry
            .read()
            .nodes
            .values()
            .map(|slot| slot.view())
            .collect()
    }

    /// URLs of free and busy nodes, optionally limited to some sources.
    pub fn list_alive_urls(&self, sources: Option<&[&str]>) -> Vec<String> {
        let registry = self.registry.read();
        registry
            .nodes
            .values()
            .filter(|slot| sources.is_none_or(|names| names.contains(&slot.source.as_str())))
            .filter(|slot| slot.state().is_alive())
            .map(|slot| slot.url.clone())
            .collect()
    }

    /// Handles of every node that should be probed: all but the ones on
    /// their way out.
    pub fn probe_targets(&self) -> Vec<(NodeId, Arc<dyn NodeHandle>)> {
        let registry = self.registry.read();
        registry
            .nodes
            .values()
            .filter(|slot| !slot.state().is_terminal())
            .map(|slot| (slot.id, Arc::clone(&slot.handle)))
            .collect()
    }

    /// A copy of the current topology clustering.
    pub fn topology(&self) -> TopologyIndex {
        self.topology.read().clone()
    }

    /// Stop every acquisition loop. Nodes stay registered.
    pub async fn shutdown(&self) {
        for source in self.sources() {
            source.stop().await;
        }
        info!("fleet core stopped");
    }

    // ── Internal helpers ───────────────────────────────────────────

    /// Delete a node from the registry and rebuild the topology. Returns
    /// the owning source if it still exists.
    fn delete_node(&self, id: NodeId) -> Option<Arc<NodeSource>> {
        let source = {
            let mut registry = self.registry.write();
            let slot = registry.delete(id)?;
            registry.sources.get(&slot.source).cloned()
        };
        self.rebuild_topology();
        source
    }

    /// Have the source terminate a node that already left the registry.
    /// A failure after the source's retry budget stays on the source alert.
    async fn terminate_node(
        &self,
        source: &NodeSource,
        id: NodeId,
        handle: Arc<dyn NodeHandle>,
        force: bool,
    ) {
        if let Err(e) = source.internal_remove_node(id, handle, force).await {
            warn!(
                source = %source.name(),
                node_id = %id,
                error = %e,
                "node resource left running, see source alert"
            );
        }
    }

    /// Recompute the topology from every node not on its way out.
    ///
    /// Takes the topology lock before reading the registry so concurrent
    /// rebuilds apply in order; nothing holds the registry lock while
    /// waiting for the topology lock.
    fn rebuild_topology(&self) {
        let mut topology = self.topology.write();
        let nodes: Vec<(NodeId, NodeInfo)> = {
            let registry = self.registry.read();
            registry
                .nodes
                .values()
                .filter(|slot| !slot.state().is_terminal())
                .map(|slot| (slot.id, slot.info.clone()))
                .collect()
        };
        topology.rebuild(&nodes, self.metric.as_ref());
    }
}

#[async_trait]
impl NodeRegistrar for RmCore {
    async fn register_node(&self, source: &str, handle: Arc<dyn NodeHandle>) -> FleetResult<NodeId> {
        RmCore::register_node(self, source, handle).await
    }

    fn pool_status(&self, source: &str) -> FleetResult<PoolStatus> {
        RmCore::pool_status(self, source)
    }

    async fn retire_node(&self, id: NodeId) -> FleetResult<()> {
        RmCore::retire_node(self, id).await
    }

    async fn remove_node_source(&self, source: &str, force: bool) -> FleetResult<()> {
        RmCore::remove_node_source(self, source, force).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use fleet_source::{InfrastructureBackend, StaticPolicy, ThresholdDynamicPolicy};
    use fleet_topology::TopologyConstraint;
    use fleet_types::AccessType;
    use parking_lot::Mutex;

    use super::*;

    struct TestHandle {
        url: String,
        host: String,
        reachable: AtomicBool,
    }

    impl TestHandle {
        fn new(url: &str, host: &str) -> Arc<Self> {
            Arc::new(Self {
                url: url.to_string(),
                host: host.to_string(),
                reachable: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl NodeHandle for TestHandle {
        fn url(&self) -> &str {
            &self.url
        }

        fn info(&self) -> NodeInfo {
            NodeInfo::new(self.host.clone(), 1)
        }

        async fn is_reachable(&self, _timeout: Duration) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }

        async fn terminate(&self) -> FleetResult<()> {
            Ok(())
        }
    }

    /// Records every termination with its force flag.
    #[derive(Default)]
    struct RecordingBackend {
        acquired: AtomicUsize,
        terminated: Mutex<Vec<(String, bool)>>,
    }

    impl RecordingBackend {
        fn terminations(&self) -> Vec<(String, bool)> {
            self.terminated.lock().clone()
        }
    }

    #[async_trait]
    impl InfrastructureBackend for RecordingBackend {
        fn kind(&self) -> &str {
            "recording"
        }

        async fn acquire(&self) -> FleetResult<Arc<dyn NodeHandle>> {
            let n = self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(TestHandle::new(&format!("test://acquired-{n}"), "acquired"))
        }

        async fn terminate(&self, handle: Arc<dyn NodeHandle>, force: bool) -> FleetResult<()> {
            self.terminated
                .lock()
                .push((handle.url().to_string(), force));
            Ok(())
        }
    }

    fn core() -> Arc<RmCore> {
        Arc::new(RmCore::new(CoreSettings {
            registration_timeout: Duration::from_millis(200),
            topology_threshold: 2,
        }))
    }

    fn add_source(
        core: &Arc<RmCore>,
        name: &str,
        user_access: AccessType,
    ) -> Arc<RecordingBackend> {
        let backend = Arc::new(RecordingBackend::default());
        let source = NodeSource::new(
            name,
            Client::provider("ops"),
            backend.clone(),
            Arc::new(StaticPolicy::new(user_access, AccessType::OwnerOnly)),
        );
        core.add_node_source(source).unwrap();
        backend
    }

    async fn register(core: &RmCore, source: &str, url: &str, host: &str) -> NodeId {
        core.register_node(source, TestHandle::new(url, host))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn registration_confirms_reachable_nodes() {
        let core = core();
        add_source(&core, "default", AccessType::All);

        let id = register(&core, "default", "test://a", "a").await;
        assert_eq!(core.node_state(id), Some(NodeState::Free));
        assert_eq!(core.snapshot().free, 1);
        assert_eq!(core.source("default").unwrap().members(), vec![id]);
    }

    #[tokio::test]
    async fn registration_into_unknown_source_is_refused() {
        let core = core();
        let err = core
            .register_node("nowhere", TestHandle::new("test://a", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Registration(_)));
        assert!(core.nodes().is_empty());
    }

    #[tokio::test]
    async fn duplicate_url_is_refused() {
        let core = core();
        add_source(&core, "default", AccessType::All);
        register(&core, "default", "test://a", "a").await;

        let err = core
            .register_node("default", TestHandle::new("test://a", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::DuplicateNode(_)));
        assert_eq!(core.snapshot().total(), 1);
    }

    #[tokio::test]
    async fn unreachable_node_registers_down_and_is_terminated() {
        let core = core();
        let backend = add_source(&core, "default", AccessType::All);

        let handle = TestHandle::new("test://dead", "dead");
        handle.reachable.store(false, Ordering::SeqCst);
        let id = core.register_node("default", handle).await.unwrap();

        assert_eq!(core.node_state(id), Some(NodeState::Down));
        assert_eq!(backend.terminations(), vec![("test://dead".to_string(), true)]);
    }

    #[tokio::test]
    async fn add_node_checks_provider_access() {
        let core = core();
        add_source(&core, "default", AccessType::All);

        let err = core
            .add_node("default", TestHandle::new("test://a", "a"), &Client::provider("mallory"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::PermissionDenied(_)));

        let id = core
            .add_node("default", TestHandle::new("test://a", "a"), &Client::provider("ops"))
            .await
            .unwrap();
        assert_eq!(core.node_state(id), Some(NodeState::Free));
    }

    #[tokio::test]
    async fn reservation_follows_registration_order() {
        let core = core();
        add_source(&core, "default", AccessType::All);
        let a = register(&core, "default", "test://a", "a").await;
        let b = register(&core, "default", "test://b", "b").await;
        register(&core, "default", "test://c", "c").await;

        let alice = Client::user("alice");
        let got = core.reserve(&SelectionRequest::new(alice.clone(), 2));
        assert_eq!(got, Reservation::Full(vec![a, b]));

        for id in got.nodes() {
            let view = core.node(*id).unwrap();
            assert_eq!(view.state, NodeState::Busy);
            assert_eq!(view.owner, Some(alice.clone()));
        }
    }

    #[tokio::test]
    async fn short_pool_gives_partial_reservation() {
        let core = core();
        add_source(&core, "default", AccessType::All);
        let a = register(&core, "default", "test://a", "a").await;

        let got = core.reserve(&SelectionRequest::new(Client::user("x"), 3));
        assert_eq!(
            got,
            Reservation::Partial {
                nodes: vec![a],
                requested: 3
            }
        );

        let none = core.reserve(&SelectionRequest::new(Client::user("y"), 1));
        assert!(none.is_partial());
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn reservation_respects_user_access() {
        let core = core();
        add_source(&core, "private", AccessType::AdminOnly);
        let id = register(&core, "private", "test://a", "a").await;

        let user = core.reserve(&SelectionRequest::new(Client::user("x"), 1));
        assert!(user.is_empty());

        let admin = core.reserve(&SelectionRequest::new(Client::admin("root"), 1));
        assert_eq!(admin, Reservation::Full(vec![id]));
    }

    #[tokio::test]
    async fn locked_nodes_are_not_reserved() {
        let core = core();
        add_source(&core, "default", AccessType::All);
        let a = register(&core, "default", "test://a", "a").await;
        let b = register(&core, "default", "test://b", "b").await;

        let err = core.lock_nodes(&[a], &Client::user("x")).unwrap_err();
        assert!(matches!(err, FleetError::PermissionDenied(_)));

        assert_eq!(core.lock_nodes(&[a], &Client::provider("ops")).unwrap(), 1);
        let got = core.reserve(&SelectionRequest::new(Client::user("x"), 2));
        assert_eq!(got.nodes(), &[b]);

        assert_eq!(core.unlock_nodes(&[a], &Client::admin("root")).unwrap(), 1);
        let got = core.reserve(&SelectionRequest::new(Client::user("y"), 1));
        assert_eq!(got.nodes(), &[a]);
    }

    #[tokio::test]
    async fn unknown_policy_name_is_invalid() {
        let core = core();
        let err = core
            .reserve_by_name(1, "fastest", &Client::user("x"))
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidRequest(_)));
        assert!(core.reserve_by_name(1, "shuffle", &Client::user("x")).is_ok());
    }

    #[tokio::test]
    async fn co_location_keeps_reservation_in_one_cluster() {
        let core = core();
        add_source(&core, "default", AccessType::All);
        let a1 = register(&core, "default", "test://a1", "a.rack1.dc").await;
        let _b2 = register(&core, "default", "test://b2", "b.rack2.dc").await;
        let b1 = register(&core, "default", "test://b1", "b.rack1.dc").await;
        let _c3 = register(&core, "default", "test://c3", "c.rack3.dc").await;

        let got = core.reserve(
            &SelectionRequest::new(Client::user("x"), 2)
                .with_constraint(TopologyConstraint::CoLocate),
        );
        assert_eq!(got, Reservation::Full(vec![a1, b1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_reservations_have_one_winner() {
        let core = core();
        add_source(&core, "default", AccessType::All);
        let id = register(&core, "default", "test://only", "only").await;

        let winners: Vec<Reservation> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..16)
                .map(|i| {
                    let core = Arc::clone(&core);
                    scope.spawn(move || {
                        core.reserve(&SelectionRequest::new(Client::user(format!("c{i}")), 1))
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap())
                .filter(|r| !r.is_partial())
                .collect()
        });

        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].nodes(), &[id]);
        assert_eq!(core.snapshot().busy, 1);
    }

    #[tokio::test]
    async fn release_is_all_or_nothing_on_ownership() {
        let core = core();
        add_source(&core, "default", AccessType::All);
        register(&core, "default", "test://a", "a").await;
        register(&core, "default", "test://b", "b").await;

        let alice = Client::user("alice");
        let bob = Client::user("bob");
        let mine = core.reserve(&SelectionRequest::new(alice.clone(), 1)).into_nodes();
        let theirs = core.reserve(&SelectionRequest::new(bob.clone(), 1)).into_nodes();

        let both = [mine[0], theirs[0]];
        let err = core.release(&both, &alice).await.unwrap_err();
        assert!(matches!(err, FleetError::PermissionDenied(_)));
        assert_eq!(core.snapshot().busy, 2);

        assert_eq!(core.release(&both, &Client::admin("root")).await.unwrap(), 2);
        assert_eq!(core.snapshot().free, 2);

        // Already free: nothing to do.
        assert_eq!(core.release(&mine, &alice).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn release_of_unknown_node_fails() {
        let core = core();
        let err = core
            .release(&[NodeId(99)], &Client::user("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::UnknownNode(_)));
    }

    #[tokio::test]
    async fn down_detection_acts_once() {
        let core = core();
        let backend = add_source(&core, "default", AccessType::All);
        let id = register(&core, "default", "test://a", "a").await;
        core.reserve(&SelectionRequest::new(Client::user("x"), 1));

        assert!(core.detected_pinged_down_node("test://a").await);
        assert!(!core.detected_pinged_down_node("test://a").await);
        assert!(!core.detected_pinged_down_node("test://unknown").await);

        let view = core.node(id).unwrap();
        assert_eq!(view.state, NodeState::Down);
        assert_eq!(view.owner, None);
        assert_eq!(backend.terminations(), vec![("test://a".to_string(), true)]);
        assert!(core.list_alive_urls(None).is_empty());
    }

    #[tokio::test]
    async fn purge_removes_only_stale_down_nodes() {
        let core = core();
        add_source(&core, "default", AccessType::All);
        let a = register(&core, "default", "test://a", "a").await;
        let b = register(&core, "default", "test://b", "b").await;
        core.detected_pinged_down_node("test://a").await;

        assert!(core.purge_stale(Duration::from_secs(3600)).is_empty());
        assert_eq!(core.purge_stale(Duration::ZERO), vec![a]);

        assert!(core.node(a).is_none());
        assert_eq!(core.node_state(b), Some(NodeState::Free));
        assert_eq!(core.source("default").unwrap().members(), vec![b]);
        assert_eq!(core.snapshot().down, 0);
    }

    #[tokio::test]
    async fn removing_a_source_loses_its_nodes() {
        let core = core();
        let backend = add_source(&core, "gone", AccessType::All);
        add_source(&core, "kept", AccessType::All);
        register(&core, "gone", "test://a", "a").await;
        register(&core, "gone", "test://b", "b").await;
        let c = register(&core, "kept", "test://c", "c").await;
        core.reserve(&SelectionRequest::new(Client::user("x"), 1));

        core.remove_node_source("gone", false).await.unwrap();

        assert!(core.source("gone").is_none());
        assert_eq!(core.nodes().len(), 1);
        assert_eq!(core.node_state(c), Some(NodeState::Free));
        assert_eq!(backend.terminations().len(), 2);
        assert_eq!(core.list_alive_urls(Some(&["gone"][..])), Vec::<String>::new());

        let err = core.remove_node_source("gone", false).await.unwrap_err();
        assert!(matches!(err, FleetError::UnknownSource(_)));
    }

    #[tokio::test]
    async fn source_shutdown_drains_its_members() {
        let core = core();
        let backend = Arc::new(RecordingBackend::default());
        let source = NodeSource::new(
            "burst",
            Client::provider("ops"),
            backend.clone(),
            Arc::new(ThresholdDynamicPolicy::new(0, 4).with_min_free(0)),
        );
        let source = core.add_node_source(source).unwrap();
        assert!(source.is_running());

        let a = register(&core, "burst", "test://a", "a").await;
        let b = register(&core, "burst", "test://b", "b").await;
        core.reserve(&SelectionRequest::new(Client::user("x"), 1));

        source.shutdown(core.as_ref()).await.unwrap();

        assert!(!source.is_running());
        assert!(core.source("burst").is_none());
        assert!(core.node(a).is_none());
        assert!(core.node(b).is_none());
        assert!(source.members().is_empty());
        let mut urls: Vec<String> = backend.terminations().into_iter().map(|(url, _)| url).collect();
        urls.sort();
        assert_eq!(urls, vec!["test://a", "test://b"]);
    }

    #[tokio::test]
    async fn duplicate_source_is_refused() {
        let core = core();
        add_source(&core, "default", AccessType::All);
        let source = NodeSource::new(
            "default",
            Client::provider("ops"),
            Arc::new(RecordingBackend::default()),
            Arc::new(StaticPolicy::new(AccessType::All, AccessType::All)),
        );
        assert!(matches!(
            core.add_node_source(source),
            Err(FleetError::DuplicateSource(_))
        ));
    }

    #[tokio::test]
    async fn busy_node_removal_waits_for_release() {
        let core = core();
        let backend = add_source(&core, "default", AccessType::All);
        let id = register(&core, "default", "test://a", "a").await;
        let alice = Client::user("alice");
        core.reserve(&SelectionRequest::new(alice.clone(), 1));

        core.remove_node(id, &Client::provider("ops"), false)
            .await
            .unwrap();
        assert_eq!(core.node_state(id), Some(NodeState::Busy));

        assert_eq!(core.release(&[id], &alice).await.unwrap(), 1);
        assert!(core.node(id).is_none());
        assert_eq!(backend.terminations(), vec![("test://a".to_string(), false)]);
    }

    #[tokio::test]
    async fn preemptive_removal_is_forced() {
        let core = core();
        let backend = add_source(&core, "default", AccessType::All);
        let id = register(&core, "default", "test://a", "a").await;
        core.reserve(&SelectionRequest::new(Client::user("x"), 1));

        let err = core
            .remove_node(id, &Client::user("x"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::PermissionDenied(_)));

        core.remove_node(id, &Client::admin("root"), true)
            .await
            .unwrap();
        assert!(core.node(id).is_none());
        assert_eq!(backend.terminations(), vec![("test://a".to_string(), true)]);
    }

    #[tokio::test]
    async fn pool_status_reports_members() {
        let core = core();
        add_source(&core, "default", AccessType::All);
        let a = register(&core, "default", "test://a", "a").await;
        register(&core, "default", "test://b", "b").await;
        core.reserve(&SelectionRequest::new(Client::user("x"), 1));

        let status = core.pool_status("default").unwrap();
        assert_eq!(status.members.len(), 2);
        assert_eq!(status.count(NodeState::Busy), 1);
        assert_eq!(status.members[0].id, a);
        assert!(core.pool_status("nope").is_err());
    }

    #[tokio::test]
    async fn retire_only_touches_free_nodes() {
        let core = core();
        let backend = add_source(&core, "default", AccessType::All);
        let a = register(&core, "default", "test://a", "a").await;
        let b = register(&core, "default", "test://b", "b").await;
        core.reserve(&SelectionRequest::new(Client::user("x"), 1));

        assert!(matches!(
            core.retire_node(a).await,
            Err(FleetError::InconsistentTransition { .. })
        ));
        core.retire_node(b).await.unwrap();
        assert!(core.node(b).is_none());
        assert_eq!(backend.terminations(), vec![("test://b".to_string(), false)]);
    }
}
