//! Node arena and per-node atomic transitions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use fleet_source::NodeSource;
use fleet_types::{Client, NodeHandle, NodeId, NodeInfo, NodeState, NodeView};

/// Mutable part of a node, guarded by the slot mutex.
#[derive(Debug, Clone)]
pub(crate) struct NodeRecord {
    pub state: NodeState,
    pub owner: Option<Client>,
    pub since: Instant,
    /// Remove when the owner releases it.
    pub pending_removal: bool,
    /// Skipped by reservations.
    pub locked: bool,
}

/// Why a guarded transition was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Refusal {
    /// The node was not in one of the expected states.
    State(NodeState),
    /// The caller does not own the node and is not an admin.
    NotOwner,
}

/// A registered node. The immutable identity lives outside the mutex.
pub(crate) struct NodeSlot {
    pub id: NodeId,
    pub url: String,
    pub source: String,
    pub info: NodeInfo,
    pub handle: Arc<dyn NodeHandle>,
    record: Mutex<NodeRecord>,
}

impl NodeSlot {
    pub fn new(id: NodeId, source: &str, handle: Arc<dyn NodeHandle>) -> Self {
        Self {
            id,
            url: handle.url().to_string(),
            source: source.to_string(),
            info: handle.info(),
            handle,
            record: Mutex::new(NodeRecord {
                state: NodeState::Configuring,
                owner: None,
                since: Instant::now(),
                pending_removal: false,
                locked: false,
            }),
        }
    }

    pub fn state(&self) -> NodeState {
        self.record.lock().state
    }

    pub fn record(&self) -> NodeRecord {
        self.record.lock().clone()
    }

    /// Compare-and-set: move to `to` if the current state is one of `from`
    /// and the edge exists. Returns the previous state.
    ///
    /// `Busy` takes `owner`; every other state clears it.
    pub fn transition(
        &self,
        from: &[NodeState],
        to: NodeState,
        owner: Option<&Client>,
    ) -> Result<NodeState, Refusal> {
        let mut record = self.record.lock();
        let current = record.state;
        if !from.contains(&current) || !current.can_transition_to(to) {
            return Err(Refusal::State(current));
        }
        apply(&mut record, to, owner);
        Ok(current)
    }

    /// Release a busy node held by `client`. Goes to `ToRemove` instead of
    /// `Free` when a graceful removal is pending. Returns the new state.
    pub fn release(&self, client: &Client) -> Result<NodeState, Refusal> {
        let mut record = self.record.lock();
        if record.state != NodeState::Busy {
            return Err(Refusal::State(record.state));
        }
        if !client.is_admin() && record.owner.as_ref() != Some(client) {
            return Err(Refusal::NotOwner);
        }
        let to = if record.pending_removal {
            NodeState::ToRemove
        } else {
            NodeState::Free
        };
        apply(&mut record, to, None);
        Ok(to)
    }

    /// Flag a busy node for removal on release. Returns false when the node
    /// is not busy any more.
    pub fn mark_pending_removal(&self) -> bool {
        let mut record = self.record.lock();
        if record.state == NodeState::Busy {
            record.pending_removal = true;
            true
        } else {
            false
        }
    }

    /// Set the lock flag. Returns whether it changed.
    pub fn set_locked(&self, locked: bool) -> bool {
        let mut record = self.record.lock();
        let changed = record.locked != locked;
        record.locked = locked;
        changed
    }

    pub fn view(&self) -> NodeView {
        let record = self.record.lock();
        NodeView {
            id: self.id,
            url: self.url.clone(),
            source: self.source.clone(),
            state: record.state,
            owner: record.owner.clone(),
            info: self.info.clone(),
            locked: record.locked,
        }
    }
}

fn apply(record: &mut NodeRecord, to: NodeState, owner: Option<&Client>) {
    record.state = to;
    record.owner = if to == NodeState::Busy {
        owner.cloned()
    } else {
        None
    };
    if to != NodeState::Busy {
        record.pending_removal = false;
    }
    record.since = Instant::now();
}

/// Structural part of the registry, guarded by the coarse lock.
#[derive(Default)]
pub(crate) struct Registry {
    /// Ordered by id, which is registration order.
    pub nodes: BTreeMap<NodeId, Arc<NodeSlot>>,
    pub by_url: HashMap<String, NodeId>,
    pub sources: HashMap<String, Arc<NodeSource>>,
}

impl Registry {
    pub fn insert(&mut self, slot: Arc<NodeSlot>) {
        self.by_url.insert(slot.url.clone(), slot.id);
        if let Some(source) = self.sources.get(&slot.source) {
            source.attach_node(slot.id);
        }
        self.nodes.insert(slot.id, slot);
    }

    /// Delete a node that reached a terminal state.
    pub fn delete(&mut self, id: NodeId) -> Option<Arc<NodeSlot>> {
        let slot = self.nodes.remove(&id)?;
        self.by_url.remove(&slot.url);
        if let Some(source) = self.sources.get(&slot.source) {
            source.detach_node(id);
        }
        Some(slot)
    }

    pub fn by_url(&self, url: &str) -> Option<&Arc<NodeSlot>> {
        self.by_url.get(url).and_then(|id| self.nodes.get(id))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use fleet_types::FleetResult;

    struct Stub;

    #[async_trait]
    impl NodeHandle for Stub {
        fn url(&self) -> &str {
            "stub://1"
        }

        fn info(&self) -> NodeInfo {
            NodeInfo::new("h", 1)
        }

        async fn is_reachable(&self, _timeout: Duration) -> bool {
            true
        }

        async fn terminate(&self) -> FleetResult<()> {
            Ok(())
        }
    }

    fn slot() -> NodeSlot {
        NodeSlot::new(NodeId(1), "src", Arc::new(Stub))
    }

    #[test]
    fn starts_configuring() {
        let slot = slot();
        assert_eq!(slot.state(), NodeState::Configuring);
        assert_eq!(slot.url, "stub://1");
    }

    #[test]
    fn busy_carries_owner_and_free_clears_it() {
        let slot = slot();
        let alice = Client::user("alice");
        slot.transition(&[NodeState::Configuring], NodeState::Free, None).unwrap();
        slot.transition(&[NodeState::Free], NodeState::Busy, Some(&alice)).unwrap();
        assert_eq!(slot.record().owner, Some(alice.clone()));

        assert_eq!(slot.release(&alice), Ok(NodeState::Free));
        assert_eq!(slot.record().owner, None);
    }

    #[test]
    fn cas_refuses_unexpected_state() {
        let slot = slot();
        let err = slot
            .transition(&[NodeState::Free], NodeState::Busy, Some(&Client::user("x")))
            .unwrap_err();
        assert_eq!(err, Refusal::State(NodeState::Configuring));
    }

    #[test]
    fn cas_refuses_missing_edge() {
        let slot = slot();
        // Listed as expected, but Configuring -> Busy is not an edge.
        let err = slot
            .transition(&[NodeState::Configuring], NodeState::Busy, None)
            .unwrap_err();
        assert_eq!(err, Refusal::State(NodeState::Configuring));
    }

    #[test]
    fn release_checks_owner() {
        let slot = slot();
        let alice = Client::user("alice");
        slot.transition(&[NodeState::Configuring], NodeState::Free, None).unwrap();
        slot.transition(&[NodeState::Free], NodeState::Busy, Some(&alice)).unwrap();

        assert_eq!(slot.release(&Client::user("bob")), Err(Refusal::NotOwner));
        assert_eq!(slot.release(&Client::admin("root")), Ok(NodeState::Free));
        assert_eq!(
            slot.release(&alice),
            Err(Refusal::State(NodeState::Free))
        );
    }

    #[test]
    fn pending_removal_turns_release_into_removal() {
        let slot = slot();
        let alice = Client::user("alice");
        slot.transition(&[NodeState::Configuring], NodeState::Free, None).unwrap();
        assert!(!slot.mark_pending_removal());
        slot.transition(&[NodeState::Free], NodeState::Busy, Some(&alice)).unwrap();
        assert!(slot.mark_pending_removal());
        assert_eq!(slot.release(&alice), Ok(NodeState::ToRemove));
    }

    #[test]
    fn lock_flag_reports_changes() {
        let slot = slot();
        assert!(slot.set_locked(true));
        assert!(!slot.set_locked(true));
        assert!(slot.view().locked);
        assert!(slot.set_locked(false));
    }
}
