//! The seam between node sources and the registry.
//!
//! Sources never touch node state. Everything they need from the registry
//! goes through this trait, which the core implements.

use std::sync::Arc;

use async_trait::async_trait;

use fleet_types::{FleetResult, NodeHandle, NodeId};

use crate::policy::PoolStatus;

#[async_trait]
pub trait NodeRegistrar: Send + Sync {
    /// Register a freshly acquired node into the named source.
    async fn register_node(&self, source: &str, handle: Arc<dyn NodeHandle>) -> FleetResult<NodeId>;

    /// Current members of the named source, for pool decisions.
    fn pool_status(&self, source: &str) -> FleetResult<PoolStatus>;

    /// Gracefully remove an idle node.
    async fn retire_node(&self, id: NodeId) -> FleetResult<()>;

    /// Remove the whole source and every node it provides.
    async fn remove_node_source(&self, source: &str, force: bool) -> FleetResult<()>;
}
