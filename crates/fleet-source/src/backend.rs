//! The infrastructure backend contract.
//!
//! Concrete backends (SSH launchers, cloud APIs, local processes) live
//! outside this crate. New kinds implement this trait and are injected into
//! a `NodeSource`.

use std::sync::Arc;

use async_trait::async_trait;

use fleet_types::{FleetResult, NodeHandle};

#[async_trait]
pub trait InfrastructureBackend: Send + Sync {
    /// Short name of the backend kind, for logs.
    fn kind(&self) -> &str;

    /// Provision one node and return its handle.
    ///
    /// Failures should be reported as `FleetError::Acquisition`; the caller
    /// enforces its own timeout.
    async fn acquire(&self) -> FleetResult<Arc<dyn NodeHandle>>;

    /// Release the resource behind `handle`.
    ///
    /// With `force` the node is confirmed down or preempted and must not be
    /// drained. Without it the node is idle and may be shut down gracefully.
    async fn terminate(&self, handle: Arc<dyn NodeHandle>, force: bool) -> FleetResult<()> {
        let _ = force;
        handle.terminate().await
    }
}
