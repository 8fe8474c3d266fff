//! The node handle contract.
//!
//! A `NodeHandle` is an opaque reference to a remote worker process. The
//! registry and node sources never look inside it; they only ask whether it
//! is reachable and, on removal, ask it to terminate.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::FleetResult;
use crate::types::NodeInfo;

#[async_trait]
pub trait NodeHandle: Send + Sync {
    /// Unique URL of the remote process. Used as the lookup key for
    /// health reports.
    fn url(&self) -> &str;

    /// Host metadata used for topology grouping.
    fn info(&self) -> NodeInfo;

    /// Probe the remote process. Implementations must return within
    /// `timeout`; callers still wrap the call in their own timeout.
    async fn is_reachable(&self, timeout: Duration) -> bool;

    /// Stop the remote process.
    async fn terminate(&self) -> FleetResult<()>;
}
