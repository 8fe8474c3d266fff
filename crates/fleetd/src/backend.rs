//! Host-list backend: hands out pre-provisioned node addresses.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use fleet_health::HttpNodeHandle;
use fleet_source::InfrastructureBackend;
use fleet_types::{FleetError, FleetResult, NodeHandle};

/// A fixed pool of `host:port` addresses. Acquiring takes one out of the
/// pool; terminating puts it back.
pub struct HostListBackend {
    available: Mutex<VecDeque<String>>,
}

impl HostListBackend {
    pub fn new(hosts: impl IntoIterator<Item = String>) -> Self {
        Self {
            available: Mutex::new(hosts.into_iter().collect()),
        }
    }

    /// Addresses not currently handed out.
    pub fn available(&self) -> usize {
        self.available.lock().len()
    }
}

#[async_trait]
impl InfrastructureBackend for HostListBackend {
    fn kind(&self) -> &str {
        "host-list"
    }

    async fn acquire(&self) -> FleetResult<Arc<dyn NodeHandle>> {
        let address = self
            .available
            .lock()
            .pop_front()
            .ok_or_else(|| FleetError::Backend("host list exhausted".to_string()))?;
        debug!(%address, "host handed out");
        Ok(Arc::new(HttpNodeHandle::new(address)))
    }

    async fn terminate(&self, handle: Arc<dyn NodeHandle>, force: bool) -> FleetResult<()> {
        handle.terminate().await?;
        let address = handle
            .url()
            .strip_prefix("http://")
            .unwrap_or(handle.url())
            .to_string();
        debug!(%address, force, "host returned to the list");
        self.available.lock().push_back(address);
        Ok(())
    }
}
