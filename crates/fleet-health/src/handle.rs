//! Node handle reached over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use fleet_types::{FleetResult, NodeHandle, NodeInfo};

use crate::checker::{ProbeResult, http_probe};

/// A node process that serves a health endpoint at `address`.
#[derive(Debug, Clone)]
pub struct HttpNodeHandle {
    url: String,
    address: String,
    health_path: String,
    info: NodeInfo,
}

impl HttpNodeHandle {
    /// Handle for `address` (host:port) probed at `/healthz`.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let hostname = match address.rsplit_once(':') {
            Some((host, _port)) => host.to_string(),
            None => address.clone(),
        };
        Self {
            url: format!("http://{address}"),
            info: NodeInfo::new(hostname, 1),
            health_path: "/healthz".to_string(),
            address,
        }
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.info.capacity = capacity;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl NodeHandle for HttpNodeHandle {
    fn url(&self) -> &str {
        &self.url
    }

    fn info(&self) -> NodeInfo {
        self.info.clone()
    }

    async fn is_reachable(&self, timeout: Duration) -> bool {
        http_probe(&self.address, &self.health_path, timeout).await == ProbeResult::Healthy
    }

    async fn terminate(&self) -> FleetResult<()> {
        // The process is not ours to kill; forgetting the handle is enough.
        debug!(url = %self.url, "http node released");
        Ok(())
    }
}
