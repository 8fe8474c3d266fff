//! Probe results, per-node failure tracking, and the HTTP probe.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

/// Result of a single reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The node answered.
    Healthy,
    /// The node answered with an error status.
    Unhealthy,
    /// The probe could not complete (connection error or timeout).
    Failed,
}

/// Health of a node as seen by its tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    /// Not probed yet.
    #[default]
    Unknown,
    Healthy,
    /// Failed at least `unhealthy_threshold` probes in a row.
    Unhealthy,
}

/// Tracks consecutive probe results for a single node.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Failures in a row before the node is unhealthy.
    unhealthy_threshold: u32,
    /// Successes in a row to recover from unhealthy.
    healthy_threshold: u32,
}

impl HealthTracker {
    /// A tracker that turns unhealthy after `unhealthy_threshold` failures
    /// and recovers on the first success.
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self::with_thresholds(unhealthy_threshold, 1)
    }

    pub fn with_thresholds(unhealthy_threshold: u32, healthy_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
        }
    }

    /// Fold one probe result into the counters and return the status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        let next = match result {
            ProbeResult::Healthy => self.on_success(),
            ProbeResult::Unhealthy | ProbeResult::Failed => self.on_failure(),
        };

        match (self.status, next) {
            (HealthStatus::Unhealthy, HealthStatus::Healthy) => {
                debug!(successes = self.consecutive_successes, "node answering again");
            }
            (previous, HealthStatus::Unhealthy) if previous != HealthStatus::Unhealthy => {
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.unhealthy_threshold,
                    "node crossed the failure threshold"
                );
            }
            _ => {}
        }
        self.status = next;
        next
    }

    fn on_success(&mut self) -> HealthStatus {
        self.consecutive_failures = 0;
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        if self.consecutive_successes >= self.healthy_threshold {
            HealthStatus::Healthy
        } else {
            self.status
        }
    }

    fn on_failure(&mut self) -> HealthStatus {
        self.consecutive_successes = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.unhealthy_threshold {
            HealthStatus::Unhealthy
        } else {
            self.status
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// `GET http://{address}{path}` with a deadline.
///
/// 2xx is `Healthy`, any other status `Unhealthy`. Connection errors and
/// the deadline passing are `Failed`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    match tokio::time::timeout(timeout, fetch_status(address, &uri)).await {
        Ok(Ok(status)) if status.is_success() => ProbeResult::Healthy,
        Ok(Ok(status)) => {
            debug!(%status, %uri, "probe answered with an error status");
            ProbeResult::Unhealthy
        }
        Ok(Err(reason)) => {
            debug!(%reason, %uri, "probe failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(%uri, ?timeout, "probe deadline passed");
            ProbeResult::Failed
        }
    }
}

/// One HTTP/1 exchange over a fresh connection.
async fn fetch_status(address: &str, uri: &str) -> Result<http::StatusCode, String> {
    let stream = tokio::net::TcpStream::connect(address)
        .await
        .map_err(|e| format!("connect: {e}"))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| format!("handshake: {e}"))?;
    tokio::spawn(conn);

    let request = http::Request::get(uri)
        .header(http::header::HOST, address)
        .header(http::header::USER_AGENT, "fleet-health/0.1")
        .body(Empty::<Bytes>::new())
        .map_err(|e| format!("request: {e}"))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| format!("send: {e}"))?;
    Ok(response.status())
}
