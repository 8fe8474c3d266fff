//! FleetContext — every subsystem of the daemon, built once at start.

use std::sync::Arc;

use tracing::{info, warn};

use fleet_core::{CoreSettings, RmCore};
use fleet_health::{HealthMonitor, HealthSettings, HttpNodeHandle};
use fleet_housekeeping::{HousekeepingScheduler, HousekeepingSettings};
use fleet_source::{NodeSource, SourceSettings};
use fleet_types::{Client, FleetResult};

use crate::backend::HostListBackend;
use crate::config::{FleetConfig, PolicyKind};

/// The registry together with its background actors.
pub struct FleetContext {
    pub core: Arc<RmCore>,
    pub health: Arc<HealthMonitor>,
    pub housekeeping: HousekeepingScheduler,
    admin: Client,
}

impl FleetContext {
    pub fn new(
        core: CoreSettings,
        health: HealthSettings,
        housekeeping: HousekeepingSettings,
    ) -> Self {
        let core = Arc::new(RmCore::new(core));
        Self {
            health: Arc::new(HealthMonitor::new(Arc::clone(&core), health)),
            housekeeping: HousekeepingScheduler::new(Arc::clone(&core), housekeeping),
            core,
            admin: Client::admin("fleetd"),
        }
    }

    /// Build the context and every configured node source. Static sources
    /// register their hosts right away; dynamic ones start acquiring.
    pub async fn from_config(config: &FleetConfig) -> anyhow::Result<Self> {
        let ctx = Self::new(
            config.core_settings()?,
            config.health_settings()?,
            config.housekeeping_settings()?,
        );

        for sc in &config.sources {
            let policy = sc.build_policy()?;
            let settings = SourceSettings {
                check_interval: sc.check_interval()?,
                ..SourceSettings::default()
            };
            let is_static = sc.policy.kind == PolicyKind::Static;
            let pool = if is_static { Vec::new() } else { sc.hosts.clone() };

            let source = NodeSource::new(
                sc.name.clone(),
                Client::provider(sc.owner.clone()),
                Arc::new(HostListBackend::new(pool)),
                policy,
            )
            .with_settings(settings);
            let source = ctx.add_source(source)?;

            if is_static {
                for host in &sc.hosts {
                    let handle = Arc::new(HttpNodeHandle::new(host.clone()));
                    if let Err(e) = source.internal_add_node(ctx.core.as_ref(), handle).await {
                        warn!(source = %sc.name, %host, error = %e, "configured host not registered");
                    }
                }
            }
        }

        info!(sources = config.sources.len(), "fleet context built");
        Ok(ctx)
    }

    pub fn add_source(&self, source: NodeSource) -> FleetResult<Arc<NodeSource>> {
        self.core.add_node_source(source)
    }

    /// The client the daemon acts as for administrative operations.
    pub fn admin(&self) -> &Client {
        &self.admin
    }

    /// Start the health monitor and the housekeeping job.
    pub fn start(&self) {
        self.health.start();
        self.housekeeping.start();
    }

    /// Stop every background task. Registered nodes are left as they are.
    pub async fn shutdown(&self) {
        self.health.stop().await;
        self.housekeeping.stop().await;
        self.core.shutdown().await;
        info!("fleet context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_sources_from_config() {
        let config = FleetConfig::parse(
            r#"
[core]
registration_timeout = "200ms"

[[sources]]
name = "Default"
hosts = ["127.0.0.1:1"]

[[sources]]
name = "burst"
[sources.policy]
kind = "threshold_dynamic"
max_nodes = 0
check_interval = "1h"
"#,
        )
        .unwrap();

        let ctx = FleetContext::from_config(&config).await.unwrap();
        let names: Vec<String> = ctx
            .core
            .sources()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["Default", "burst"]);

        // Nothing listens on port 1: the host registers as down.
        let snapshot = ctx.core.snapshot();
        assert_eq!(snapshot.down, 1);
        assert!(ctx.core.source("burst").unwrap().is_running());

        ctx.start();
        assert!(ctx.health.is_running());
        assert_eq!(ctx.housekeeping.job_count(), 1);

        ctx.shutdown().await;
        assert!(!ctx.health.is_running());
        assert_eq!(ctx.housekeeping.job_count(), 0);
        assert!(!ctx.core.source("burst").unwrap().is_running());
    }
}
