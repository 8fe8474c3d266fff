//! fleetd.toml configuration parser.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use fleet_core::CoreSettings;
use fleet_health::HealthSettings;
use fleet_housekeeping::HousekeepingSettings;
use fleet_source::{NodeSourcePolicy, StaticPolicy, ThresholdDynamicPolicy};
use fleet_types::AccessType;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub core: CoreConfig,
    pub health: HealthConfig,
    pub housekeeping: HousekeepingConfig,
    pub topology: TopologyConfig,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Deadline for the reachability probe that confirms a registration.
    pub registration_timeout: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            registration_timeout: "10s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval: String,
    pub timeout: String,
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: "5s".to_string(),
            timeout: "2s".to_string(),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    pub ttl: String,
    /// Period of the purge job.
    pub period: String,
    /// Cron expression with a seconds field; overrides `period`.
    pub cron: Option<String>,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            ttl: "10m".to_string(),
            period: "1m".to_string(),
            cron: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub threshold: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self { threshold: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_user_access")]
    pub user_access: String,
    #[serde(default = "default_provider_access")]
    pub provider_access: String,
    /// Node addresses (host:port) served by this source.
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub policy: PolicyConfig,
}

fn default_owner() -> String {
    "admin".to_string()
}

fn default_user_access() -> String {
    "all".to_string()
}

fn default_provider_access() -> String {
    "owner_only".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    Static,
    ThresholdDynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub kind: PolicyKind,
    pub min_nodes: usize,
    /// Defaults to the number of hosts.
    pub max_nodes: Option<usize>,
    pub min_free: usize,
    pub nice_time: String,
    pub check_interval: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            kind: PolicyKind::Static,
            min_nodes: 0,
            max_nodes: None,
            min_free: 1,
            nice_time: "60s".to_string(),
            check_interval: "10s".to_string(),
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that parse but cannot run.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.core_settings()?;
        self.health_settings()?;
        self.housekeeping_settings()?;

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.as_str()) {
                bail!("duplicate node source {:?}", source.name);
            }
            source.access()?;
            source.check_interval()?;
            source.build_policy()?;
        }
        Ok(())
    }

    pub fn core_settings(&self) -> anyhow::Result<CoreSettings> {
        Ok(CoreSettings {
            registration_timeout: parse_duration(&self.core.registration_timeout)?,
            topology_threshold: self.topology.threshold,
        })
    }

    pub fn health_settings(&self) -> anyhow::Result<HealthSettings> {
        Ok(HealthSettings {
            interval: parse_duration(&self.health.interval)?,
            timeout: parse_duration(&self.health.timeout)?,
            failure_threshold: self.health.failure_threshold.max(1),
        })
    }

    pub fn housekeeping_settings(&self) -> anyhow::Result<HousekeepingSettings> {
        let period = parse_duration(&self.housekeeping.period)?;
        if period.is_zero() {
            bail!("housekeeping period must be positive");
        }
        let settings = HousekeepingSettings {
            ttl: parse_duration(&self.housekeeping.ttl)?,
            period,
            cron: None,
        };
        match &self.housekeeping.cron {
            Some(expr) => Ok(settings.with_cron(expr)?),
            None => Ok(settings),
        }
    }
}

impl SourceConfig {
    /// User and provider access types.
    pub fn access(&self) -> anyhow::Result<(AccessType, AccessType)> {
        let user = self
            .user_access
            .parse()
            .map_err(|e: String| anyhow::anyhow!("source {}: {e}", self.name))?;
        let provider = self
            .provider_access
            .parse()
            .map_err(|e: String| anyhow::anyhow!("source {}: {e}", self.name))?;
        Ok((user, provider))
    }

    pub fn check_interval(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.policy.check_interval)
    }

    pub fn build_policy(&self) -> anyhow::Result<Arc<dyn NodeSourcePolicy>> {
        let (user, provider) = self.access()?;
        let policy: Arc<dyn NodeSourcePolicy> = match self.policy.kind {
            PolicyKind::Static => Arc::new(StaticPolicy::new(user, provider)),
            PolicyKind::ThresholdDynamic => {
                let max = self.policy.max_nodes.unwrap_or(self.hosts.len());
                if self.policy.min_nodes > max {
                    bail!(
                        "source {}: min_nodes {} exceeds max_nodes {max}",
                        self.name,
                        self.policy.min_nodes
                    );
                }
                Arc::new(
                    ThresholdDynamicPolicy::new(self.policy.min_nodes, max)
                        .with_min_free(self.policy.min_free)
                        .with_nice_time(parse_duration(&self.policy.nice_time)?)
                        .with_access(user, provider),
                )
            }
        };
        Ok(policy)
    }
}

/// Parse a duration string like "5s", "500ms", "2m", "1h". A bare number is
/// seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let parsed = if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().map(Duration::from_millis).ok()
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().map(Duration::from_secs).ok()
    } else if let Some(mins) = s.strip_suffix('m') {
        scaled(mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        scaled(hours, 3600)
    } else {
        s.parse::<u64>().map(Duration::from_secs).ok()
    };
    parsed.with_context(|| format!("invalid duration {s:?}"))
}

fn scaled(value: &str, unit_secs: u64) -> Option<Duration> {
    let n = value.trim().parse::<u64>().ok()?;
    n.checked_mul(unit_secs).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_source::SourceKind;

    #[test]
    fn empty_config_uses_defaults() {
        let config = FleetConfig::parse("").unwrap();
        let health = config.health_settings().unwrap();
        assert_eq!(health.interval, Duration::from_secs(5));
        assert_eq!(health.timeout, Duration::from_secs(2));
        assert_eq!(health.failure_threshold, 3);

        let hk = config.housekeeping_settings().unwrap();
        assert_eq!(hk.ttl, Duration::from_secs(600));
        assert_eq!(hk.period, Duration::from_secs(60));

        assert_eq!(config.core_settings().unwrap().topology_threshold, 2);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn parses_sources() {
        let config = FleetConfig::parse(
            r#"
[health]
failure_threshold = 5

[[sources]]
name = "Default"
hosts = ["10.0.0.1:9000", "10.0.0.2:9000"]

[[sources]]
name = "burst"
owner = "ops"
user_access = "admin_only"
hosts = ["10.0.1.1:9000"]
[sources.policy]
kind = "threshold_dynamic"
min_nodes = 1
nice_time = "30s"
"#,
        )
        .unwrap();

        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.sources.len(), 2);

        let default = &config.sources[0];
        assert_eq!(default.owner, "admin");
        assert_eq!(
            default.access().unwrap(),
            (AccessType::All, AccessType::OwnerOnly)
        );
        assert_eq!(default.build_policy().unwrap().kind(), SourceKind::Static);

        let burst = &config.sources[1];
        assert_eq!(burst.policy.kind, PolicyKind::ThresholdDynamic);
        assert_eq!(burst.build_policy().unwrap().kind(), SourceKind::Dynamic);
        assert_eq!(burst.check_interval().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(FleetConfig::parse("[health]\ninterval = \"soon\"").is_err());
        assert!(FleetConfig::parse("[housekeeping]\nperiod = \"0s\"").is_err());
        assert!(
            FleetConfig::parse("[[sources]]\nname = \"a\"\nuser_access = \"everyone\"").is_err()
        );
        assert!(FleetConfig::parse("[[sources]]\nname = \"a\"\n[[sources]]\nname = \"a\"").is_err());
        assert!(
            FleetConfig::parse(
                "[[sources]]\nname = \"a\"\n[sources.policy]\nkind = \"threshold_dynamic\"\nmin_nodes = 3\nmax_nodes = 1"
            )
            .is_err()
        );
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration(&format!("{}h", u64::MAX)).is_err());
        assert!(parse_duration(&format!("{}m", u64::MAX / 2)).is_err());
    }

    #[test]
    fn housekeeping_cron_overrides_period() {
        let config = FleetConfig::parse(
            r#"
[housekeeping]
ttl = "5m"
cron = "0 */5 * * * *"
"#,
        )
        .unwrap();
        let hk = config.housekeeping_settings().unwrap();
        assert_eq!(hk.ttl, Duration::from_secs(300));
        assert!(hk.cron.is_some());

        let bad = FleetConfig::parse("[housekeeping]\ncron = \"whenever\"\n");
        assert!(bad.is_err());
    }
}
