//! Housekeeping scheduler.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use fleet_core::RmCore;
use fleet_types::{FleetError, FleetResult, NodeId};

#[derive(Debug, Clone)]
pub struct HousekeepingSettings {
    /// Time a node may stay `Down` before it is purged.
    pub ttl: Duration,
    /// Period of the recurring job.
    pub period: Duration,
    /// Cron schedule (with a seconds field); replaces `period` when set.
    pub cron: Option<Schedule>,
}

impl Default for HousekeepingSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            period: Duration::from_secs(60),
            cron: None,
        }
    }
}

impl HousekeepingSettings {
    /// Run the job on a cron expression such as `"0 */5 * * * *"`.
    pub fn with_cron(mut self, expr: &str) -> FleetResult<Self> {
        let schedule = Schedule::from_str(expr)
            .map_err(|e| FleetError::InvalidRequest(format!("cron expression {expr:?}: {e}")))?;
        self.cron = Some(schedule);
        Ok(self)
    }
}

struct Job {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Runs `RmCore::purge_stale` on a fixed period or a cron schedule.
pub struct HousekeepingScheduler {
    core: Arc<RmCore>,
    settings: HousekeepingSettings,
    job: Mutex<Option<Job>>,
}

impl HousekeepingScheduler {
    pub fn new(core: Arc<RmCore>, settings: HousekeepingSettings) -> Self {
        Self {
            core,
            settings,
            job: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &HousekeepingSettings {
        &self.settings
    }

    /// Schedule the recurring purge. A second call while started is a
    /// no-op; returns whether a job was scheduled.
    pub fn start(&self) -> bool {
        let mut job = self.job.lock();
        if job.is_some() {
            debug!("housekeeping already started");
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let core = Arc::clone(&self.core);
        let settings = self.settings.clone();
        let handle = tokio::spawn(run_job(core, settings, shutdown_rx));
        *job = Some(Job {
            handle,
            shutdown_tx,
        });

        info!(
            ttl = ?self.settings.ttl,
            period = ?self.settings.period,
            cron = self.settings.cron.is_some(),
            "housekeeping started"
        );
        true
    }

    /// Deschedule the job and wait for it to finish. No-op when not started.
    pub async fn stop(&self) {
        let job = self.job.lock().take();
        let Some(job) = job else {
            return;
        };
        let _ = job.shutdown_tx.send(true);
        if let Err(e) = job.handle.await {
            warn!(error = %e, "housekeeping job did not exit cleanly");
        }
        info!("housekeeping stopped");
    }

    /// Number of scheduled jobs: 0 or 1.
    pub fn job_count(&self) -> usize {
        usize::from(self.job.lock().is_some())
    }

    /// Run one purge now.
    pub fn run_once(&self) -> Vec<NodeId> {
        self.core.purge_stale(self.settings.ttl)
    }
}

async fn run_job(core: Arc<RmCore>, settings: HousekeepingSettings, shutdown: watch::Receiver<bool>) {
    match settings.cron {
        Some(schedule) => run_cron_job(core, settings.ttl, schedule, shutdown).await,
        None => run_periodic_job(core, settings.ttl, settings.period, shutdown).await,
    }
}

async fn run_periodic_job(
    core: Arc<RmCore>,
    ttl: Duration,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => purge(&core, ttl),
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_cron_job(
    core: Arc<RmCore>,
    ttl: Duration,
    schedule: Schedule,
    mut shutdown: watch::Receiver<bool>,
) {
    // Fire times are taken after the previous one, never after "now", so a
    // tick that wakes early does not run twice.
    let mut last = Utc::now();
    loop {
        let Some(next) = schedule.after(&last).next() else {
            info!("cron schedule has no further runs, housekeeping idle");
            let _ = shutdown.changed().await;
            break;
        };
        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                last = next;
                purge(&core, ttl);
            }
            _ = shutdown.changed() => break,
        }
    }
}

fn purge(core: &RmCore, ttl: Duration) {
    let purged = core.purge_stale(ttl);
    if !purged.is_empty() {
        debug!(?purged, "housekeeping tick");
    }
}
