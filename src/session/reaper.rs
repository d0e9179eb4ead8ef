//! Background sweep that applies the registry's idle-timeout and retention policy.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::SessionRegistry;

/// Idle and retention windows applied on every sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Active sessions with no activity for this long are ended
    pub idle_timeout: Duration,
    /// Ended sessions are purged this long after `ended_at`
    pub retention: Duration,
}

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub purged: usize,
}

/// Spawn the reaper loop. The returned handle is aborted on shutdown.
pub fn spawn_reaper(registry: Arc<SessionRegistry>, policy: RetentionPolicy, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing can be stale at startup.
        ticker.tick().await;

        info!(
            idle_timeout_secs = policy.idle_timeout.as_secs(),
            retention_secs = policy.retention.as_secs(),
            "Session reaper started"
        );

        loop {
            ticker.tick().await;
            sweep_once(&registry, &policy);
        }
    })
}

fn sweep_once(registry: &SessionRegistry, policy: &RetentionPolicy) -> SweepReport {
    let report = registry.sweep(Utc::now(), policy);
    if report != SweepReport::default() {
        info!(expired = report.expired, purged = report.purged, "Session sweep completed");
    } else {
        debug!("Session sweep found nothing to do");
    }
    report
}
