//! Retention sweep for finished batch jobs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db;
use crate::error::{Result, ScrapeError};
use crate::store::Store;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

/// Delete terminal jobs that finished more than `retention` before `now`.
///
/// Pending and processing jobs are never touched. A record that cannot be
/// deleted is counted and skipped; the rest of the sweep carries on.
pub async fn sweep(store: &Store, retention: Duration, now: DateTime<Utc>) -> Result<SweepReport> {
    let cutoff = retention_cutoff(retention, now)?;

    let mut report = SweepReport::default();
    for id in store.expired_job_ids(cutoff).await? {
        match store.delete_job(&id).await {
            Ok(true) => {
                debug!("Removed expired job [{}]", id);
                report.removed += 1;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Could not remove job [{}]: {}", id, e);
                report.failed += 1;
            }
        }
    }

    if report.removed > 0 || report.failed > 0 {
        info!(
            "Janitor sweep: {} jobs removed, {} failed",
            report.removed, report.failed
        );
    }
    Ok(report)
}

fn retention_cutoff(retention: Duration, now: DateTime<Utc>) -> Result<String> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|r| now.checked_sub_signed(r))
        .map(db::timestamp)
        .ok_or_else(|| {
            ScrapeError::Validation(format!(
                "retention of {}s reaches past the representable time range",
                retention.as_secs()
            ))
        })
}

pub struct Janitor;

impl Janitor {
    /// Run [`sweep`] every `interval`, starting immediately.
    pub fn start(store: Store, interval: Duration, retention: Duration) -> JanitorHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = sweep(&store, retention, Utc::now()).await {
                            warn!("Janitor sweep failed: {}", e);
                        }
                    }
                }
            }
            debug!("Janitor stopped");
        });

        info!(
            "Janitor started (every {}s, retention {}s)",
            interval.as_secs(),
            retention.as_secs()
        );
        JanitorHandle { token, task }
    }
}

pub struct JanitorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!("Janitor task ended abnormally: {}", e);
        }
    }
}
