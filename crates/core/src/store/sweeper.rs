use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ArtifactStore;
use crate::config::RetentionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSchedule {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub max_age: Duration,
}

impl From<&RetentionConfig> for SweepSchedule {
    fn from(retention: &RetentionConfig) -> Self {
        Self {
            initial_delay: retention.initial_delay(),
            interval: retention.sweep_interval(),
            max_age: retention.max_age(),
        }
    }
}

/// Run the retention sweep in the background until `cancel` fires.
pub fn spawn_sweeper(
    store: ArtifactStore,
    schedule: SweepSchedule,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            max_age_secs = schedule.max_age.as_secs(),
            interval_secs = schedule.interval.as_secs(),
            "Retention sweeper started"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Retention sweeper cancelled before first pass");
                return;
            }
            _ = tokio::time::sleep(schedule.initial_delay) => {}
        }

        loop {
            let report = store.sweep_expired(schedule.max_age).await;
            if report.removed > 0 || report.failed > 0 {
                info!(
                    scanned = report.scanned,
                    removed = report.removed,
                    failed = report.failed,
                    "Retention sweep finished"
                );
            } else {
                debug!(scanned = report.scanned, "Retention sweep found nothing to evict");
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(schedule.interval) => {}
            }
        }

        info!("Retention sweeper stopped");
    })
}
