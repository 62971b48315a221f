//! Periodic backups driven by the `backup` section of server_config.json.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::BackupManager;

/// How often a disabled schedule is re-read.
const RECHECK_INTERVAL: Duration = Duration::from_secs(60);
const MIN_INTERVAL: Duration = Duration::from_secs(60);

pub struct BackupScheduler {
    manager: BackupManager,
}

impl BackupScheduler {
    pub fn new(manager: BackupManager) -> Self {
        Self { manager }
    }

    /// Hours (fractional allowed) to a sleep interval, never below one minute.
    pub fn interval_for(frequency_hours: f64) -> Duration {
        if !frequency_hours.is_finite() || frequency_hours <= 0.0 {
            return MIN_INTERVAL;
        }
        Duration::from_secs_f64(frequency_hours * 3600.0).max(MIN_INTERVAL)
    }

    /// The schedule is re-read from disk every cycle, so edits apply after the
    /// current wait.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let name = self.manager.instance().name().to_string();
            tracing::debug!("[{}] Backup scheduler started", name);
            loop {
                let schedule = self.manager.instance().load_config().backup_schedule();
                let wait = if schedule.enabled {
                    Self::interval_for(schedule.frequency)
                } else {
                    RECHECK_INTERVAL
                };

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                let schedule = self.manager.instance().load_config().backup_schedule();
                if !schedule.enabled {
                    continue;
                }
                match self.manager.create(None).await {
                    Ok(info) => tracing::info!("[{}] Scheduled backup '{}' done", name, info.name),
                    Err(e) => {
                        tracing::error!("[{}] Scheduled backup failed: {}", name, e);
                        continue;
                    }
                }
                if let Err(e) = self.manager.prune(schedule.max_backups).await {
                    tracing::warn!("[{}] Backup pruning failed: {}", name, e);
                }
            }
            tracing::debug!("[{}] Backup scheduler stopped", name);
        })
    }
}
