//! Reaper loop: detects children that died without a `Stop` and, when the
//! service opted into `auto_restart`, restarts them with exponential backoff
//! and a retry cap to avoid crash-looping.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::service::Status;

use super::logs;
use super::manager::ServiceManager;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const MAX_RESTARTS: u32 = 10;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

pub struct Reaper {
    manager: Arc<ServiceManager>,
    check_interval: Duration,
}

impl Reaper {
    pub fn new(manager: Arc<ServiceManager>) -> Self {
        Self {
            manager,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Run the check loop. Spawned as a background task for the lifetime of
    /// the daemon.
    pub async fn run(self) {
        info!("Reaper started (interval: {:?})", self.check_interval);
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.check_all().await;
        }
    }

    /// One pass over all registry entries.
    pub(crate) async fn check_all(&self) {
        for (name, cell) in self.manager.cells().await {
            let mut process = cell.process.lock().await;
            if let Err(e) =
                logs::enforce_policy(self.manager.paths(), &name, &process.service.log)
            {
                warn!("Log maintenance for '{}' failed: {}", name, e);
            }
            if !process.has_live_handle() {
                continue;
            }
            if !process.reap_if_exited() {
                debug!("Service '{}' (pid {}) is healthy", name, process.service.pid);
                continue;
            }

            if let Err(e) = self.manager.store().update(&process.service) {
                warn!("Failed to persist death of '{}': {}", name, e);
            }

            if !process.service.auto_restart {
                continue;
            }
            if process.restarts >= MAX_RESTARTS {
                warn!(
                    "Service '{}' hit the restart cap ({}), leaving it failed",
                    name, MAX_RESTARTS
                );
                continue;
            }

            let backoff = backoff_for(process.restarts);
            drop(process);
            info!("Restarting '{}' in {:?}", name, backoff);

            let manager = Arc::clone(&self.manager);
            let cell = Arc::clone(&cell);
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                let mut process = cell.process.lock().await;
                // The death may have been superseded by an explicit Start,
                // Stop or Delete while we slept. A deleted service is gone
                // from the registry even though this task still holds its
                // cell; it must never be brought back.
                if !manager.contains(&name).await {
                    return;
                }
                if process.has_live_handle() || process.service.status != Status::Failed {
                    return;
                }
                process.restarts += 1;
                match process.start(manager.paths()) {
                    Ok(pid) => info!("Auto-restarted '{}' (pid {})", name, pid),
                    Err(e) => warn!("Auto-restart of '{}' failed: {}", name, e),
                }
                if let Err(e) = manager.store().update(&process.service) {
                    warn!("Failed to persist restart of '{}': {}", name, e);
                }
            });
        }
    }
}

fn backoff_for(restarts: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << restarts.min(6));
    exp.min(BACKOFF_CAP)
}
