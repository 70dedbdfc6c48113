use chrono::{Local, Timelike};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::Orchestrator;

const AUTO_REFRESH_PERIOD: Duration = Duration::from_secs(60 * 60);

impl Orchestrator {
    pub(super) fn start_refresh_timer(self: &Arc<Self>) {
        let orchestrator = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AUTO_REFRESH_PERIOD);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                orchestrator.auto_refresh_tick().await;
            }
        });
        self.store_refresh_task(task);
    }

    pub(super) fn schedule_initial_refresh(self: &Arc<Self>) {
        let orchestrator = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            if let Some(orchestrator) = orchestrator.upgrade() {
                orchestrator.auto_refresh_tick().await;
            }
        });
        self.store_refresh_task(task);
    }

    fn store_refresh_task(&self, task: tokio::task::JoinHandle<()>) {
        let previous = self
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub async fn auto_refresh_tick(&self) -> bool {
        self.auto_refresh_at(Local::now().hour()).await
    }

    /// One scheduled refresh pass as if run at local `hour`. Returns whether
    /// any deployment refreshed.
    pub async fn auto_refresh_at(&self, hour: u32) -> bool {
        let initial_pass = !self.is_initial_refresh_complete();
        let device = self.coordinator.device();
        if !initial_pass {
            if hour >= self.settings.refresh_window_end_hour {
                return false;
            }
            if device.is_device_busy() {
                debug!("Device busy, skipping auto refresh");
                return false;
            }
        }
        if device.validation_pending() {
            info!("Install validation pending, bypassing auto refresh");
            self.mark_initial_refresh_complete();
            return false;
        }

        let lock = self.command_lock.lock().await;
        let mut refreshed = false;
        for deployment in self.deployments() {
            if deployment.needs_refresh(initial_pass) {
                deployment.refresh().await;
                refreshed = true;
            }
        }
        self.mark_initial_refresh_complete();
        drop(lock);

        if refreshed {
            let snapshot = self.snapshot();
            self.coordinator.notify_update_refreshed(&snapshot);
        }
        refreshed
    }
}
