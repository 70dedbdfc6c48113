use chrono::{TimeDelta, Utc};
use std::sync::Arc;
use tracing::{error, info};

use super::{Orchestrator, StatusSnapshot};
use crate::deployment::Deployment;
use crate::types::UpdateError;

impl Orchestrator {
    fn lookup(&self, target: &str) -> Result<Arc<dyn Deployment>, UpdateError> {
        self.deployment(target)
            .ok_or_else(|| UpdateError::NotFound(format!("Updater {target} not available")))
    }

    fn reject_if_device_busy(&self, refusal: &str) -> Result<(), UpdateError> {
        if self.coordinator.device().is_device_busy() {
            return Err(UpdateError::Busy(format!("{refusal}: device is busy")));
        }
        Ok(())
    }

    fn reject_if_session_active(&self) -> Result<(), UpdateError> {
        match self.coordinator.current_update_target() {
            Some(target) => Err(UpdateError::AlreadyUpdating { target }),
            None => Ok(()),
        }
    }

    /// Conditions under which a refresh must not run.
    fn refresh_blocked(&self) -> bool {
        let device = self.coordinator.device();
        device.validation_pending()
            || self.coordinator.is_update_busy()
            || device.is_device_busy()
            || !self.is_initial_refresh_complete()
    }

    fn within_spam_window(&self) -> bool {
        let newest = self
            .deployments()
            .iter()
            .filter_map(|d| d.last_refresh_time())
            .max();
        let window = TimeDelta::from_std(self.settings.spam_window).unwrap_or(TimeDelta::MAX);
        newest.is_some_and(|refreshed| {
            refreshed
                .checked_add_signed(window)
                .map_or(true, |until| Utc::now() < until)
        })
    }

    pub async fn request_update(&self, target: &str) -> Result<bool, UpdateError> {
        self.reject_if_device_busy("Update Refused")?;
        self.reject_if_session_active()?;
        let deployment = self.lookup(target)?;
        let _lock = self.command_lock.lock().await;
        let _session = self.coordinator.try_begin_session(target)?;

        match deployment.update().await {
            Ok(changed) => Ok(changed),
            Err(err) => {
                error!(target = %target, error = %err, "Update failed");
                self.coordinator
                    .notify_update_response(format!("Error updating {target}: {err}"), true);
                Err(err)
            }
        }
    }

    pub async fn request_rollback(&self, target: &str) -> Result<bool, UpdateError> {
        self.reject_if_device_busy("Rollback Attempt Refused")?;
        self.reject_if_session_active()?;
        let deployment = self.lookup(target)?;
        let _lock = self.command_lock.lock().await;
        let _session = self
            .coordinator
            .try_begin_session(&format!("rollback_{target}"))?;

        match deployment.rollback().await {
            Ok(changed) => Ok(changed),
            Err(err) => {
                error!(target = %target, error = %err, "Rollback failed");
                self.coordinator
                    .notify_update_response(format!("Error Rolling Back {target}"), false);
                self.coordinator.notify_update_response(err.to_string(), true);
                Err(err)
            }
        }
    }

    pub async fn request_recovery(
        &self,
        target: &str,
        hard: bool,
        update_deps: bool,
    ) -> Result<(), UpdateError> {
        self.reject_if_device_busy("Recovery Attempt Refused")?;
        self.reject_if_session_active()?;
        let deployment = self.lookup(target)?;
        if !deployment.supports_recovery() {
            return Err(UpdateError::Unsupported(format!(
                "Updater {target} is not a Git Repo Type"
            )));
        }
        let _lock = self.command_lock.lock().await;
        let _session = self
            .coordinator
            .try_begin_session(&format!("recover_{target}"))?;

        if let Err(err) = deployment.recover(hard, update_deps).await {
            error!(target = %target, error = %err, "Recovery failed");
            self.coordinator
                .notify_update_response(format!("Error Recovering {target}"), false);
            self.coordinator.notify_update_response(err.to_string(), true);
            return Err(err);
        }
        Ok(())
    }

    /// Current status, refreshing first when forced and nothing prevents it.
    pub async fn request_status(self: &Arc<Self>, force_refresh: bool) -> StatusSnapshot {
        let mut refresh = force_refresh;
        if refresh && self.refresh_blocked() {
            info!("Refresh request bypassed, updater busy");
            refresh = false;
        }

        let lock = if refresh {
            Some(self.command_lock.lock().await)
        } else {
            None
        };
        if refresh && self.within_spam_window() {
            info!("Refresh request bypassed, last refresh is too recent");
            refresh = false;
        }
        if refresh {
            for deployment in self.deployments() {
                deployment.refresh().await;
            }
        }
        let snapshot = self.snapshot();
        drop(lock);

        if refresh {
            self.schedule_refreshed_broadcast();
        }
        snapshot
    }

    /// Refresh one deployment, or all of them when `name` is `None`.
    pub async fn request_refresh(
        self: &Arc<Self>,
        name: Option<&str>,
    ) -> Result<StatusSnapshot, UpdateError> {
        if let Some(name) = name {
            if self.deployment(name).is_none() {
                return Err(UpdateError::NotFound(format!(
                    "No updater registered for '{name}'"
                )));
            }
        }
        if self.refresh_blocked() {
            return Err(UpdateError::Busy(
                "Server is busy, cannot perform refresh".to_string(),
            ));
        }

        let lock = self.command_lock.lock().await;
        for deployment in self.deployments() {
            if name.map_or(true, |name| deployment.name() == name) {
                deployment.refresh().await;
            }
        }
        let snapshot = self.snapshot();
        drop(lock);

        self.schedule_refreshed_broadcast();
        Ok(snapshot)
    }
}
