//! Fleet-wide update: packages, clients, control process, then host.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use super::{is_core, Orchestrator};
use crate::coordinator::FULL_UPDATE_TARGET;
use crate::deployment::{Deployment, DeploymentKind, CONTROL, HOST, PACKAGES};
use crate::types::UpdateError;

/// Display name of the control process in progress messages.
const CONTROL_DISPLAY_NAME: &str = "Klippy";

/// Outcome of a full update. Phase failures end up here rather than as errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FullUpdateReport {
    pub failed_phase: Option<String>,
    pub error: Option<String>,
}

impl FullUpdateReport {
    pub fn succeeded(&self) -> bool {
        self.failed_phase.is_none()
    }
}

type PhaseError = (String, UpdateError);

async fn update_phase(deployment: &Arc<dyn Deployment>) -> Result<bool, PhaseError> {
    deployment
        .update()
        .await
        .map_err(|err| (deployment.name().to_string(), err))
}

impl Orchestrator {
    /// Waits for any running session, then updates every deployment in turn.
    pub async fn request_full_update(&self) -> Result<FullUpdateReport, UpdateError> {
        if self.coordinator.device().is_device_busy() {
            return Err(UpdateError::Busy(
                "Update Refused: device is busy".to_string(),
            ));
        }
        let _session = self.coordinator.begin_session(FULL_UPDATE_TARGET).await;
        let _lock = self.command_lock.lock().await;
        self.coordinator
            .notify_update_response("Preparing full software update...", false);

        let report = match self.run_phases().await {
            Ok(()) => {
                info!("Full update complete");
                self.coordinator.set_full_complete(true);
                self.coordinator
                    .notify_update_response("Full Update Complete", true);
                FullUpdateReport::default()
            }
            Err((phase, err)) => {
                error!(phase = %phase, error = %err, "Full update failed");
                self.coordinator.set_full_complete(true);
                self.coordinator
                    .notify_update_response(format!("Error updating {phase}: {err}"), true);
                FullUpdateReport {
                    failed_phase: Some(phase),
                    error: Some(err.to_string()),
                }
            }
        };
        Ok(report)
    }

    async fn run_phases(&self) -> Result<(), PhaseError> {
        if let Some(packages) = self.deployment(PACKAGES) {
            update_phase(&packages).await?;
        }

        for client in self.deployments().into_iter().filter(|d| !is_core(d.name())) {
            update_phase(&client).await?;
        }

        if let Some(control) = self.deployment(CONTROL) {
            if control.kind() == DeploymentKind::Service {
                self.update_control(&control)
                    .await
                    .map_err(|err| (CONTROL.to_string(), err))?;
            }
        }

        if let Some(host) = self.deployment(HOST) {
            update_phase(&host).await?;
            if self.coordinator.needs_service_restart(HOST) {
                host.restart_service()
                    .await
                    .map_err(|err| (HOST.to_string(), err))?;
            }
        }
        Ok(())
    }

    async fn update_control(&self, control: &Arc<dyn Deployment>) -> Result<(), UpdateError> {
        let signal = Arc::new(Notify::new());
        *self.reconnect_slot() = Some(signal.clone());
        let result = self.update_and_await_reconnect(control, &signal).await;
        *self.reconnect_slot() = None;
        result
    }

    async fn update_and_await_reconnect(
        &self,
        control: &Arc<dyn Deployment>,
        signal: &Notify,
    ) -> Result<(), UpdateError> {
        let mut restarted = control.update().await?;
        if self.coordinator.needs_service_restart(CONTROL) {
            control.restart_service().await?;
            restarted = true;
        }
        if !restarted {
            return Ok(());
        }

        let timeout = self.settings.reconnect_timeout;
        self.coordinator.notify_update_response(
            format!(
                "Waiting for {CONTROL_DISPLAY_NAME} to reconnect (this may take up to {} seconds)...",
                timeout.as_secs()
            ),
            false,
        );
        match tokio::time::timeout(timeout, signal.notified()).await {
            Ok(()) => self
                .coordinator
                .notify_update_response(format!("{CONTROL_DISPLAY_NAME} Reconnected"), false),
            Err(_) => {
                warn!(timeout = ?timeout, "Control process did not reconnect");
                self.coordinator.notify_update_response(
                    format!("{CONTROL_DISPLAY_NAME} reconnect timed out..."),
                    false,
                );
            }
        }
        Ok(())
    }
}
