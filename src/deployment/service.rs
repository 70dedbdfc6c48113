//! Components installed as a service from a git checkout or a packaged
//! archive. The source mechanics sit behind [`AppSource`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use super::base::DeploymentBase;
use super::{AppType, Deployment, DeploymentKind};
use crate::config::AppConfig;
use crate::coordinator::{CmdOptions, Coordinator};
use crate::types::UpdateError;

/// Narrow view of a git or archive source.
#[async_trait]
pub trait AppSource: Send + Sync {
    /// Restore from the persisted record and validate the checkout.
    async fn initialize(&self, storage: &Map<String, Value>) -> Result<(), UpdateError>;

    /// Fetch remote state; returns the remote version.
    async fn refresh(&self) -> Result<String, UpdateError>;

    /// Bring the install up to date; `true` when anything changed.
    async fn update(&self, coordinator: &Coordinator) -> Result<bool, UpdateError>;

    async fn rollback(&self, _coordinator: &Coordinator) -> Result<bool, UpdateError> {
        Err(UpdateError::Unsupported(
            "Rollback not available for this source".to_string(),
        ))
    }

    async fn recover(
        &self,
        _hard: bool,
        _update_deps: bool,
        _coordinator: &Coordinator,
    ) -> Result<(), UpdateError> {
        Err(UpdateError::Unsupported(
            "Recovery not available for this source".to_string(),
        ))
    }

    fn version(&self) -> String;

    /// Source specific status fields.
    fn status(&self) -> Map<String, Value>;

    /// Source specific fields to persist.
    fn persistent_data(&self) -> Map<String, Value>;
}

pub trait SourceFactory: Send + Sync {
    fn create(&self, name: &str, app: &AppConfig) -> Result<Box<dyn AppSource>, UpdateError>;
}

/// Factory for builds without a git or archive backend.
#[derive(Debug, Default, Clone)]
pub struct NoSourceFactory;

impl SourceFactory for NoSourceFactory {
    fn create(&self, _name: &str, app: &AppConfig) -> Result<Box<dyn AppSource>, UpdateError> {
        Err(UpdateError::Unsupported(format!(
            "no source backend available for type '{}'",
            app.app_type
        )))
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    remote_version: String,
    last_error: Option<String>,
}

pub struct ServiceDeploy {
    base: DeploymentBase,
    source: Box<dyn AppSource>,
    app_type: AppType,
    channel: String,
    path: Option<PathBuf>,
    executable: Option<PathBuf>,
    managed_services: Vec<String>,
    state: Mutex<ServiceState>,
}

impl ServiceDeploy {
    pub fn new(
        name: &str,
        app: &AppConfig,
        source: Box<dyn AppSource>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        Self {
            base: DeploymentBase::new(name, "", coordinator),
            source,
            app_type: app.app_type,
            channel: app.channel.clone(),
            path: app.path.clone(),
            executable: app.env.clone(),
            managed_services: app.services_for(name),
            state: Mutex::new(ServiceState {
                remote_version: "?".to_string(),
                last_error: None,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persistent_data(&self) -> Map<String, Value> {
        let mut data = self.source.persistent_data();
        let state = self.state();
        data.insert("version".to_string(), json!(self.source.version()));
        data.insert("remote_version".to_string(), json!(state.remote_version));
        data.insert("last_error".to_string(), json!(state.last_error));
        data
    }

    async fn restart(&self, service: &str) -> Result<(), UpdateError> {
        let coordinator = self.base.coordinator();
        coordinator.remove_pending_restart(service);
        coordinator.notify_update_response(format!("Restarting service {service}..."), false);
        coordinator
            .run_cmd(
                &format!("sudo systemctl restart {service}"),
                CmdOptions::with_timeout(Duration::from_secs(60)),
            )
            .await
    }
}

fn same_path(configured: Option<&PathBuf>, reported: &Path) -> bool {
    let Some(configured) = configured else {
        return false;
    };
    let resolve = |path: &Path| std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    resolve(configured) == resolve(reported)
}

#[async_trait]
impl Deployment for ServiceDeploy {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> DeploymentKind {
        DeploymentKind::Service
    }

    async fn initialize(&self) -> Result<(), UpdateError> {
        let storage = self.base.load_storage().await?;
        if let Some(remote) = storage.get("remote_version").and_then(Value::as_str) {
            self.state().remote_version = remote.to_string();
        }
        self.source.initialize(&storage).await
    }

    fn needs_refresh(&self, log: bool) -> bool {
        self.base.needs_refresh(log)
    }

    fn last_refresh_time(&self) -> Option<DateTime<Utc>> {
        self.base.last_refresh_time()
    }

    async fn refresh(&self) {
        match self.source.refresh().await {
            Ok(remote) => {
                let mut state = self.state();
                state.remote_version = remote;
                state.last_error = None;
                drop(state);
                self.base.mark_refreshed();
            }
            Err(err) => {
                warn!(name = %self.name(), error = %err, "Error refreshing service");
                let mut state = self.state();
                state.remote_version = "?".to_string();
                state.last_error = Some(err.to_string());
            }
        }
        self.base.save_state(self.persistent_data()).await;
    }

    async fn update(&self) -> Result<bool, UpdateError> {
        let changed = self.source.update(self.base.coordinator()).await?;
        self.base.save_state(self.persistent_data()).await;
        if changed {
            self.restart_service().await?;
        }
        Ok(changed)
    }

    async fn rollback(&self) -> Result<bool, UpdateError> {
        let changed = self.source.rollback(self.base.coordinator()).await?;
        self.base.save_state(self.persistent_data()).await;
        if changed {
            self.restart_service().await?;
        }
        Ok(changed)
    }

    fn supports_recovery(&self) -> bool {
        self.app_type == AppType::GitRepo
    }

    async fn recover(&self, hard: bool, update_deps: bool) -> Result<(), UpdateError> {
        if !self.supports_recovery() {
            return Err(UpdateError::Unsupported(format!(
                "Updater {} is not a Git Repo Type",
                self.name()
            )));
        }
        self.source
            .recover(hard, update_deps, self.base.coordinator())
            .await?;
        self.base.save_state(self.persistent_data()).await;
        self.restart_service().await
    }

    /// Restart managed services. During a full update, services other than
    /// this deployment's own are postponed.
    async fn restart_service(&self) -> Result<(), UpdateError> {
        let coordinator = self.base.coordinator();
        let is_full = coordinator.is_full_update();
        for service in &self.managed_services {
            if is_full && service != self.name() {
                info!(service = %service, "Service restart postponed");
                coordinator.notify_update_response(
                    format!("Service {service} restart postponed..."),
                    false,
                );
                coordinator.add_pending_restart(service);
                continue;
            }
            self.restart(service).await?;
        }
        Ok(())
    }

    fn check_same_paths(&self, path: &Path, executable: &Path) -> bool {
        same_path(self.path.as_ref(), path) && same_path(self.executable.as_ref(), executable)
    }

    fn get_status(&self) -> Value {
        let mut status = self.source.status();
        let state = self.state();
        status.insert("name".to_string(), json!(self.name()));
        status.insert("configured_type".to_string(), json!(self.app_type));
        status.insert("channel".to_string(), json!(self.channel));
        status.insert("version".to_string(), json!(self.source.version()));
        status.insert("remote_version".to_string(), json!(state.remote_version));
        status.insert("last_error".to_string(), json!(state.last_error));
        Value::Object(status)
    }
}
