//! Top-level update orchestration.
//!
//! The [`Orchestrator`] owns every managed [`Deployment`] in registration
//! order and serializes state-mutating work behind one global lock. Update,
//! rollback and recovery requests additionally claim the coordinator session,
//! so a second request is rejected instead of queued.

mod full_update;
mod refresh;
mod requests;


use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, Config};
use crate::coordinator::{Collaborators, Coordinator};
use crate::deployment::{
    build_app_deployment, build_client_deployment, AppType, ComponentInfo, Deployment,
    DeploymentKind, PackageDeploy, SourceFactory, UnmanagedDeploy, CONTROL, HOST, PACKAGES,
};
use crate::http::RateLimitStats;
use crate::types::UpdateError;

pub use full_update::FullUpdateReport;

/// Namespace the host application keeps its own settings under.
const HOST_NAMESPACE: &str = "moonraker";
const CONTROL_PATH_KEY: &str = "update_manager.klipper_path";
const CONTROL_EXEC_KEY: &str = "update_manager.klipper_exec";

/// Delay between a refresh and the `update_refreshed` broadcast that follows it.
const REFRESH_BROADCAST_DELAY: Duration = Duration::from_millis(200);

/// Runtime knobs taken from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub enable_auto_refresh: bool,
    pub refresh_window_end_hour: u32,
    pub spam_window: Duration,
    pub reconnect_timeout: Duration,
    pub control: AppConfig,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            enable_auto_refresh: config.enable_auto_refresh,
            refresh_window_end_hour: config.refresh_window_end_hour,
            spam_window: config.spam_window(),
            reconnect_timeout: config.reconnect_timeout(),
            control: config.control.clone(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Rate-limit counters, per-deployment status and the busy flag.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    #[serde(flatten)]
    pub rate_limit: RateLimitStats,
    pub version_info: Map<String, Value>,
    pub busy: bool,
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    coordinator: Arc<Coordinator>,
    sources: Arc<dyn SourceFactory>,
    deployments: RwLock<Vec<Arc<dyn Deployment>>>,
    command_lock: tokio::sync::Mutex<()>,
    initial_refresh_complete: std::sync::atomic::AtomicBool,
    control: Mutex<AppConfig>,
    reconnect: Mutex<Option<Arc<Notify>>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build the package set, host, control process and client deployments.
    pub fn new(
        config: &Config,
        collaborators: Collaborators,
        sources: Arc<dyn SourceFactory>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Coordinator::new(collaborators, config.refresh_interval()));
        let mut deployments: Vec<Arc<dyn Deployment>> = Vec::new();

        if config.enable_system_updates {
            deployments.push(Arc::new(PackageDeploy::new(
                coordinator.clone(),
                config.enable_packagekit,
            )));
        }
        deployments.push(build_app_deployment(
            HOST,
            &config.host,
            &coordinator,
            sources.as_ref(),
        ));
        deployments.push(control_deployment(
            &config.control,
            &coordinator,
            sources.as_ref(),
        ));

        for client in &config.clients {
            if deployments.iter().any(|d| d.name() == client.name) {
                warn!(name = %client.name, "Duplicate client entry ignored");
                coordinator.warn(&format!(
                    "[update_manager]: Client {} already added",
                    client.name
                ));
                continue;
            }
            match build_client_deployment(client, &coordinator, sources.as_ref()) {
                Ok(deployment) => deployments.push(deployment),
                Err(err) => {
                    warn!(name = %client.name, error = %err, "Failed to load client");
                    coordinator.warn(&format!(
                        "[update_manager]: Failed to load client {}: {err}",
                        client.name
                    ));
                }
            }
        }

        Self::with_deployments(
            OrchestratorSettings::from(config),
            coordinator,
            sources,
            deployments,
        )
    }

    pub fn with_deployments(
        settings: OrchestratorSettings,
        coordinator: Arc<Coordinator>,
        sources: Arc<dyn SourceFactory>,
        deployments: Vec<Arc<dyn Deployment>>,
    ) -> Arc<Self> {
        let control = settings.control.clone();
        Arc::new(Self {
            settings,
            coordinator,
            sources,
            deployments: RwLock::new(deployments),
            command_lock: tokio::sync::Mutex::new(()),
            initial_refresh_complete: std::sync::atomic::AtomicBool::new(false),
            control: Mutex::new(control),
            reconnect: Mutex::new(None),
            refresh_task: Mutex::new(None),
        })
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn deployment(&self, name: &str) -> Option<Arc<dyn Deployment>> {
        self.deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    pub fn deployment_names(&self) -> Vec<String> {
        self.deployments()
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    pub fn is_initial_refresh_complete(&self) -> bool {
        self.initial_refresh_complete
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    fn mark_initial_refresh_complete(&self) {
        self.initial_refresh_complete
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Registration-ordered copy of the registry.
    fn deployments(&self) -> Vec<Arc<dyn Deployment>> {
        self.deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_deployment(&self, deployment: Arc<dyn Deployment>) -> Option<Arc<dyn Deployment>> {
        let mut deployments = self
            .deployments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match deployments.iter_mut().find(|d| d.name() == deployment.name()) {
            Some(slot) => Some(std::mem::replace(slot, deployment)),
            None => {
                deployments.push(deployment);
                None
            }
        }
    }

    fn reconnect_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<Notify>>> {
        self.reconnect.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> StatusSnapshot {
        let version_info = self
            .deployments()
            .iter()
            .map(|d| (d.name().to_string(), d.get_status()))
            .collect();
        StatusSnapshot {
            rate_limit: self.coordinator.get_rate_limit_stats(),
            version_info,
            busy: self.coordinator.is_update_busy(),
        }
    }

    fn schedule_refreshed_broadcast(self: &Arc<Self>) {
        let orchestrator = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(REFRESH_BROADCAST_DELAY).await;
            if let Some(orchestrator) = orchestrator.upgrade() {
                let snapshot = orchestrator.snapshot();
                orchestrator.coordinator.notify_update_refreshed(&snapshot);
            }
        });
    }

    // ---- lifecycle ----

    /// Drop state of removed components, initialize every deployment and
    /// start refreshing. Only a host initialization failure is fatal.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), UpdateError> {
        self.restore_control_location().await;
        self.prune_stale_state().await;

        for deployment in self.deployments() {
            if let Err(err) = deployment.initialize().await {
                if deployment.name() == HOST {
                    error!(name = HOST, error = %err, "Host deployment failed to initialize");
                    return Err(err);
                }
                warn!(name = %deployment.name(), error = %err, "Deployment failed to initialize");
                self.coordinator.warn(&format!(
                    "[update_manager]: Failed to initialize {}: {err}",
                    deployment.name()
                ));
            }
        }

        if self.settings.enable_auto_refresh {
            self.start_refresh_timer();
        } else {
            self.schedule_initial_refresh();
        }
        info!(deployments = ?self.deployment_names(), "Update manager initialized");
        Ok(())
    }

    async fn prune_stale_state(&self) {
        let umdb = self.coordinator.umdb();
        let keys = match umdb.keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "Unable to list stored update state");
                return;
            }
        };
        let names: HashSet<String> = self.deployment_names().into_iter().collect();
        for key in keys.into_iter().filter(|key| !names.contains(key)) {
            info!(key = %key, "Removing stale update state");
            if let Err(err) = umdb.pop(&key).await {
                warn!(key = %key, error = %err, "Failed to remove stale update state");
            }
        }
    }

    /// Apply a control process location recorded by an earlier identification.
    async fn restore_control_location(&self) {
        let store = self.coordinator.store();
        let path = store.get(HOST_NAMESPACE, CONTROL_PATH_KEY).await;
        let executable = store.get(HOST_NAMESPACE, CONTROL_EXEC_KEY).await;
        let (Ok(Some(Value::String(path))), Ok(Some(Value::String(executable)))) =
            (path, executable)
        else {
            return;
        };
        let info = ComponentInfo {
            path: PathBuf::from(path),
            executable: PathBuf::from(executable),
        };
        if !info.path.exists() || !info.executable.exists() {
            debug!(path = %info.path.display(), "Recorded control location no longer exists");
            return;
        }
        {
            let control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
            if control.path.as_ref() == Some(&info.path)
                && control.env.as_ref() == Some(&info.executable)
            {
                return;
            }
        }
        info!(path = %info.path.display(), "Using recorded control process location");
        self.install_control(&info);
    }

    /// Rebuild the control deployment for `info`, returning the one it replaced.
    fn install_control(&self, info: &ComponentInfo) -> Option<Arc<dyn Deployment>> {
        let app = {
            let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
            control.path = Some(info.path.clone());
            control.env = Some(info.executable.clone());
            control.app_type = AppType::detect(&info.path);
            control.clone()
        };
        let deployment =
            build_app_deployment(CONTROL, &app, &self.coordinator, self.sources.as_ref());
        self.replace_deployment(deployment)
    }

    /// The control process reported where it is installed.
    ///
    /// Returns the handle of the isolated control refresh when the location
    /// changed and the deployment was rebuilt.
    pub async fn handle_component_identified(
        self: &Arc<Self>,
        info: Option<ComponentInfo>,
    ) -> Option<JoinHandle<()>> {
        if let Some(signal) = self.reconnect_slot().clone() {
            signal.notify_one();
        }
        let Some(info) = info else {
            debug!("Control process identified without install info");
            return None;
        };

        let was_service = match self.deployment(CONTROL) {
            Some(current) if current.kind() == DeploymentKind::Service => {
                if current.check_same_paths(&info.path, &info.executable) {
                    return None;
                }
                true
            }
            _ => false,
        };

        let store = self.coordinator.store();
        for (key, value) in [
            (CONTROL_PATH_KEY, &info.path),
            (CONTROL_EXEC_KEY, &info.executable),
        ] {
            if let Err(err) = store
                .set(HOST_NAMESPACE, key, json!(value.to_string_lossy()))
                .await
            {
                warn!(key, error = %err, "Failed to record control process location");
            }
        }

        self.install_control(&info);
        info!(
            path = %info.path.display(),
            executable = %info.executable.display(),
            "Control process location changed"
        );

        let orchestrator = self.clone();
        Some(tokio::spawn(async move {
            orchestrator.refresh_control(!was_service).await;
        }))
    }

    async fn refresh_control(self: Arc<Self>, notify: bool) {
        let lock = self.command_lock.lock().await;
        if let Err(err) = self.coordinator.umdb().pop(CONTROL).await {
            warn!(error = %err, "Failed to discard control process state");
        }
        let Some(control) = self.deployment(CONTROL) else {
            return;
        };
        if let Err(err) = control.initialize().await {
            warn!(error = %err, "Control deployment failed to initialize");
        }
        control.refresh().await;
        drop(lock);
        if notify {
            let snapshot = self.snapshot();
            self.coordinator.notify_update_refreshed(&snapshot);
        }
    }

    pub async fn close(&self) {
        if let Some(task) = self
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        for deployment in self.deployments() {
            deployment.close().await;
        }
    }
}

fn control_deployment(
    app: &AppConfig,
    coordinator: &Arc<Coordinator>,
    sources: &dyn SourceFactory,
) -> Arc<dyn Deployment> {
    if app.paths_exist() {
        build_app_deployment(CONTROL, app, coordinator, sources)
    } else {
        debug!("Control process location unknown until it identifies");
        Arc::new(UnmanagedDeploy::new(CONTROL, AppType::None, coordinator.clone()))
    }
}

/// Deployments every full update handles in a dedicated phase.
fn is_core(name: &str) -> bool {
    matches!(name, HOST | CONTROL | PACKAGES)
}
