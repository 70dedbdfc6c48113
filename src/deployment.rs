//! Managed components and the contract the orchestrator drives them through.

mod archive;
mod base;
mod client;
mod packages;
mod service;
mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::config::{AppConfig, ClientConfig};
use crate::coordinator::Coordinator;
use crate::types::UpdateError;

pub use archive::{extract_release, ArchiveFormat};
pub use base::{DeploymentBase, UnmanagedDeploy};
pub use client::ReleaseClientDeploy;
pub use packages::PackageDeploy;
pub use service::{AppSource, NoSourceFactory, ServiceDeploy, SourceFactory};
pub use types::{
    AppType, Channel, ComponentInfo, DeploymentKind, DownloadInfo, DownloadProgress,
};

/// The host application.
pub const HOST: &str = "moonraker";
/// The cooperating control process.
pub const CONTROL: &str = "klipper";
/// The operating system package set.
pub const PACKAGES: &str = "system";

#[async_trait]
pub trait Deployment: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> DeploymentKind;

    /// Load persisted state and validate the install.
    async fn initialize(&self) -> Result<(), UpdateError>;

    fn needs_refresh(&self, log: bool) -> bool;

    fn last_refresh_time(&self) -> Option<DateTime<Utc>>;

    /// Re-derive remote state. Failures are recorded, never returned.
    async fn refresh(&self);

    /// Apply the pending update; `true` when anything changed.
    async fn update(&self) -> Result<bool, UpdateError>;

    async fn rollback(&self) -> Result<bool, UpdateError> {
        Err(UpdateError::Unsupported(format!(
            "Rollback not available for {}",
            self.name()
        )))
    }

    fn supports_recovery(&self) -> bool {
        false
    }

    async fn recover(&self, _hard: bool, _update_deps: bool) -> Result<(), UpdateError> {
        Err(UpdateError::Unsupported(format!(
            "Recovery not available for {}",
            self.name()
        )))
    }

    async fn restart_service(&self) -> Result<(), UpdateError> {
        Ok(())
    }

    /// Whether this deployment manages the install at `path` run by `executable`.
    fn check_same_paths(&self, _path: &Path, _executable: &Path) -> bool {
        false
    }

    fn get_status(&self) -> Value;

    async fn close(&self) {}
}

/// Build the deployment for the host application or the control process.
pub fn build_app_deployment(
    name: &str,
    app: &AppConfig,
    coordinator: &Arc<Coordinator>,
    sources: &dyn SourceFactory,
) -> Arc<dyn Deployment> {
    match app.app_type {
        AppType::GitRepo | AppType::Zip => match sources.create(name, app) {
            Ok(source) => Arc::new(ServiceDeploy::new(name, app, source, coordinator.clone())),
            Err(err) => {
                warn!(name, error = %err, "Unable to create service source");
                coordinator.warn(&format!(
                    "[update_manager]: Unable to manage {name}: {err}"
                ));
                Arc::new(UnmanagedDeploy::new(name, app.app_type, coordinator.clone()))
            }
        },
        AppType::Web => {
            coordinator.warn(&format!(
                "[update_manager]: Type 'web' is not valid for {name}"
            ));
            Arc::new(UnmanagedDeploy::new(name, app.app_type, coordinator.clone()))
        }
        AppType::None => Arc::new(UnmanagedDeploy::new(name, app.app_type, coordinator.clone())),
    }
}

/// Build the deployment for a configured client.
pub fn build_client_deployment(
    client: &ClientConfig,
    coordinator: &Arc<Coordinator>,
    sources: &dyn SourceFactory,
) -> Result<Arc<dyn Deployment>, UpdateError> {
    let app_type = AppType::parse(&client.client_type).ok_or_else(|| {
        UpdateError::Config(format!(
            "Invalid type '{}' for client {}",
            client.client_type, client.name
        ))
    })?;
    match app_type {
        AppType::Web => Ok(Arc::new(ReleaseClientDeploy::new(client, coordinator.clone())?)),
        AppType::GitRepo | AppType::Zip => {
            let app = AppConfig {
                path: Some(client.path.clone()),
                env: None,
                app_type,
                channel: client.channel.clone(),
                managed_services: None,
            };
            let source = sources.create(&client.name, &app)?;
            Ok(Arc::new(ServiceDeploy::new(
                &client.name,
                &app,
                source,
                coordinator.clone(),
            )))
        }
        AppType::None => Err(UpdateError::Config(format!(
            "Invalid type '{}' for client {}",
            client.client_type, client.name
        ))),
    }
}
