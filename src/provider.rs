//! OS package manager backends.

mod apt;
mod packagekit;
mod unavailable;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::coordinator::Coordinator;
use crate::types::UpdateError;

pub use apt::{parse_upgradable, AptCliProvider};
pub use packagekit::IpcProvider;
pub use unavailable::UnavailableProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Ipc,
    AptCli,
    Unavailable,
}

impl ProviderKind {
    /// Prefix for log lines about the package deployment.
    pub fn log_prefix(self) -> &'static str {
        match self {
            ProviderKind::Ipc => "PackageKit: ",
            ProviderKind::AptCli => "Package Manager APT: ",
            ProviderKind::Unavailable => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub timeout: Duration,
    pub retries: u32,
    pub notify: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            retries: 3,
            notify: false,
        }
    }
}

#[async_trait]
pub trait PackageProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn refresh_packages(&self, notify: bool) -> Result<(), UpdateError>;

    /// Names of packages with pending upgrades.
    async fn get_packages(&self) -> Result<Vec<String>, UpdateError>;

    async fn install_packages(
        &self,
        packages: &[String],
        options: InstallOptions,
    ) -> Result<(), UpdateError>;

    async fn upgrade_system(&self) -> Result<(), UpdateError>;
}

/// Pick the package backend for this device. The first backend that
/// initializes wins; selection never fails.
pub async fn select_provider(
    coordinator: &Arc<Coordinator>,
    use_ipc: bool,
) -> Arc<dyn PackageProvider> {
    if use_ipc {
        if let Some(bus) = coordinator.bus() {
            match IpcProvider::initialize(coordinator.clone(), bus).await {
                Ok(provider) => {
                    info!("PackageDeploy: PackageKit Provider Configured");
                    return Arc::new(provider);
                }
                Err(err) => debug!(error = %err, "IPC package provider unavailable"),
            }
        }
    }

    if let Some(provider) = AptCliProvider::detect(coordinator.clone()).await {
        info!("PackageDeploy: Using APT CLI Provider");
        return Arc::new(provider);
    }

    let distribution = coordinator.device().distribution_id().to_lowercase();
    coordinator.warn(&format!(
        "Unable to initialize System Update Provider for distribution: {distribution}"
    ));
    Arc::new(UnavailableProvider)
}
