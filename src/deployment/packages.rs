//! The operating system package set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{info, warn};

use super::base::DeploymentBase;
use super::{Deployment, DeploymentKind, PACKAGES};
use crate::coordinator::Coordinator;
use crate::provider::{select_provider, PackageProvider, UnavailableProvider};
use crate::types::UpdateError;

/// The startup refresh skips the cache update within this window of the last one.
const CACHE_REFRESH_WINDOW_SECS: i64 = 60 * 60;

pub struct PackageDeploy {
    base: DeploymentBase,
    use_ipc: bool,
    provider: RwLock<Arc<dyn PackageProvider>>,
    available_packages: Mutex<Vec<String>>,
    last_error: Mutex<Option<String>>,
    started: AtomicBool,
}

impl PackageDeploy {
    pub fn new(coordinator: Arc<Coordinator>, use_ipc: bool) -> Self {
        Self {
            base: DeploymentBase::new(PACKAGES, "", coordinator),
            use_ipc,
            provider: RwLock::new(Arc::new(UnavailableProvider)),
            available_packages: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    fn provider(&self) -> Arc<dyn PackageProvider> {
        self.provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn packages(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.available_packages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    fn persistent_data(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("packages".to_string(), json!(*self.packages()));
        data
    }

    async fn update_package_cache(&self, force: bool, notify: bool) -> Result<(), UpdateError> {
        let recent = self
            .base
            .last_refresh_time()
            .map(|last| (Utc::now() - last).num_seconds() < CACHE_REFRESH_WINDOW_SECS)
            .unwrap_or(false);
        if force || !recent {
            self.provider().refresh_packages(notify).await?;
        }
        Ok(())
    }

    /// Only the first refresh after startup may reuse a recent catalog.
    async fn try_refresh(&self) -> Result<Vec<String>, UpdateError> {
        let force = self.started.swap(true, Ordering::SeqCst);
        self.update_package_cache(force, false).await?;
        self.provider().get_packages().await
    }
}

#[async_trait]
impl Deployment for PackageDeploy {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> DeploymentKind {
        DeploymentKind::PackageSet
    }

    async fn initialize(&self) -> Result<(), UpdateError> {
        let storage = self.base.load_storage().await?;
        if let Some(packages) = storage.get("packages").and_then(Value::as_array) {
            *self.packages() = packages
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        let provider = select_provider(self.base.coordinator(), self.use_ipc).await;
        self.base
            .coordinator()
            .set_package_provider(Arc::downgrade(&provider));
        *self.provider.write().unwrap_or_else(PoisonError::into_inner) = provider;
        Ok(())
    }

    fn needs_refresh(&self, log: bool) -> bool {
        self.base.needs_refresh(log)
    }

    fn last_refresh_time(&self) -> Option<DateTime<Utc>> {
        self.base.last_refresh_time()
    }

    async fn refresh(&self) {
        let prefix = self.provider().kind().log_prefix();
        match self.try_refresh().await {
            Ok(packages) => {
                info!(
                    "{prefix}Detected {} package updates:\n{}",
                    packages.len(),
                    packages.join("\n")
                );
                *self.packages() = packages;
                self.set_last_error(None);
                self.base.mark_refreshed();
            }
            Err(err) => {
                warn!(error = %err, "{prefix}Error Refreshing System Packages");
                self.set_last_error(Some(err.to_string()));
            }
        }
        self.base.save_state(self.persistent_data()).await;
    }

    async fn update(&self) -> Result<bool, UpdateError> {
        if self.packages().is_empty() {
            return Ok(false);
        }
        let coordinator = self.base.coordinator();
        coordinator.notify_update_response("Updating packages...", false);
        let result = async {
            self.update_package_cache(true, true).await?;
            self.provider().upgrade_system().await
        }
        .await;
        if let Err(err) = result {
            return Err(UpdateError::Update(format!(
                "Error updating system packages: {err}"
            )));
        }
        self.packages().clear();
        self.base.save_state(self.persistent_data()).await;
        coordinator.notify_update_response("Package update finished...", true);
        Ok(true)
    }

    fn get_status(&self) -> Value {
        let packages = self.packages().clone();
        json!({
            "package_count": packages.len(),
            "package_list": packages,
            "provider": self.provider().kind(),
            "last_error": *self.last_error.lock().unwrap_or_else(PoisonError::into_inner),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHarness;

    const UPGRADABLE: &str = "Listing... Done\n\
        WARNING: apt does not have a stable CLI interface.\n\
        curl/stable 7.88.1 arm64 [upgradable from: 7.88.0]\n\
        git/stable 2.39.5 arm64 [upgradable from: 2.39.2]\n";

    async fn apt_deploy(harness: &TestHarness) -> PackageDeploy {
        harness.shell.respond("command -v apt", "/usr/bin/apt\n");
        harness.shell.respond("apt list --upgradable", UPGRADABLE);
        let deploy = PackageDeploy::new(harness.coordinator.clone(), false);
        deploy.initialize().await.expect("init");
        deploy
    }

    #[tokio::test]
    async fn refresh_lists_and_persists_packages() {
        let harness = TestHarness::new();
        let deploy = apt_deploy(&harness).await;
        deploy.refresh().await;

        let status = deploy.get_status();
        assert_eq!(status["package_count"], 2);
        assert_eq!(status["provider"], "apt_cli");
        let stored = harness
            .coordinator
            .umdb()
            .get_object("system")
            .await
            .expect("stored");
        assert_eq!(stored["packages"], json!(["curl", "git"]));
        assert!(stored["last_refresh_time"].is_string());
    }

    #[tokio::test]
    async fn refreshes_after_startup_always_update_the_cache() {
        let harness = TestHarness::new();
        let deploy = apt_deploy(&harness).await;
        deploy.refresh().await;
        deploy.refresh().await;
        assert_eq!(harness.shell.count_matching("apt-get update"), 2);
    }

    #[tokio::test]
    async fn startup_refresh_reuses_recent_catalog() {
        let harness = TestHarness::new();
        let recent = Utc::now() - chrono::Duration::minutes(10);
        harness
            .coordinator
            .umdb()
            .set("system", json!({ "last_refresh_time": recent }))
            .await
            .expect("seed");
        let deploy = apt_deploy(&harness).await;

        deploy.refresh().await;
        assert_eq!(harness.shell.count_matching("apt-get update"), 0);
        assert_eq!(deploy.get_status()["package_count"], 2);

        deploy.refresh().await;
        assert_eq!(harness.shell.count_matching("apt-get update"), 1);
    }

    #[tokio::test]
    async fn update_forces_cache_and_clears_list() {
        let harness = TestHarness::new();
        let deploy = apt_deploy(&harness).await;
        deploy.refresh().await;
        let _guard = harness.coordinator.try_begin_session("system").expect("claim");
        assert!(deploy.update().await.expect("update"));
        assert_eq!(harness.shell.count_matching("apt-get update"), 2);
        assert_eq!(harness.shell.count_matching("apt-get upgrade --yes"), 1);
        assert_eq!(deploy.get_status()["package_count"], 0);
        assert!(!deploy.update().await.expect("nothing to do"));

        let messages = harness.sink.messages();
        assert_eq!(messages.first().map(String::as_str), Some("Updating packages..."));
        assert_eq!(messages.last().map(String::as_str), Some("Package update finished..."));
    }

    #[tokio::test]
    async fn refresh_failure_keeps_previous_list() {
        let harness = TestHarness::new();
        let deploy = apt_deploy(&harness).await;
        deploy.refresh().await;
        let refreshed_at = deploy.last_refresh_time();

        harness.shell.fail_matching("apt list --upgradable");
        deploy.refresh().await;
        assert_eq!(deploy.get_status()["package_count"], 2);
        assert!(deploy.get_status()["last_error"].is_string());
        assert_eq!(deploy.last_refresh_time(), refreshed_at);
    }

    #[tokio::test]
    async fn coordinator_brokers_installs() {
        let harness = TestHarness::new();
        let _deploy = apt_deploy(&harness).await;
        harness.shell.respond("apt-cache search", "libjpeg-dev - headers\n");
        harness
            .coordinator
            .install_packages(&["libjpeg-dev".to_string()], Default::default())
            .await
            .expect("install");
        assert_eq!(harness.shell.count_matching("install --yes libjpeg-dev"), 1);
    }
}
