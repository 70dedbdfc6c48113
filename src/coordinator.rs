//! Shared context injected into every deployment and package provider.
//!
//! The coordinator owns the update session (what is being updated right now,
//! and which service restarts were postponed), routes progress lines to the
//! notification sink, runs shell commands with retry, and brokers package
//! installs to whichever provider the package deployment selected.

use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::deployment::DownloadProgress;
use crate::device::DeviceState;
use crate::http::{HttpClient, RateLimitStats};
use crate::ipc::IpcBus;
use crate::notify::{NotificationSink, UPDATE_REFRESHED_EVENT, UPDATE_RESPONSE_EVENT};
use crate::provider::{InstallOptions, PackageProvider};
use crate::shell::{ShellExecutor, ShellRequest};
use crate::storage::{KeyValueStore, Namespace};
use crate::types::UpdateError;

pub const STORAGE_NAMESPACE: &str = "update_manager";
pub const FULL_UPDATE_TARGET: &str = "full";

/// External collaborators the coordinator is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn KeyValueStore>,
    pub http: Arc<dyn HttpClient>,
    pub shell: Arc<dyn ShellExecutor>,
    pub sink: Arc<dyn NotificationSink>,
    pub device: Arc<dyn DeviceState>,
    pub bus: Option<Arc<dyn IpcBus>>,
}

/// Bookkeeping for the single in-flight mutating operation.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Session {
    pub current_update_target: Option<String>,
    pub request_id: Option<u64>,
    pub is_full_update: bool,
    pub full_update_complete: bool,
    pub pending_service_restarts: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct CmdOptions {
    pub timeout: Duration,
    pub notify: bool,
    pub retries: u32,
    pub env: Option<HashMap<String, String>>,
    pub cwd: Option<PathBuf>,
}

impl Default for CmdOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            notify: false,
            retries: 1,
            env: None,
            cwd: None,
        }
    }
}

impl CmdOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

pub struct Coordinator {
    collab: Collaborators,
    umdb: Namespace,
    refresh_interval: Duration,
    session: Mutex<Session>,
    claim: Arc<tokio::sync::Mutex<()>>,
    next_request_id: AtomicU64,
    package_provider: RwLock<Option<Weak<dyn PackageProvider>>>,
}

/// Holds the session claim; clears the session when dropped.
pub struct SessionGuard<'a> {
    coordinator: &'a Coordinator,
    _claim: OwnedMutexGuard<()>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.clear_update_info();
    }
}

impl Coordinator {
    pub fn new(collab: Collaborators, refresh_interval: Duration) -> Self {
        let umdb = Namespace::new(collab.store.clone(), STORAGE_NAMESPACE);
        Self {
            collab,
            umdb,
            refresh_interval,
            session: Mutex::new(Session::default()),
            claim: Arc::new(tokio::sync::Mutex::new(())),
            next_request_id: AtomicU64::new(1),
            package_provider: RwLock::new(None),
        }
    }

    pub fn umdb(&self) -> &Namespace {
        &self.umdb
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.collab.store.clone()
    }

    pub fn http(&self) -> &dyn HttpClient {
        self.collab.http.as_ref()
    }

    pub fn shell(&self) -> &dyn ShellExecutor {
        self.collab.shell.as_ref()
    }

    pub fn device(&self) -> &dyn DeviceState {
        self.collab.device.as_ref()
    }

    pub fn bus(&self) -> Option<Arc<dyn IpcBus>> {
        self.collab.bus.clone()
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn warn(&self, message: &str) {
        self.collab.sink.warn(message);
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- session ----

    /// Claim the session for `target`, rejecting if another operation holds it.
    pub fn try_begin_session(&self, target: &str) -> Result<SessionGuard<'_>, UpdateError> {
        let claim = self.claim.clone().try_lock_owned().map_err(|_| {
            UpdateError::AlreadyUpdating {
                target: self
                    .current_update_target()
                    .unwrap_or_else(|| target.to_string()),
            }
        })?;
        self.set_update_info(target);
        Ok(SessionGuard {
            coordinator: self,
            _claim: claim,
        })
    }

    /// Claim the session for `target`, waiting for any current holder.
    pub async fn begin_session(&self, target: &str) -> SessionGuard<'_> {
        let claim = self.claim.clone().lock_owned().await;
        self.set_update_info(target);
        SessionGuard {
            coordinator: self,
            _claim: claim,
        }
    }

    fn set_update_info(&self, target: &str) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let is_full = target == FULL_UPDATE_TARGET;
        let mut session = self.session();
        *session = Session {
            current_update_target: Some(target.to_string()),
            request_id: Some(request_id),
            is_full_update: is_full,
            full_update_complete: !is_full,
            pending_service_restarts: BTreeSet::new(),
        };
    }

    pub fn clear_update_info(&self) {
        *self.session() = Session::default();
    }

    pub fn session_snapshot(&self) -> Session {
        self.session().clone()
    }

    pub fn current_update_target(&self) -> Option<String> {
        self.session().current_update_target.clone()
    }

    pub fn is_full_update(&self) -> bool {
        self.session().is_full_update
    }

    pub fn set_full_complete(&self, complete: bool) {
        self.session().full_update_complete = complete;
    }

    pub fn add_pending_restart(&self, service: &str) {
        self.session()
            .pending_service_restarts
            .insert(service.to_string());
    }

    pub fn remove_pending_restart(&self, service: &str) {
        self.session().pending_service_restarts.remove(service);
    }

    pub fn needs_service_restart(&self, service: &str) -> bool {
        self.session().pending_service_restarts.contains(service)
    }

    pub fn is_app_updating(&self, name: &str) -> bool {
        self.session().current_update_target.as_deref() == Some(name)
    }

    pub fn is_update_busy(&self) -> bool {
        self.session().current_update_target.is_some()
    }

    // ---- notifications ----

    /// Send a progress line for the active session. Dropped when no session is active.
    pub fn notify_update_response(&self, message: impl AsRef<str>, is_complete: bool) {
        let payload = {
            let session = self.session();
            let Some(application) = session.current_update_target.clone() else {
                return;
            };
            let mut complete = is_complete;
            if session.is_full_update {
                complete &= session.full_update_complete;
            }
            json!({
                "message": message.as_ref().trim(),
                "application": application,
                "proc_id": session.request_id,
                "complete": complete,
            })
        };
        self.collab.sink.emit(UPDATE_RESPONSE_EVENT, payload);
    }

    pub fn notify_update_refreshed<T: Serialize>(&self, snapshot: &T) {
        match serde_json::to_value(snapshot) {
            Ok(payload) => self.collab.sink.emit(UPDATE_REFRESHED_EVENT, payload),
            Err(err) => warn!(error = %err, "Failed to serialize status snapshot"),
        }
    }

    pub fn on_download_progress(&self, progress: &DownloadProgress) {
        let target = self.current_update_target().unwrap_or_default();
        let total = progress.total_bytes.unwrap_or(0);
        let percent = progress.percent().unwrap_or(0);
        self.notify_update_response(
            format!(
                "Downloading {}: {} KiB / {} KiB [{}%]",
                target,
                progress.downloaded_bytes / 1024,
                total / 1024,
                percent
            ),
            false,
        );
    }

    pub fn get_rate_limit_stats(&self) -> RateLimitStats {
        self.collab.http.github_api_stats()
    }

    // ---- commands ----

    /// Run `cmd`, retrying up to `options.retries` times with the same timeout.
    pub async fn run_cmd(&self, cmd: &str, options: CmdOptions) -> Result<(), UpdateError> {
        let request = ShellRequest {
            command: cmd.to_string(),
            timeout: options.timeout,
            env: options.env.clone(),
            cwd: options.cwd.clone(),
        };
        let relay = |line: &str| self.notify_update_response(line, false);
        let attempts = options.retries.max(1);
        for attempt in 1..=attempts {
            let callback: Option<&(dyn Fn(&str) + Send + Sync)> =
                if options.notify { Some(&relay) } else { None };
            match self.collab.shell.run(&request, callback).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    warn!(command = %cmd, attempt, attempts, error = %err, "Shell command failed");
                }
            }
        }
        Err(UpdateError::Command(format!("Shell Command Error: {cmd}")))
    }

    pub async fn run_cmd_with_response(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<String, UpdateError> {
        self.collab
            .shell
            .run(&ShellRequest::new(cmd, timeout), None)
            .await
    }

    pub async fn create_tempdir(&self, prefix: &str, suffix: &str) -> Result<TempDir, UpdateError> {
        let prefix = prefix.to_string();
        let suffix = suffix.to_string();
        let dir = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(&suffix)
                .tempdir()
        })
        .await
        .map_err(|err| UpdateError::Update(format!("Tempdir task failed: {err}")))??;
        debug!(path = %dir.path().display(), "Created temporary directory");
        Ok(dir)
    }

    // ---- package brokering ----

    pub fn set_package_provider(&self, provider: Weak<dyn PackageProvider>) {
        *self
            .package_provider
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(provider);
    }

    /// Install system packages through the selected provider. A no-op when
    /// system updates are disabled.
    pub async fn install_packages(
        &self,
        packages: &[String],
        options: InstallOptions,
    ) -> Result<(), UpdateError> {
        let provider = self
            .package_provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        match provider {
            Some(provider) => provider.install_packages(packages, options).await,
            None => {
                debug!(?packages, "No package provider registered, skipping install");
                Ok(())
            }
        }
    }
}
