//! Clients distributed as release archives on GitHub.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

use super::archive::{extract_release, ArchiveFormat};
use super::base::DeploymentBase;
use super::{Channel, Deployment, DeploymentKind, DownloadInfo, DownloadProgress};
use crate::config::ClientConfig;
use crate::coordinator::Coordinator;
use crate::types::UpdateError;

/// Known clients and the GitHub owners that publish them.
const FALLBACK_OWNERS: &[(&str, &str)] = &[("mainsail", "mainsail-crew"), ("fluidd", "fluidd-core")];
const MANIFEST_FILES: &[&str] = &["manifest.json", "manifest.webmanifest"];

#[derive(Debug, Deserialize)]
struct ReleaseInfo {
    project_name: String,
    project_owner: String,
    version: String,
}

#[derive(Debug, Clone)]
struct ClientState {
    repo: String,
    owner: String,
    version: String,
    remote_version: String,
    rollback_version: String,
    rollback_repo: String,
    download: DownloadInfo,
    last_error: String,
    valid: bool,
    fallback: bool,
    prerelease: bool,
    path_writable: bool,
    warnings: Vec<String>,
}

/// Outcome of inspecting the install directory.
#[derive(Debug, Default)]
struct Validation {
    valid: bool,
    fallback: bool,
    version: Option<String>,
    detected: Option<(String, String)>,
    warnings: Vec<String>,
}

pub struct ReleaseClientDeploy {
    base: DeploymentBase,
    path: PathBuf,
    channel: Channel,
    configured_type: String,
    info_tags: Vec<String>,
    persistent_files: Vec<String>,
    state: Mutex<ClientState>,
}

impl ReleaseClientDeploy {
    pub fn new(config: &ClientConfig, coordinator: Arc<Coordinator>) -> Result<Self, UpdateError> {
        let repo = config.repo.trim().trim_matches('/').to_string();
        let Some((owner, _project)) = repo.split_once('/') else {
            return Err(UpdateError::Config(format!(
                "Invalid value for option 'repo: {}' in client {}, expected owner/project",
                config.repo, config.name
            )));
        };
        let owner = owner.to_string();

        let mut channel = Channel::parse(&config.channel).ok_or_else(|| {
            UpdateError::Config(format!(
                "Invalid channel '{}' for client {}",
                config.channel, config.name
            ))
        })?;
        if channel == Channel::Dev {
            coordinator.warn(&format!(
                "Invalid Channel '{}' for client {}, type: {}. Must be one of \
                 the following: stable, beta. Falling back to beta channel",
                channel, config.name, config.client_type
            ));
            channel = Channel::Beta;
        }

        let persistent_files: Vec<String> = config
            .persistent_files
            .iter()
            .map(|file| file.trim_matches('/').to_string())
            .collect();
        if persistent_files.iter().any(|file| file == ".version") {
            return Err(UpdateError::Config(
                "Invalid value for option 'persistent_files': '.version' can not be persistent"
                    .to_string(),
            ));
        }

        Ok(Self {
            base: DeploymentBase::new(&config.name, "Web Client", coordinator),
            path: expand_home(&config.path),
            channel,
            configured_type: config.client_type.clone(),
            info_tags: config.info_tags.clone(),
            persistent_files,
            state: Mutex::new(ClientState {
                repo,
                owner,
                version: "?".to_string(),
                remote_version: "?".to_string(),
                rollback_version: "?".to_string(),
                rollback_repo: "?".to_string(),
                download: DownloadInfo::default(),
                last_error: String::new(),
                valid: true,
                fallback: false,
                prerelease: false,
                path_writable: false,
                warnings: Vec::new(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn validate_client_info(&self) {
        let (repo, path_writable) = {
            let state = self.state();
            (state.repo.clone(), state.path_writable)
        };
        let result = inspect_install(&self.path, &repo, path_writable).await;

        let mut state = self.state();
        state.valid = result.valid;
        state.fallback = result.fallback;
        state.warnings = result.warnings;
        if let Some(version) = result.version {
            state.version = version;
        }
        if let Some((owner, repo)) = result.detected {
            state.owner = owner;
            state.repo = repo;
        }
    }

    fn log_client_info(&self) {
        let state = self.state();
        let mut warnings = String::new();
        if !state.warnings.is_empty() {
            warnings.push_str("\nWarnings:\n");
            warnings.push_str(
                &state
                    .warnings
                    .iter()
                    .map(|item| format!(" {item}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
        }
        info!(
            "Web Client {} Detected:\nRepo: {}\nChannel: {}\nPath: {}\nLocal Version: {}\n\
             Remote Version: {}\nValid: {}\nFallback Client Detected: {}\nPre-release: {}\n\
             Download Url: {}\nDownload Size: {}\nContent Type: {}\nRollback Version: {}\n\
             Rollback Repo: {}{}",
            self.name(),
            state.repo,
            self.channel,
            self.path.display(),
            state.version,
            state.remote_version,
            state.valid,
            state.fallback,
            state.prerelease,
            state.download.url,
            state.download.size,
            state.download.content_type,
            state.rollback_version,
            state.rollback_repo,
            warnings
        );
    }

    /// Fetch a release object. `Ok(None)` means there is nothing to apply.
    async fn fetch_github_release(
        &self,
        repo: Option<&str>,
        tag: Option<&str>,
    ) -> Result<Option<Value>, UpdateError> {
        let repo = match repo {
            Some(repo) => repo.to_string(),
            None => {
                let state = self.state();
                if !state.valid {
                    info!("{}Invalid Web Installation, aborting remote refresh", self.base.prefix());
                    return Ok(None);
                }
                state.repo.clone()
            }
        };
        let resource = match (tag, self.channel) {
            (Some(tag), _) => format!("repos/{repo}/releases/tags/{tag}"),
            (None, Channel::Stable) => format!("repos/{repo}/releases/latest"),
            (None, _) => format!("repos/{repo}/releases?per_page=1"),
        };
        let response = self
            .base
            .coordinator()
            .http()
            .github_api_request(&resource, 3, Duration::from_millis(500))
            .await;

        let release = if response.status_code == 304 {
            if response.content.is_empty() {
                return Ok(None);
            }
            response.json()?
        } else if let Some(error) = &response.error {
            info!("{}Github Request Error - {}", self.base.prefix(), error);
            self.state().last_error = error.clone();
            return Err(UpdateError::Github(error.clone()));
        } else {
            response.json()?
        };

        let release = match release {
            Value::Array(mut releases) if !releases.is_empty() => releases.swap_remove(0),
            Value::Array(_) => Value::Object(Map::new()),
            other => other,
        };
        self.state().last_error.clear();
        match &release {
            Value::Object(map) if map.is_empty() => Ok(None),
            _ => Ok(Some(release)),
        }
    }

    async fn get_remote_version(&self) -> Result<(), UpdateError> {
        let Some(release) = self.fetch_github_release(None, None).await? else {
            return Ok(());
        };
        let mut state = self.state();
        state.remote_version = release
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        state.download = DownloadInfo::from_release(&release);
        state.prerelease = release
            .get("prerelease")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(())
    }

    fn persistent_data(&self) -> Map<String, Value> {
        let state = self.state();
        let mut data = Map::new();
        data.insert("version".to_string(), json!(state.version));
        data.insert("remote_version".to_string(), json!(state.remote_version));
        data.insert("rollback_version".to_string(), json!(state.rollback_version));
        data.insert("rollback_repo".to_string(), json!(state.rollback_repo));
        data.insert("dl_info".to_string(), json!(state.download));
        data.insert("last_error".to_string(), json!(state.last_error));
        data
    }

    /// Install a release. `rollback` carries the asset of the rollback tag.
    async fn install_release(&self, rollback: Option<DownloadInfo>) -> Result<bool, UpdateError> {
        let name = self.name().to_string();
        if !self.state().valid {
            return Err(UpdateError::Update(format!(
                "Web Client {name}: Invalid install detected, aborting update"
            )));
        }

        let is_rollback = rollback.is_some();
        let (download, target_version, start_message) = match rollback {
            Some(download) => {
                let version = self.state().rollback_version.clone();
                (download, version, format!("Rolling Back Web Client {name}..."))
            }
            None => {
                if self.state().remote_version == "?" {
                    if let Err(err) = self.get_remote_version().await {
                        warn!(name = %name, error = %err, "Release lookup failed");
                    }
                }
                let state = self.state().clone();
                if state.remote_version == "?" {
                    return Err(UpdateError::Update(format!(
                        "Client {}: Unable to locate update",
                        state.repo
                    )));
                }
                if state.version == state.remote_version {
                    return Ok(false);
                }
                (
                    state.download,
                    state.remote_version,
                    format!("Updating Web Client {name}..."),
                )
            }
        };
        if !download.is_known() {
            return Err(UpdateError::Update(format!(
                "Client {}: Invalid download url",
                self.state().repo
            )));
        }

        let current_version = self.state().version.clone();
        let coordinator = self.base.coordinator();
        coordinator.notify_update_response(start_message, false);
        coordinator.notify_update_response(format!("Downloading Client: {name}"), false);

        let format = ArchiveFormat::from_content_type(&download.content_type);
        let tempdir = coordinator.create_tempdir(&name, "client").await?;
        let release_file = tempdir.path().join(format!("{name}.{}", format.extension()));
        let persist_dir = tempdir.path().join(&name);
        let on_progress = |progress: &DownloadProgress| coordinator.on_download_progress(progress);
        coordinator
            .http()
            .download_file(
                &download.url,
                &download.content_type,
                &release_file,
                download.size,
                Some(&on_progress),
            )
            .await?;
        coordinator.notify_update_response(
            format!(
                "Download Complete, extracting release to '{}'",
                self.path.display()
            ),
            false,
        );
        extract_release(
            &self.path,
            &persist_dir,
            &release_file,
            &self.persistent_files,
            format,
        )
        .await?;
        let cleanup = tokio::task::spawn_blocking(move || tempdir.close()).await;
        if !matches!(cleanup, Ok(Ok(()))) {
            debug!(name = %name, "Failed to remove temporary directory");
        }

        self.state().version = target_version;
        self.validate_client_info().await;
        {
            let mut state = self.state();
            if state.valid && !is_rollback {
                state.rollback_version = current_version;
                state.rollback_repo = state.repo.clone();
            }
        }
        let message = if is_rollback {
            format!("Rollback Complete: {name}")
        } else {
            format!("Client Update Finished: {name}")
        };
        coordinator.notify_update_response(message, true);
        self.log_client_info();
        self.base.save_state(self.persistent_data()).await;
        Ok(true)
    }
}

#[async_trait]
impl Deployment for ReleaseClientDeploy {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> DeploymentKind {
        DeploymentKind::ReleaseArchiveClient
    }

    async fn initialize(&self) -> Result<(), UpdateError> {
        let writable = path_writable(&self.path).await;
        self.state().path_writable = writable;
        self.validate_client_info().await;
        let storage = self.base.load_storage().await?;
        let stored = |key: &str| storage.get(key).and_then(Value::as_str).map(str::to_string);
        let download: DownloadInfo = storage
            .get("dl_info")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        {
            let mut state = self.state();
            if state.version == "?" {
                state.version = stored("version").unwrap_or_else(|| "?".to_string());
            }
            let default_repo = if state.valid {
                state.repo.clone()
            } else {
                "?".to_string()
            };
            let version = state.version.clone();
            state.remote_version = stored("remote_version").unwrap_or_else(|| "?".to_string());
            state.rollback_version = stored("rollback_version").unwrap_or(version);
            state.rollback_repo = stored("rollback_repo").unwrap_or(default_repo);
            state.last_error = stored("last_error").unwrap_or_default();
            state.download = download;
        }
        if !self.needs_refresh(false) {
            self.log_client_info();
        }
        Ok(())
    }

    fn needs_refresh(&self, log: bool) -> bool {
        self.base.needs_refresh(log)
    }

    fn last_refresh_time(&self) -> Option<DateTime<Utc>> {
        self.base.last_refresh_time()
    }

    async fn refresh(&self) {
        if !self.state().valid {
            self.validate_client_info().await;
        }
        match self.get_remote_version().await {
            Ok(()) => self.base.mark_refreshed(),
            Err(err) => {
                warn!(name = %self.name(), error = %err, "Error Refreshing Client");
                let mut state = self.state();
                state.remote_version = "?".to_string();
                state.last_error = err.to_string();
            }
        }
        self.log_client_info();
        self.base.save_state(self.persistent_data()).await;
    }

    async fn update(&self) -> Result<bool, UpdateError> {
        self.install_release(None).await
    }

    async fn rollback(&self) -> Result<bool, UpdateError> {
        let (rollback_version, rollback_repo, version) = {
            let state = self.state();
            (
                state.rollback_version.clone(),
                state.rollback_repo.clone(),
                state.version.clone(),
            )
        };
        if rollback_version == "?" || rollback_repo == "?" {
            return Err(UpdateError::Update("Incomplete Rollback Data".to_string()));
        }
        if rollback_version == version {
            return Ok(false);
        }
        let release = self
            .fetch_github_release(Some(&rollback_repo), Some(&rollback_version))
            .await?
            .ok_or_else(|| UpdateError::Update("Failed to retrieve release asset data".to_string()))?;
        self.install_release(Some(DownloadInfo::from_release(&release)))
            .await
    }

    fn get_status(&self) -> Value {
        let state = self.state();
        json!({
            "name": self.name(),
            "owner": state.owner,
            "version": state.version,
            "remote_version": state.remote_version,
            "rollback_version": state.rollback_version,
            "configured_type": self.configured_type,
            "channel": self.channel,
            "info_tags": self.info_tags,
            "last_error": state.last_error,
            "is_valid": state.valid,
            "is_fallback": state.fallback,
            "is_prerelease": state.prerelease,
            "warnings": state.warnings,
        })
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

async fn path_writable(path: &Path) -> bool {
    let target = if path.exists() {
        path.to_path_buf()
    } else {
        match path.parent() {
            Some(parent) => parent.to_path_buf(),
            None => return false,
        }
    };
    fs::metadata(&target)
        .await
        .map(|meta| !meta.permissions().readonly())
        .unwrap_or(false)
}

/// Nearest ancestor of `path` (inclusive) holding a `.git` entry.
fn find_git_repo(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

fn repo_mismatch(configured: &str, detected: &str) -> String {
    format!(
        "Value at option 'repo: {configured}' does not match detected repo '{detected}', \
         falling back to detected version."
    )
}

async fn inspect_install(path: &Path, repo: &str, path_writable: bool) -> Validation {
    let mut result = Validation::default();
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let repo_parent = find_git_repo(path);

    if !path_writable {
        result.warnings.push(format!(
            "Location at option 'path: {}' is not writable.",
            path.display()
        ));
    } else if !path.is_dir() {
        result.warnings.push(format!(
            "Location at option 'path: {}' is not a directory.",
            path.display()
        ));
    } else if let Some(parent) = repo_parent.filter(|parent| Some(parent) != home.as_ref()) {
        result.warnings.push(format!(
            "Location at option 'path: {}' is within a git repo. Found .git folder at '{}'",
            path.display(),
            parent.join(".git").display()
        ));
    } else {
        let release_info = path.join("release_info.json");
        if release_info.is_file() {
            match read_release_info(&release_info).await {
                Ok(info) => {
                    result.valid = true;
                    result.version = Some(info.version);
                    let detected = format!("{}/{}", info.project_owner, info.project_name);
                    if !repo.eq_ignore_ascii_case(&detected) {
                        result.warnings.push(repo_mismatch(repo, &detected));
                        result.detected = Some((info.project_owner, detected));
                    }
                }
                Err(err) => warn!(path = %release_info.display(), error = %err, "Failed to load release_info.json"),
            }
        } else {
            if let Ok(version) = fs::read_to_string(path.join(".version")).await {
                result.version = Some(version.trim().to_string());
            }
            detect_fallback(path, repo, &mut result).await;
        }
    }
    if !result.valid {
        result
            .warnings
            .push("Failed to validate client installation".to_string());
    }
    result
}

async fn read_release_info(path: &Path) -> Result<ReleaseInfo, UpdateError> {
    let contents = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&contents)?)
}

/// Identify well-known clients installed without release info.
async fn detect_fallback(path: &Path, repo: &str, result: &mut Validation) {
    for file in MANIFEST_FILES {
        let manifest = path.join(file);
        if !manifest.is_file() {
            continue;
        }
        let name = match fs::read_to_string(&manifest).await {
            Ok(contents) => serde_json::from_str::<Value>(&contents)
                .ok()
                .and_then(|data| data.get("name").and_then(Value::as_str).map(str::to_lowercase)),
            Err(_) => None,
        };
        let Some(name) = name else {
            warn!(path = %manifest.display(), "Failed to load json from manifest");
            continue;
        };
        let Some((_, owner)) = FALLBACK_OWNERS.iter().find(|(client, _)| *client == name) else {
            continue;
        };
        let detected = format!("{owner}/{name}");
        if detected != repo.to_lowercase() {
            result.warnings.push(repo_mismatch(repo, &detected));
            result.detected = Some((owner.to_string(), detected));
        }
        result.fallback = true;
        result.valid = true;
        return;
    }
}
