use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::deployment::AppType;

/// Configuration for the update manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub enable_auto_refresh: bool,

    /// Hours between refreshes of a single deployment.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,

    /// Auto refresh after the first pass only runs before this local hour.
    #[serde(default = "default_window_end_hour")]
    pub refresh_window_end_hour: u32,

    #[serde(default = "default_spam_window")]
    pub refresh_spam_window_secs: u64,

    #[serde(default = "default_reconnect_timeout")]
    pub reconnect_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub enable_system_updates: bool,

    #[serde(default = "default_true")]
    pub enable_packagekit: bool,

    #[serde(default)]
    pub storage_path: Option<PathBuf>,

    #[serde(default)]
    pub host: AppConfig,

    #[serde(default)]
    pub control: AppConfig,

    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_auto_refresh: false,
            refresh_interval: default_refresh_interval(),
            refresh_window_end_hour: default_window_end_hour(),
            refresh_spam_window_secs: default_spam_window(),
            reconnect_timeout_secs: default_reconnect_timeout(),
            enable_system_updates: true,
            enable_packagekit: true,
            storage_path: None,
            host: AppConfig::default(),
            control: AppConfig::default(),
            clients: Vec::new(),
        }
    }
}

impl Config {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval.saturating_mul(60 * 60))
    }

    pub fn spam_window(&self) -> Duration {
        Duration::from_secs(self.refresh_spam_window_secs)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }
}

/// Install location of the host application or the control process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Interpreter or executable the application runs under.
    #[serde(default)]
    pub env: Option<PathBuf>,

    #[serde(default, rename = "type")]
    pub app_type: AppType,

    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default)]
    pub managed_services: Option<Vec<String>>,
}

impl AppConfig {
    pub fn services_for(&self, name: &str) -> Vec<String> {
        self.managed_services
            .clone()
            .unwrap_or_else(|| vec![name.to_string()])
    }

    /// Both configured locations exist on disk.
    pub fn paths_exist(&self) -> bool {
        match (&self.path, &self.env) {
            (Some(path), Some(env)) => path.exists() && env.exists(),
            _ => false,
        }
    }
}

/// A client distributed as a release archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub client_type: String,

    #[serde(default)]
    pub repo: String,

    #[serde(default)]
    pub path: PathBuf,

    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default)]
    pub persistent_files: Vec<String>,

    #[serde(default)]
    pub info_tags: Vec<String>,
}

fn default_refresh_interval() -> u64 {
    168
}

fn default_window_end_hour() -> u32 {
    4
}

fn default_spam_window() -> u64 {
    60
}

fn default_reconnect_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_channel() -> String {
    "stable".to_string()
}
