//! Shared deployment-related data structures.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

/// How a managed component was installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    #[default]
    None,
    Web,
    GitRepo,
    Zip,
}

impl AppType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "" | "none" => Some(AppType::None),
            "web" => Some(AppType::Web),
            "git_repo" => Some(AppType::GitRepo),
            "zip" => Some(AppType::Zip),
            _ => None,
        }
    }

    /// Inspect an install directory for the markers each type leaves behind.
    pub fn detect(path: &Path) -> Self {
        if path.join(".git").exists() {
            AppType::GitRepo
        } else if path.join("release_info.json").is_file() {
            AppType::Zip
        } else {
            AppType::None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppType::None => "none",
            AppType::Web => "web",
            AppType::GitRepo => "git_repo",
            AppType::Zip => "zip",
        }
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Stable,
    Beta,
    Dev,
}

impl Channel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "stable" => Some(Channel::Stable),
            "beta" => Some(Channel::Beta),
            "dev" => Some(Channel::Dev),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Stable => "stable",
            Channel::Beta => "beta",
            Channel::Dev => "dev",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    Service,
    PackageSet,
    ReleaseArchiveClient,
    Unmanaged,
}

/// Where to fetch a release asset from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub url: String,
    pub content_type: String,
    pub size: u64,
}

impl Default for DownloadInfo {
    fn default() -> Self {
        Self {
            url: "?".to_string(),
            content_type: "?".to_string(),
            size: 0,
        }
    }
}

impl DownloadInfo {
    /// First asset of a GitHub release object.
    pub fn from_release(release: &Value) -> Self {
        let asset = release
            .get("assets")
            .and_then(Value::as_array)
            .and_then(|assets| assets.first());
        let text = |key: &str| {
            asset
                .and_then(|asset| asset.get(key))
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string()
        };
        Self {
            url: text("browser_download_url"),
            content_type: text("content_type"),
            size: asset
                .and_then(|asset| asset.get("size"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
        }
    }

    pub fn is_known(&self) -> bool {
        self.url != "?"
    }
}

/// Install location reported by the control process once it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
    pub path: PathBuf,
    pub executable: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
}

impl DownloadProgress {
    pub fn percent(&self) -> Option<u8> {
        self.total_bytes.map(|total| {
            if total == 0 {
                100
            } else {
                let percent = (self.downloaded_bytes.saturating_mul(100)) / total;
                percent.min(100) as u8
            }
        })
    }
}
