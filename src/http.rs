//! HTTP transport: GitHub API requests and release downloads.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::deployment::DownloadProgress;
use crate::types::UpdateError;

pub const GITHUB_API_BASE: &str = "https://api.github.com";
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_USER_AGENT: &str = "update-manager";

/// Receives download progress as chunks arrive.
pub type ProgressCallback<'a> = &'a (dyn Fn(&DownloadProgress) + Send + Sync);

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub url: String,
    pub status_code: u16,
    pub content: Vec<u8>,
    pub error: Option<String>,
}

impl HttpResponse {
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn json(&self) -> Result<Value, UpdateError> {
        Ok(serde_json::from_slice(&self.content)?)
    }
}

/// GitHub API rate-limit counters as last reported by the API.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RateLimitStats {
    pub github_rate_limit: Option<u64>,
    pub github_requests_remaining: Option<u64>,
    pub github_limit_reset_time: Option<u64>,
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Request `resource` relative to the GitHub API root. Never fails outright;
    /// transport problems are reported through `HttpResponse::error`.
    /// A 304 response carries the cached body when one is available.
    async fn github_api_request(
        &self,
        resource: &str,
        attempts: u32,
        retry_pause: Duration,
    ) -> HttpResponse;

    async fn download_file(
        &self,
        url: &str,
        content_type: &str,
        destination: &Path,
        size: u64,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<(), UpdateError>;

    fn github_api_stats(&self) -> RateLimitStats;
}

#[derive(Debug, Clone)]
struct CachedResponse {
    etag: String,
    content: Vec<u8>,
}

pub struct ReqwestHttpClient {
    http: Client,
    api_base: String,
    cache: Mutex<HashMap<String, CachedResponse>>,
    rate_limit: Mutex<RateLimitStats>,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self, UpdateError> {
        Self::with_api_base(GITHUB_API_BASE)
    }

    pub fn with_api_base(api_base: &str) -> Result<Self, UpdateError> {
        let http = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(UpdateError::Http)?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            cache: Mutex::new(HashMap::new()),
            rate_limit: Mutex::new(RateLimitStats::default()),
        })
    }

    fn record_rate_limit(&self, headers: &HeaderMap) {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
        };
        let mut stats = self
            .rate_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(limit) = read("x-ratelimit-limit") {
            stats.github_rate_limit = Some(limit);
        }
        if let Some(remaining) = read("x-ratelimit-remaining") {
            stats.github_requests_remaining = Some(remaining);
        }
        if let Some(reset) = read("x-ratelimit-reset") {
            stats.github_limit_reset_time = Some(reset);
        }
    }

    fn cached(&self, url: &str) -> Option<CachedResponse> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }

    async fn single_request(&self, url: &str) -> Result<HttpResponse, String> {
        let mut request = self
            .http
            .get(url)
            .header(ACCEPT, "application/vnd.github.v3+json")
            .timeout(Duration::from_secs(30));
        let cached = self.cached(url);
        if let Some(entry) = &cached {
            request = request.header(IF_NONE_MATCH, entry.etag.as_str());
        }

        let response = request.send().await.map_err(|err| err.to_string())?;
        self.record_rate_limit(response.headers());
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(HttpResponse {
                url: url.to_string(),
                status_code: status.as_u16(),
                content: cached.map(|entry| entry.content).unwrap_or_default(),
                error: None,
            });
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let content = response
            .bytes()
            .await
            .map_err(|err| err.to_string())?
            .to_vec();

        if !status.is_success() {
            return Err(format!("{url} returned {status}"));
        }

        if let Some(etag) = etag {
            self.cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    url.to_string(),
                    CachedResponse {
                        etag,
                        content: content.clone(),
                    },
                );
        }

        Ok(HttpResponse {
            url: url.to_string(),
            status_code: status.as_u16(),
            content,
            error: None,
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn github_api_request(
        &self,
        resource: &str,
        attempts: u32,
        retry_pause: Duration,
    ) -> HttpResponse {
        let url = format!("{}/{}", self.api_base, resource.trim_start_matches('/'));
        let attempts = attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.single_request(&url).await {
                Ok(response) => return response,
                Err(err) => {
                    warn!(url = %url, attempt, error = %err, "GitHub request failed");
                    last_error = err;
                }
            }
            if self.github_api_stats().github_requests_remaining == Some(0) {
                last_error = format!("GitHub rate limit exhausted: {last_error}");
                break;
            }
            if attempt < attempts {
                tokio::time::sleep(retry_pause).await;
            }
        }

        HttpResponse {
            url,
            status_code: 0,
            content: Vec::new(),
            error: Some(last_error),
        }
    }

    async fn download_file(
        &self,
        url: &str,
        content_type: &str,
        destination: &Path,
        size: u64,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<(), UpdateError> {
        info!(url = %url, destination = %destination.display(), "Downloading release");
        let mut response = self
            .http
            .get(url)
            .header(ACCEPT, content_type)
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .send()
            .await?
            .error_for_status()?;
        let mut file = File::create(destination).await?;
        let total_bytes = response
            .content_length()
            .or(if size > 0 { Some(size) } else { None });
        let mut progress = DownloadProgress {
            downloaded_bytes: 0,
            total_bytes,
        };
        let mut last_percent = None;

        emit_progress(on_progress, &progress, &mut last_percent);

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            progress.downloaded_bytes = progress.downloaded_bytes.saturating_add(chunk.len() as u64);
            emit_progress(on_progress, &progress, &mut last_percent);
        }

        file.flush().await?;
        debug!(bytes = progress.downloaded_bytes, "Download finished");
        Ok(())
    }

    fn github_api_stats(&self) -> RateLimitStats {
        self.rate_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Forward progress only when the whole-percent value moves.
fn emit_progress(
    on_progress: Option<ProgressCallback<'_>>,
    progress: &DownloadProgress,
    last_percent: &mut Option<u8>,
) {
    let Some(callback) = on_progress else {
        return;
    };
    let percent = progress.percent();
    if percent.is_some() && percent == *last_percent {
        return;
    }
    *last_percent = percent;
    callback(progress);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn progress_is_reported_once_per_percent() {
        let seen = StdMutex::new(Vec::new());
        let callback = |p: &DownloadProgress| seen.lock().unwrap().push(p.percent());
        let mut last = None;
        for downloaded in [0u64, 1, 10, 11, 200] {
            let progress = DownloadProgress {
                downloaded_bytes: downloaded,
                total_bytes: Some(200),
            };
            emit_progress(Some(&callback), &progress, &mut last);
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some(0), Some(5), Some(100)]
        );
    }

    #[test]
    fn response_json_parses_content() {
        let response = HttpResponse {
            status_code: 200,
            content: br#"{"name": "v2.1.0"}"#.to_vec(),
            ..Default::default()
        };
        assert!(!response.has_error());
        assert_eq!(response.json().expect("json")["name"], "v2.1.0");
    }
}
