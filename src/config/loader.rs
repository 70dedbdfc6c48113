use serde_json::Value;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

use crate::types::UpdateError;

use super::{paths, Config};

const REMOVED_OPTIONS: [&str; 2] = ["client_repo", "client_path"];

impl Config {
    /// Load configuration from config.json in the app directory.
    /// A missing file yields defaults; anything unparsable is fatal.
    pub async fn load() -> Result<Self, UpdateError> {
        let config_path = paths::get_config_path()?;
        let config = Self::load_from(&config_path).await?;
        info!(
            path = %config_path.display(),
            clients = config.clients.len(),
            auto_refresh = config.enable_auto_refresh,
            "Loaded configuration"
        );
        Ok(config)
    }

    pub async fn load_from(config_path: &Path) -> Result<Self, UpdateError> {
        if !config_path.exists() {
            warn!(path = %config_path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(config_path)
            .await
            .map_err(|err| UpdateError::Config(format!("Failed to read config file: {err}")))?;

        let value: Value = serde_json::from_str(&contents)
            .map_err(|err| UpdateError::Config(format!("Failed to parse config.json: {err}")))?;

        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, UpdateError> {
        if REMOVED_OPTIONS.iter().any(|opt| value.get(opt).is_some()) {
            return Err(UpdateError::Config(
                "The deprecated 'client_repo' and 'client_path' options have been removed. \
                 Configure each client in the 'clients' list instead."
                    .to_string(),
            ));
        }

        let config: Config = serde_json::from_value(value).map_err(|err| {
            UpdateError::Config(format!("Failed to deserialize config.json: {err}"))
        })?;

        if config.refresh_window_end_hour > 24 {
            return Err(UpdateError::Config(format!(
                "Invalid value for option 'refresh_window_end_hour': {}",
                config.refresh_window_end_hour
            )));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_the_documented_policy() {
        let config = Config::from_value(json!({})).expect("config");
        assert!(!config.enable_auto_refresh);
        assert_eq!(config.refresh_interval, 168);
        assert_eq!(config.refresh_spam_window_secs, 60);
        assert_eq!(config.reconnect_timeout_secs, 120);
        assert_eq!(config.refresh_window_end_hour, 4);
        assert!(config.enable_system_updates);
        assert!(config.clients.is_empty());
    }

    #[test]
    fn removed_client_options_are_fatal() {
        let err = Config::from_value(json!({ "client_repo": "mainsail-crew/mainsail" }))
            .expect_err("removed option");
        assert!(matches!(err, UpdateError::Config(_)));
    }

    #[test]
    fn parses_clients() {
        let config = Config::from_value(json!({
            "clients": [{
                "name": "mainsail",
                "type": "web",
                "repo": "mainsail-crew/mainsail",
                "path": "/home/pi/mainsail",
                "persistent_files": ["config.json"]
            }]
        }))
        .expect("config");
        assert_eq!(config.clients.len(), 1);
        assert_eq!(config.clients[0].channel, "stable");
        assert_eq!(config.clients[0].persistent_files, vec!["config.json"]);
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(&dir.path().join("config.json"))
            .await
            .expect("defaults");
        assert_eq!(config.refresh_interval, 168);
    }

    #[tokio::test]
    async fn unparsable_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").expect("write");
        assert!(Config::load_from(&path).await.is_err());
    }
}
