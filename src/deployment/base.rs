//! State every deployment carries, and the deployment used for installs
//! that cannot be managed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use super::{AppType, Deployment, DeploymentKind};
use crate::coordinator::Coordinator;
use crate::types::UpdateError;

pub struct DeploymentBase {
    name: String,
    log_prefix: String,
    coordinator: Arc<Coordinator>,
    last_refresh_time: Mutex<Option<DateTime<Utc>>>,
}

impl DeploymentBase {
    pub fn new(name: &str, log_prefix: &str, coordinator: Arc<Coordinator>) -> Self {
        Self {
            name: name.to_string(),
            log_prefix: log_prefix.to_string(),
            coordinator,
            last_refresh_time: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Prefix for log lines, e.g. `Web Client mainsail: `.
    pub fn prefix(&self) -> String {
        if self.log_prefix.is_empty() {
            format!("{}: ", self.name)
        } else {
            format!("{} {}: ", self.log_prefix, self.name)
        }
    }

    /// Load this deployment's persisted record and restore the refresh time.
    pub async fn load_storage(&self) -> Result<Map<String, Value>, UpdateError> {
        let storage = self.coordinator.umdb().get_object(&self.name).await?;
        let restored = storage
            .get("last_refresh_time")
            .cloned()
            .and_then(|value| serde_json::from_value::<DateTime<Utc>>(value).ok());
        *self.lock_refresh_time() = restored;
        Ok(storage)
    }

    fn lock_refresh_time(&self) -> std::sync::MutexGuard<'_, Option<DateTime<Utc>>> {
        self.last_refresh_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_refresh_time(&self) -> Option<DateTime<Utc>> {
        *self.lock_refresh_time()
    }

    pub fn mark_refreshed(&self) {
        *self.lock_refresh_time() = Some(Utc::now());
    }

    pub fn needs_refresh(&self, log: bool) -> bool {
        let Some(last) = self.last_refresh_time() else {
            return true;
        };
        let interval = chrono::Duration::from_std(self.coordinator.refresh_interval())
            .unwrap_or_else(|_| chrono::Duration::weeks(520));
        let Some(next) = last.checked_add_signed(interval) else {
            return false;
        };
        let now = Utc::now();
        if log && next > now {
            let remaining = next - now;
            info!(
                "{}Next refresh in {} days, {} hours, {} minutes",
                self.prefix(),
                remaining.num_days(),
                remaining.num_hours() % 24,
                remaining.num_minutes() % 60
            );
        }
        now > next
    }

    /// Fields every deployment persists.
    pub fn persistent_data(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert(
            "last_refresh_time".to_string(),
            serde_json::to_value(self.last_refresh_time()).unwrap_or(Value::Null),
        );
        data
    }

    /// Write `data` merged with the base fields. Storage failures are logged.
    pub async fn save_state(&self, data: Map<String, Value>) {
        let mut record = self.persistent_data();
        record.extend(data);
        if let Err(err) = self
            .coordinator
            .umdb()
            .set(&self.name, Value::Object(record))
            .await
        {
            warn!(name = %self.name, error = %err, "Failed to persist update state");
        }
    }
}

/// A component whose install type cannot be updated from here.
pub struct UnmanagedDeploy {
    base: DeploymentBase,
    app_type: AppType,
}

impl UnmanagedDeploy {
    pub fn new(name: &str, app_type: AppType, coordinator: Arc<Coordinator>) -> Self {
        Self {
            base: DeploymentBase::new(name, "", coordinator),
            app_type,
        }
    }
}

#[async_trait]
impl Deployment for UnmanagedDeploy {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> DeploymentKind {
        DeploymentKind::Unmanaged
    }

    async fn initialize(&self) -> Result<(), UpdateError> {
        self.base.load_storage().await?;
        Ok(())
    }

    fn needs_refresh(&self, log: bool) -> bool {
        self.base.needs_refresh(log)
    }

    fn last_refresh_time(&self) -> Option<DateTime<Utc>> {
        self.base.last_refresh_time()
    }

    async fn refresh(&self) {
        self.base.mark_refreshed();
        self.base.save_state(Map::new()).await;
    }

    async fn update(&self) -> Result<bool, UpdateError> {
        info!("{}Install is not managed, skipping update", self.base.prefix());
        Ok(false)
    }

    fn get_status(&self) -> Value {
        json!({
            "name": self.base.name(),
            "configured_type": self.app_type,
            "is_valid": false,
            "version": "?",
            "remote_version": "?",
        })
    }
}
