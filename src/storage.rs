//! Durable namespaced key-value storage.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs;
use tracing::{debug, warn};

use crate::types::UpdateError;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, UpdateError>;
    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<(), UpdateError>;
    async fn pop(&self, namespace: &str, key: &str) -> Result<Option<Value>, UpdateError>;
    async fn keys(&self, namespace: &str) -> Result<Vec<String>, UpdateError>;
}

/// Handle scoped to a single namespace of a store.
#[derive(Clone)]
pub struct Namespace {
    store: Arc<dyn KeyValueStore>,
    name: String,
}

impl Namespace {
    pub fn new(store: Arc<dyn KeyValueStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, UpdateError> {
        self.store.get(&self.name, key).await
    }

    /// Object stored under `key`, or an empty object.
    pub async fn get_object(&self, key: &str) -> Result<Map<String, Value>, UpdateError> {
        Ok(match self.get(key).await? {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        })
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<(), UpdateError> {
        self.store.set(&self.name, key, value).await
    }

    pub async fn pop(&self, key: &str) -> Result<Option<Value>, UpdateError> {
        self.store.pop(&self.name, key).await
    }

    pub async fn keys(&self) -> Result<Vec<String>, UpdateError> {
        self.store.keys(&self.name).await
    }
}

type Tables = BTreeMap<String, Map<String, Value>>;

/// Volatile store, used when no storage file is configured.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut tables)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, UpdateError> {
        Ok(self.with_tables(|t| t.get(namespace).and_then(|ns| ns.get(key).cloned())))
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<(), UpdateError> {
        self.with_tables(|t| {
            t.entry(namespace.to_string())
                .or_default()
                .insert(key.to_string(), value);
        });
        Ok(())
    }

    async fn pop(&self, namespace: &str, key: &str) -> Result<Option<Value>, UpdateError> {
        Ok(self.with_tables(|t| t.get_mut(namespace).and_then(|ns| ns.remove(key))))
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, UpdateError> {
        Ok(self.with_tables(|t| {
            t.get(namespace)
                .map(|ns| ns.keys().cloned().collect())
                .unwrap_or_default()
        }))
    }
}

/// Store persisted as a single JSON document, rewritten on every mutation.
pub struct JsonFileStore {
    path: PathBuf,
    tables: tokio::sync::Mutex<Tables>,
}

impl JsonFileStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, UpdateError> {
        let path = path.as_ref().to_path_buf();
        let tables = match fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<Tables>(&contents) {
                Ok(tables) => tables,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Corrupt storage file, starting empty");
                    Tables::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Tables::new(),
            Err(err) => return Err(err.into()),
        };
        debug!(path = %path.display(), namespaces = tables.len(), "Opened storage");
        Ok(Self {
            path,
            tables: tokio::sync::Mutex::new(tables),
        })
    }

    async fn flush(&self, tables: &Tables) -> Result<(), UpdateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_vec_pretty(tables)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, contents).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, UpdateError> {
        let tables = self.tables.lock().await;
        Ok(tables.get(namespace).and_then(|ns| ns.get(key).cloned()))
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<(), UpdateError> {
        let mut tables = self.tables.lock().await;
        tables
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        self.flush(&tables).await
    }

    async fn pop(&self, namespace: &str, key: &str) -> Result<Option<Value>, UpdateError> {
        let mut tables = self.tables.lock().await;
        let removed = tables.get_mut(namespace).and_then(|ns| ns.remove(key));
        if removed.is_some() {
            self.flush(&tables).await?;
        }
        Ok(removed)
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, UpdateError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");

        let store = JsonFileStore::open(&path).await.expect("open");
        store
            .set("update_manager", "mainsail", json!({ "version": "v2.8.0" }))
            .await
            .expect("set");
        store
            .set("update_manager", "fluidd", json!({}))
            .await
            .expect("set");
        store.pop("update_manager", "fluidd").await.expect("pop");
        drop(store);

        let reopened = JsonFileStore::open(&path).await.expect("reopen");
        let keys = reopened.keys("update_manager").await.expect("keys");
        assert_eq!(keys, vec!["mainsail".to_string()]);
        let value = reopened
            .get("update_manager", "mainsail")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(value["version"], "v2.8.0");
    }

    #[tokio::test]
    async fn namespace_object_defaults_to_empty() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let ns = Namespace::new(store, "update_manager");
        assert!(ns.get_object("missing").await.expect("get").is_empty());
        ns.set("system", json!("not an object")).await.expect("set");
        assert!(ns.get_object("system").await.expect("get").is_empty());
    }
}
