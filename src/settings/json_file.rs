use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use super::SettingsStore;

/// `SettingsStore` backed by a single JSON file on disk, matching the
/// teacher crate's pattern of a `RwLock`-guarded in-memory cache with
/// write-through persistence rather than hitting disk on every read.
pub struct JsonFileSettingsStore {
    path: PathBuf,
    cache: RwLock<HashMap<String, serde_json::Value>>,
    changes: broadcast::Sender<String>,
}

impl JsonFileSettingsStore {
    pub async fn open(path: PathBuf) -> anyhow::Result<Self> {
        let cache = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            path,
            cache: RwLock::new(cache),
            changes,
        })
    }

    async fn flush(&self, cache: &HashMap<String, serde_json::Value>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(cache)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for JsonFileSettingsStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(self.cache.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()> {
        let snapshot = {
            let mut cache = self.cache.write().await;
            cache.insert(key.to_string(), value);
            cache.clone()
        };
        if let Err(e) = self.flush(&snapshot).await {
            warn!(%key, error = %e, "failed to persist settings file");
            return Err(e);
        }
        let _ = self.changes.send(key.to_string());
        Ok(())
    }

    async fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

/// In-memory-only store for unit tests: same semantics, no filesystem I/O.
pub struct InMemorySettingsStore {
    cache: RwLock<HashMap<String, serde_json::Value>>,
    changes: broadcast::Sender<String>,
}

impl InMemorySettingsStore {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(64);
        Arc::new(Self {
            cache: RwLock::new(HashMap::new()),
            changes,
        })
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(self.cache.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()> {
        self.cache.write().await.insert(key.to_string(), value);
        let _ = self.changes.send(key.to_string());
        Ok(())
    }

    async fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn roundtrips_through_disk() {
        let dir = tempfile_dir();
        let path = dir.join("settings.json");
        {
            let store = JsonFileSettingsStore::open(path.clone()).await.unwrap();
            store.set("capacity_limit_kw", json!(8.5)).await.unwrap();
        }
        let reopened = JsonFileSettingsStore::open(path).await.unwrap();
        assert_eq!(
            reopened.get("capacity_limit_kw").await.unwrap(),
            Some(json!(8.5))
        );
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn set_notifies_subscribers() {
        let store = InMemorySettingsStore::new();
        let mut rx = store.subscribe().await;
        store.set("operating_mode", json!("Away")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "operating_mode");
    }

    fn tempfile_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("capacity-guard-test-{}", std::process::id()));
        dir
    }
}
