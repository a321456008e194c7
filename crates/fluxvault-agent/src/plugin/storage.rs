//! Persistent per-plugin storage
//!
//! Each plugin owns one JSON object on disk. It survives sessions and plugin
//! reloads, so a plugin can keep state between polling cycles.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{AgentError, AgentResult};

/// Key/value storage backed by a JSON file
#[derive(Debug)]
pub struct PluginStorage {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl PluginStorage {
    /// Open the storage file, starting empty if it does not exist
    pub async fn open(path: impl Into<PathBuf>) -> AgentResult<Self> {
        let path = path.into();
        let values = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                AgentError::PluginLoad(format!("corrupt storage {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().await.get(key).cloned()
    }

    /// Set one key and persist
    pub async fn set(&self, key: impl Into<String>, value: Value) -> AgentResult<()> {
        let mut values = self.values.lock().await;
        values.insert(key.into(), value);
        self.persist(&values).await
    }

    /// Whole storage as a JSON object
    pub async fn snapshot(&self) -> Value {
        Value::Object(self.values.lock().await.clone().into_iter().collect())
    }

    /// Replace the contents and persist
    pub async fn replace(&self, values: BTreeMap<String, Value>) -> AgentResult<()> {
        let mut current = self.values.lock().await;
        *current = values;
        self.persist(&current).await
    }

    async fn persist(&self, values: &BTreeMap<String, Value>) -> AgentResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(values)
            .map_err(|e| AgentError::CommandFailed(format!("failed to encode storage: {e}")))?;
        let temp = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        debug!(path = %self.path.display(), keys = values.len(), "Plugin storage saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_storage_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage").join("rotate.json");

        let storage = PluginStorage::open(&path).await.unwrap();
        assert_eq!(storage.get("last_run").await, None);
        storage.set("last_run", json!(42)).await.unwrap();

        let reopened = PluginStorage::open(&path).await.unwrap();
        assert_eq!(reopened.get("last_run").await, Some(json!(42)));
        assert_eq!(reopened.snapshot().await, json!({"last_run": 42}));
    }

    #[tokio::test]
    async fn test_corrupt_storage_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(PluginStorage::open(&path).await.is_err());
    }
}
