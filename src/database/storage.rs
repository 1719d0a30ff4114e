use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::database::Document;
use crate::error::Result;

/// Durable home of the shared document.
#[async_trait]
pub trait DocumentStore: Send + Sync + fmt::Debug {
    /// The stored document, or `None` if nothing was ever saved.
    async fn load(&self) -> Result<Option<Value>>;

    async fn save(&self, document: &Document) -> Result<()>;

    /// Load and merge over the default document.
    async fn load_document(&self) -> Result<Document> {
        match self.load().await? {
            Some(stored) => Document::from_stored(stored),
            None => Ok(Document::default()),
        }
    }
}

/// JSON file on local disk. Saves go through a temp file and a rename so a
/// crash mid-write never leaves a torn document.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn load(&self) -> Result<Option<Value>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(None),
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, document: &Document) -> Result<()> {
        let raw = serde_json::to_string_pretty(document)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    value: Mutex<Option<Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: Value) -> Self {
        Self {
            value: Mutex::new(Some(value)),
        }
    }

    /// What the last save wrote.
    pub fn snapshot(&self) -> Option<Value> {
        self.value.lock().clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self) -> Result<Option<Value>> {
        Ok(self.value.lock().clone())
    }

    async fn save(&self, document: &Document) -> Result<()> {
        let value = serde_json::to_value(document)?;
        *self.value.lock() = Some(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("state.json"));
        assert!(store.load().await.unwrap().is_none());
        assert_eq!(store.load_document().await.unwrap(), Document::default());
    }

    #[tokio::test]
    async fn file_store_round_trips_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested").join("state.json"));
        let doc = Document::default().with_config_value("answer", json!(42));

        store.save(&doc).await.unwrap();
        assert_eq!(store.load_document().await.unwrap(), doc);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(FileStore::new(path).load().await.is_err());
    }

    #[tokio::test]
    async fn memory_store_snapshot_tracks_saves() {
        let store = MemoryStore::new();
        assert!(store.snapshot().is_none());
        store
            .save(&Document::default().with_config_value("k", json!("v")))
            .await
            .unwrap();
        assert_eq!(store.snapshot().unwrap()["config"]["k"], json!("v"));
    }
}
