use super::{Namespace, StoredRecord};
use crate::{Result, StrandError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

/// Storage engine behind the registry.
///
/// The registry defines the semantics (write-through, retries, cache);
/// backends only move documents.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    async fn store(&self, namespace: Namespace, record: &StoredRecord) -> Result<()>;
    async fn load(&self, namespace: Namespace, id: &str) -> Result<Option<StoredRecord>>;
    async fn remove(&self, namespace: Namespace, id: &str) -> Result<()>;
    async fn list(&self, namespace: Namespace) -> Result<Vec<StoredRecord>>;
}

/// Volatile backend; records live only as long as the process.
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<Namespace, HashMap<String, StoredRecord>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryBackend for MemoryBackend {
    async fn store(&self, namespace: Namespace, record: &StoredRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records
            .entry(namespace)
            .or_default()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, namespace: Namespace, id: &str) -> Result<Option<StoredRecord>> {
        let records = self.records.read().await;
        Ok(records
            .get(&namespace)
            .and_then(|ns| ns.get(id))
            .cloned())
    }

    async fn remove(&self, namespace: Namespace, id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(ns) = records.get_mut(&namespace) {
            ns.remove(id);
        }
        Ok(())
    }

    async fn list(&self, namespace: Namespace) -> Result<Vec<StoredRecord>> {
        let records = self.records.read().await;
        Ok(records
            .get(&namespace)
            .map(|ns| ns.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Durable backend: one JSON document per record, one directory per
/// namespace, under a root state directory.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn namespace_dir(&self, namespace: Namespace) -> PathBuf {
        self.root.join(namespace.as_str())
    }

    fn record_path(&self, namespace: Namespace, id: &str) -> PathBuf {
        // Ids are uuids, but never trust an id as a path component.
        let safe: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.namespace_dir(namespace).join(format!("{safe}.json"))
    }
}

#[async_trait]
impl RegistryBackend for FileBackend {
    async fn store(&self, namespace: Namespace, record: &StoredRecord) -> Result<()> {
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StrandError::BackendUnavailable(format!("create {dir:?}: {e}")))?;

        let path = self.record_path(namespace, &record.id);
        let bytes = serde_json::to_vec_pretty(record)?;
        fs::write(&path, bytes)
            .await
            .map_err(|e| StrandError::BackendUnavailable(format!("write {path:?}: {e}")))?;
        debug!("stored {}/{}", namespace, record.id);
        Ok(())
    }

    async fn load(&self, namespace: Namespace, id: &str) -> Result<Option<StoredRecord>> {
        let path = self.record_path(namespace, id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StrandError::BackendUnavailable(format!(
                "read {path:?}: {e}"
            ))),
        }
    }

    async fn remove(&self, namespace: Namespace, id: &str) -> Result<()> {
        let path = self.record_path(namespace, id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StrandError::BackendUnavailable(format!(
                "remove {path:?}: {e}"
            ))),
        }
    }

    async fn list(&self, namespace: Namespace) -> Result<Vec<StoredRecord>> {
        let dir = self.namespace_dir(namespace);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StrandError::BackendUnavailable(format!(
                    "read_dir {dir:?}: {e}"
                )))
            }
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StrandError::BackendUnavailable(format!("read_dir {dir:?}: {e}")))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let bytes = fs::read(&path)
                    .await
                    .map_err(|e| StrandError::BackendUnavailable(format!("read {path:?}: {e}")))?;
                records.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(records)
    }
}
