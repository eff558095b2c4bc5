//! Dead-letter and quarantine storage
//!
//! Every envelope that ends in `DEAD_LETTER` or `QUARANTINED` is written
//! here together with its failure reason, so nothing is dropped silently.
//! Records keep the original raw bytes and can be replayed.

use super::stage::Stage;
use crate::envelope::MessageEnvelope;
use crate::error::{Error, FailureClass, Result, StageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    DeadLetter,
    Quarantine,
}

impl DeadLetterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeadLetter => "dead_letter",
            Self::Quarantine => "quarantine",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Same as the envelope's `message_id`
    pub id: Uuid,
    pub kind: DeadLetterKind,
    pub route: String,
    pub envelope: MessageEnvelope,
    pub reason: String,
    pub failure_class: FailureClass,
    pub failed_stage: Stage,
    #[serde(default)]
    pub rules: Vec<String>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub(crate) fn new(
        kind: DeadLetterKind,
        route: &str,
        envelope: &MessageEnvelope,
        stage: Stage,
        error: &StageError,
    ) -> Self {
        Self {
            id: envelope.message_id(),
            kind,
            route: route.to_string(),
            envelope: envelope.clone(),
            reason: error.message.clone(),
            failure_class: error.class,
            failed_stage: stage,
            rules: error.rules.clone(),
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn store(&self, record: DeadLetterRecord) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterRecord>>;

    /// Records of one kind (or all), oldest first.
    async fn list(&self, kind: Option<DeadLetterKind>) -> Result<Vec<DeadLetterRecord>>;

    /// Remove and return a record, e.g. before replaying it.
    async fn take(&self, id: Uuid) -> Result<Option<DeadLetterRecord>>;
}

#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    records: RwLock<Vec<DeadLetterRecord>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn store(&self, record: DeadLetterRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.retain(|r| r.id != record.id);
        records.push(record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterRecord>> {
        Ok(self.records.read().await.iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self, kind: Option<DeadLetterKind>) -> Result<Vec<DeadLetterRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .cloned()
            .collect())
    }

    async fn take(&self, id: Uuid) -> Result<Option<DeadLetterRecord>> {
        let mut records = self.records.write().await;
        let position = records.iter().position(|r| r.id == id);
        Ok(position.map(|i| records.remove(i)))
    }
}

/// One JSON file per record under `<root>/dead_letter/` or
/// `<root>/quarantine/`. Files are written to a temporary name and renamed
/// into place.
pub struct FileDeadLetterStore {
    root: PathBuf,
}

impl FileDeadLetterStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for kind in [DeadLetterKind::DeadLetter, DeadLetterKind::Quarantine] {
            tokio::fs::create_dir_all(root.join(kind.as_str())).await?;
        }
        Ok(Self { root })
    }

    fn path_for(&self, kind: DeadLetterKind, id: Uuid) -> PathBuf {
        self.root.join(kind.as_str()).join(format!("{}.json", id))
    }

    async fn read_record(path: &Path) -> Result<Option<DeadLetterRecord>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_dir(&self, kind: DeadLetterKind) -> Result<Vec<DeadLetterRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(kind.as_str())).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable dead-letter record")
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl DeadLetterStore for FileDeadLetterStore {
    async fn store(&self, record: DeadLetterRecord) -> Result<()> {
        let path = self.path_for(record.kind, record.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterRecord>> {
        for kind in [DeadLetterKind::DeadLetter, DeadLetterKind::Quarantine] {
            if let Some(record) = Self::read_record(&self.path_for(kind, id)).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn list(&self, kind: Option<DeadLetterKind>) -> Result<Vec<DeadLetterRecord>> {
        let kinds = match kind {
            Some(kind) => vec![kind],
            None => vec![DeadLetterKind::DeadLetter, DeadLetterKind::Quarantine],
        };
        let mut records = Vec::new();
        for kind in kinds {
            records.extend(self.read_dir(kind).await?);
        }
        records.sort_by_key(|r| r.failed_at);
        Ok(records)
    }

    async fn take(&self, id: Uuid) -> Result<Option<DeadLetterRecord>> {
        let Some(record) = self.get(id).await? else {
            return Ok(None);
        };
        tokio::fs::remove_file(self.path_for(record.kind, id))
            .await
            .map_err(|e| Error::DeadLetter(format!("failed to remove record {}: {}", id, e)))?;
        Ok(Some(record))
    }
}

/// Alerting hook for quarantined payloads.
#[async_trait]
pub trait QuarantineNotifier: Send + Sync {
    async fn notify(&self, record: &DeadLetterRecord);
}

/// Reports quarantined payloads through the error log.
pub struct LogNotifier;

#[async_trait]
impl QuarantineNotifier for LogNotifier {
    async fn notify(&self, record: &DeadLetterRecord) {
        tracing::error!(
            message_id = %record.id,
            correlation_id = %record.envelope.correlation_id(),
            route = %record.route,
            source = %record.envelope.header().source(),
            bytes = record.envelope.body().raw_content().len(),
            reason = %record.reason,
            "Payload quarantined"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(kind: DeadLetterKind) -> DeadLetterRecord {
        let envelope = MessageEnvelope::receive(
            Bytes::from_static(b"\xff\xfe garbage"),
            "file-in",
            None,
            None,
        );
        DeadLetterRecord::new(
            kind,
            "route-a",
            &envelope,
            Stage::Parse,
            &StageError::poison("payload is neither HL7 v2 nor JSON"),
        )
    }

    #[tokio::test]
    async fn test_in_memory_store_roundtrip() {
        let store = InMemoryDeadLetterStore::new();
        let quarantined = record(DeadLetterKind::Quarantine);
        let dead = record(DeadLetterKind::DeadLetter);
        store.store(quarantined.clone()).await.unwrap();
        store.store(dead.clone()).await.unwrap();

        let listed = store.list(Some(DeadLetterKind::Quarantine)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, quarantined.id);

        let taken = store.take(dead.id).await.unwrap().unwrap();
        assert_eq!(taken.failure_class, FailureClass::Poison);
        assert!(store.get(dead.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_keeps_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDeadLetterStore::open(dir.path()).await.unwrap();
        let quarantined = record(DeadLetterKind::Quarantine);
        store.store(quarantined.clone()).await.unwrap();

        assert!(dir
            .path()
            .join("quarantine")
            .join(format!("{}.json", quarantined.id))
            .exists());

        let loaded = store.get(quarantined.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.envelope.body().raw_content().as_ref(),
            b"\xff\xfe garbage"
        );
        assert_eq!(store.list(None).await.unwrap().len(), 1);

        assert!(store.take(quarantined.id).await.unwrap().is_some());
        assert!(store.list(None).await.unwrap().is_empty());
    }
}
