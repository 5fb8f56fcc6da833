use std::{collections::HashMap, path::PathBuf};

use archivist_common::{
    error::{ArchivistError, Result},
    types::{ArchiveRecord, DatasetRecord},
};
use async_trait::async_trait;
use tokio::{
    fs,
    sync::{Mutex, RwLock},
};
use tracing::warn;

/// In-place mutation of a dataset's archive fields, applied under the store's lock.
pub type ArchiveUpdate = Box<dyn FnOnce(&mut ArchiveRecord) + Send>;

/// Dataset store collaborator. Study records are owned elsewhere; this
/// subsystem only reads them and writes their archive field group.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    async fn get(&self, dataset_id: &str) -> Result<Option<DatasetRecord>>;
    async fn put(&self, record: DatasetRecord) -> Result<()>;
    async fn list(&self) -> Result<Vec<DatasetRecord>>;
    /// Atomically applies `update` and returns the resulting archive record.
    async fn update_archive(&self, dataset_id: &str, update: ArchiveUpdate)
    -> Result<ArchiveRecord>;
}

#[derive(Debug, Default)]
pub struct MemoryDatasetStore {
    records: RwLock<HashMap<String, DatasetRecord>>,
}

impl MemoryDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DatasetStore for MemoryDatasetStore {
    async fn get(&self, dataset_id: &str) -> Result<Option<DatasetRecord>> {
        Ok(self.records.read().await.get(dataset_id).cloned())
    }

    async fn put(&self, record: DatasetRecord) -> Result<()> {
        validate_dataset_id(&record.dataset_id)?;
        self.records
            .write()
            .await
            .insert(record.dataset_id.clone(), record);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DatasetRecord>> {
        let mut records: Vec<DatasetRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|left, right| left.dataset_id.cmp(&right.dataset_id));
        Ok(records)
    }

    async fn update_archive(
        &self,
        dataset_id: &str,
        update: ArchiveUpdate,
    ) -> Result<ArchiveRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(dataset_id)
            .ok_or_else(|| ArchivistError::RecordNotFound(dataset_id.to_string()))?;
        update(&mut record.archive);
        Ok(record.archive.clone())
    }
}

/// One JSON document per dataset under `root`. Writes go through a temp file
/// and a rename so readers never observe a torn record.
#[derive(Debug)]
pub struct JsonDatasetStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonDatasetStore {
    pub async fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, dataset_id: &str) -> PathBuf {
        self.root.join(format!("{dataset_id}.json"))
    }

    async fn read_record(&self, dataset_id: &str) -> Result<Option<DatasetRecord>> {
        validate_dataset_id(dataset_id)?;
        let path = self.record_path(dataset_id);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|err| {
                ArchivistError::InternalError(format!(
                    "failed to parse dataset record {}: {err}",
                    path.display()
                ))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ArchivistError::Io(err)),
        }
    }

    async fn write_record(&self, record: &DatasetRecord) -> Result<()> {
        let path = self.record_path(&record.dataset_id);
        let bytes = serde_json::to_vec_pretty(record).map_err(|err| {
            ArchivistError::InternalError(format!(
                "failed to serialize dataset record {}: {err}",
                path.display()
            ))
        })?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, bytes).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl DatasetStore for JsonDatasetStore {
    async fn get(&self, dataset_id: &str) -> Result<Option<DatasetRecord>> {
        self.read_record(dataset_id).await
    }

    async fn put(&self, record: DatasetRecord) -> Result<()> {
        validate_dataset_id(&record.dataset_id)?;
        let _guard = self.write_lock.lock().await;
        self.write_record(&record).await
    }

    async fn list(&self) -> Result<Vec<DatasetRecord>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(dataset_id) = name.strip_suffix(".json") else {
                continue;
            };
            match self.read_record(dataset_id).await {
                Ok(Some(record)) => out.push(record),
                Ok(None) => {}
                Err(err) => {
                    warn!(file = %name, error = %err, "skipping unreadable dataset record");
                }
            }
        }
        out.sort_by(|left, right| left.dataset_id.cmp(&right.dataset_id));
        Ok(out)
    }

    async fn update_archive(
        &self,
        dataset_id: &str,
        update: ArchiveUpdate,
    ) -> Result<ArchiveRecord> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .read_record(dataset_id)
            .await?
            .ok_or_else(|| ArchivistError::RecordNotFound(dataset_id.to_string()))?;
        update(&mut record.archive);
        self.write_record(&record).await?;
        Ok(record.archive)
    }
}

fn validate_dataset_id(dataset_id: &str) -> Result<()> {
    let valid = !dataset_id.is_empty()
        && dataset_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !dataset_id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(ArchivistError::InvalidArgument(format!(
            "invalid dataset id: {dataset_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use archivist_common::{
        error::ArchivistError,
        types::{ArchiveStatus, DatasetRecord},
    };

    use super::{DatasetStore, JsonDatasetStore, MemoryDatasetStore};

    fn study(id: &str) -> DatasetRecord {
        DatasetRecord {
            dataset_id: id.to_string(),
            patient_id: "P001".to_string(),
            instance_count: 5,
            series_count: 2,
            ..DatasetRecord::default()
        }
    }

    #[tokio::test]
    async fn json_store_round_trips_archive_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDatasetStore::new(dir.path().to_path_buf()).await.unwrap();
        store.put(study("study-1")).await.unwrap();

        let archive = store
            .update_archive(
                "study-1",
                Box::new(|archive| archive.status = ArchiveStatus::Processing),
            )
            .await
            .unwrap();
        assert_eq!(archive.status, ArchiveStatus::Processing);

        let reopened = JsonDatasetStore::new(dir.path().to_path_buf()).await.unwrap();
        let record = reopened.get("study-1").await.unwrap().unwrap();
        assert_eq!(record.archive.status, ArchiveStatus::Processing);
        assert_eq!(record.instance_count, 5);
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_record_does_not_hide_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDatasetStore::new(dir.path().to_path_buf()).await.unwrap();
        store.put(study("study-1")).await.unwrap();
        store.put(study("study-3")).await.unwrap();
        std::fs::write(dir.path().join("study-2.json"), b"{ not json").unwrap();

        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.dataset_id)
            .collect();
        assert_eq!(ids, vec!["study-1", "study-3"]);
        assert!(store.get("study-2").await.is_err());
    }

    #[tokio::test]
    async fn updating_unknown_dataset_is_record_not_found() {
        let store = MemoryDatasetStore::new();
        let err = store
            .update_archive("missing", Box::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchivistError::RecordNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn path_like_dataset_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDatasetStore::new(dir.path().to_path_buf()).await.unwrap();
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.put(study("a/b")).await.is_err());
    }
}
