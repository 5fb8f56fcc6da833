use std::{collections::HashMap, future::Future, path::Path, sync::Arc, time::Duration};

use archivist_common::error::{ArchivistError, Result};
use bytes::Bytes;
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{debug, info, warn};

use crate::traits::{CompletePart, ObjectLayer, PutOptions, StorageClass};

pub const DEFAULT_PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub bucket: String,
    pub part_size: usize,
    pub operation_timeout: Duration,
    pub storage_class: StorageClass,
    pub server_side_encryption: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            bucket: "archives".to_string(),
            part_size: DEFAULT_PART_SIZE,
            operation_timeout: Duration::from_secs(5 * 60),
            storage_class: StorageClass::Standard,
            server_side_encryption: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadedObject {
    pub location: String,
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub size: u64,
    pub parts: usize,
}

/// Streams archives into object storage as multipart uploads so memory use is
/// bounded by one part.
#[derive(Clone)]
pub struct ArchiveUploader {
    object_layer: Arc<dyn ObjectLayer>,
    config: UploaderConfig,
}

impl ArchiveUploader {
    pub fn new(object_layer: Arc<dyn ObjectLayer>, config: UploaderConfig) -> Self {
        Self {
            object_layer,
            config,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub fn object_layer(&self) -> Arc<dyn ObjectLayer> {
        Arc::clone(&self.object_layer)
    }

    /// Uploads `path` under `key`. `progress` receives `(bytes_sent, total_bytes)`
    /// after each part. Any failure aborts the multipart upload before returning.
    pub async fn upload_file(
        &self,
        path: &Path,
        key: &str,
        content_type: &str,
        tags: HashMap<String, String>,
        progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<UploadedObject> {
        let part_size = self.config.part_size.max(1);
        let mut file = File::open(path).await?;
        let total = file.metadata().await?.len();
        let bucket = self.config.bucket.as_str();

        let options = PutOptions {
            content_type: content_type.to_string(),
            storage_class: self.config.storage_class,
            server_side_encryption: self.config.server_side_encryption,
            tags,
        };
        let upload_id = self
            .bounded("create multipart upload", async {
                self.object_layer
                    .create_multipart_upload(bucket, key, options)
                    .await
            })
            .await?;

        let result = self
            .send_parts(&mut file, key, &upload_id, part_size, total, progress)
            .await;
        let parts = match result {
            Ok(parts) => parts,
            Err(err) => {
                self.abort(key, &upload_id).await;
                return Err(err);
            }
        };

        let part_count = parts.len();
        let completed = self
            .bounded("complete multipart upload", async {
                self.object_layer
                    .complete_multipart_upload(bucket, key, &upload_id, parts)
                    .await
            })
            .await;
        let info = match completed {
            Ok(info) => info,
            Err(err) => {
                self.abort(key, &upload_id).await;
                return Err(err);
            }
        };

        info!(
            bucket = %bucket,
            key = %key,
            size = info.size,
            parts = part_count,
            "archive uploaded"
        );
        Ok(UploadedObject {
            location: self.object_layer.object_location(bucket, key),
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag: info.etag,
            size: info.size,
            parts: part_count,
        })
    }

    async fn send_parts(
        &self,
        file: &mut File,
        key: &str,
        upload_id: &str,
        part_size: usize,
        total: u64,
        progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<Vec<CompletePart>> {
        let bucket = self.config.bucket.as_str();
        let mut parts = Vec::new();
        let mut sent = 0_u64;
        let mut part_number = 1_i32;

        loop {
            let chunk = read_chunk(file, part_size).await?;
            // An empty archive still needs one (empty) part.
            if chunk.is_empty() && !parts.is_empty() {
                break;
            }
            let chunk_len = chunk.len();
            let data = Bytes::from(chunk);

            let operation = format!("upload part {part_number}");
            let etag = self
                .bounded(&operation, async {
                    self.object_layer
                        .upload_part(bucket, key, upload_id, part_number, data)
                        .await
                })
                .await?;
            debug!(key = %key, part_number, size = chunk_len, "part uploaded");

            parts.push(CompletePart { part_number, etag });
            sent += chunk_len as u64;
            progress(sent, total);

            if chunk_len < part_size {
                break;
            }
            part_number += 1;
        }

        Ok(parts)
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        let bucket = self.config.bucket.as_str();
        let aborted = self
            .bounded("abort multipart upload", async {
                self.object_layer
                    .abort_multipart_upload(bucket, key, upload_id)
                    .await
            })
            .await;
        if let Err(err) = aborted {
            warn!(bucket = %bucket, key = %key, upload_id = %upload_id, error = %err, "failed to abort multipart upload");
        }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        future: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.operation_timeout, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(into_provider_error(err)),
            Err(_) => Err(ArchivistError::Timeout {
                operation: operation.to_string(),
                seconds: self.config.operation_timeout.as_secs(),
            }),
        }
    }
}

fn into_provider_error(err: ArchivistError) -> ArchivistError {
    match err {
        ArchivistError::StorageProvider(_)
        | ArchivistError::Timeout { .. }
        | ArchivistError::Network(_) => err,
        other => ArchivistError::StorageProvider(other.to_string()),
    }
}

async fn read_chunk(file: &mut File, part_size: usize) -> Result<Vec<u8>> {
    let mut buffer = vec![0_u8; part_size];
    let mut filled = 0;
    while filled < part_size {
        let read = file.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    buffer.truncate(filled);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use archivist_common::error::{ArchivistError, Result};
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::{ArchiveUploader, UploaderConfig};
    use crate::{
        local::LocalObjectLayer,
        traits::{CompletePart, ObjectInfo, ObjectLayer, PutOptions},
    };

    fn config(part_size: usize) -> UploaderConfig {
        UploaderConfig {
            bucket: "archives".to_string(),
            part_size,
            operation_timeout: Duration::from_secs(5),
            server_side_encryption: false,
            ..UploaderConfig::default()
        }
    }

    #[tokio::test]
    async fn file_is_split_into_bounded_parts() {
        let dir = tempfile::tempdir().unwrap();
        let layer = LocalObjectLayer::new(dir.path().join("store"), None).await.unwrap();
        layer.make_bucket("archives").await.unwrap();
        let layer: Arc<dyn ObjectLayer> = Arc::new(layer);

        let source = dir.path().join("archive.zip");
        std::fs::write(&source, vec![42_u8; 25]).unwrap();

        let seen = Mutex::new(Vec::new());
        let uploader = ArchiveUploader::new(Arc::clone(&layer), config(10));
        let uploaded = uploader
            .upload_file(&source, "k.zip", "application/zip", HashMap::new(), &|sent, total| {
                seen.lock().unwrap().push((sent, total));
            })
            .await
            .unwrap();

        assert_eq!(uploaded.parts, 3);
        assert_eq!(uploaded.size, 25);
        assert_eq!(uploaded.location, "local://archives/k.zip");
        assert_eq!(*seen.lock().unwrap(), vec![(10, 25), (20, 25), (25, 25)]);
        let (_, data) = layer.get_object("archives", "k.zip").await.unwrap();
        assert_eq!(data.len(), 25);
    }

    #[tokio::test]
    async fn empty_file_uploads_single_part() {
        let dir = tempfile::tempdir().unwrap();
        let layer = LocalObjectLayer::new(dir.path().join("store"), None).await.unwrap();
        layer.make_bucket("archives").await.unwrap();
        let source = dir.path().join("empty.zip");
        std::fs::write(&source, b"").unwrap();

        let uploader = ArchiveUploader::new(Arc::new(layer), config(10));
        let uploaded = uploader
            .upload_file(&source, "empty.zip", "application/zip", HashMap::new(), &|_, _| {})
            .await
            .unwrap();
        assert_eq!(uploaded.parts, 1);
        assert_eq!(uploaded.size, 0);
    }

    #[derive(Default)]
    struct RejectingLayer {
        aborted: Mutex<Vec<String>>,
        stall: bool,
    }

    #[async_trait]
    impl ObjectLayer for RejectingLayer {
        async fn make_bucket(&self, _bucket: &str) -> Result<()> {
            Ok(())
        }

        async fn create_multipart_upload(
            &self,
            _bucket: &str,
            _key: &str,
            _options: PutOptions,
        ) -> Result<String> {
            Ok("upload-1".to_string())
        }

        async fn upload_part(
            &self,
            _bucket: &str,
            _key: &str,
            _upload_id: &str,
            _part_number: i32,
            _data: Bytes,
        ) -> Result<String> {
            if self.stall {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Err(ArchivistError::StorageProvider("QuotaExceeded: bucket is full".to_string()))
        }

        async fn complete_multipart_upload(
            &self,
            _bucket: &str,
            _key: &str,
            _upload_id: &str,
            _parts: Vec<CompletePart>,
        ) -> Result<ObjectInfo> {
            Err(ArchivistError::InternalError("unreachable".to_string()))
        }

        async fn abort_multipart_upload(
            &self,
            _bucket: &str,
            _key: &str,
            upload_id: &str,
        ) -> Result<()> {
            self.aborted.lock().unwrap().push(upload_id.to_string());
            Ok(())
        }

        async fn get_object(&self, bucket: &str, key: &str) -> Result<(ObjectInfo, Bytes)> {
            Err(ArchivistError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        }

        async fn get_object_info(&self, bucket: &str, key: &str) -> Result<ObjectInfo> {
            Err(ArchivistError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        }

        async fn delete_object(&self, _bucket: &str, _key: &str) -> Result<()> {
            Ok(())
        }

        fn object_location(&self, bucket: &str, key: &str) -> String {
            format!("test://{bucket}/{key}")
        }
    }

    #[tokio::test]
    async fn provider_error_aborts_and_surfaces_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("archive.zip");
        std::fs::write(&source, b"zip").unwrap();

        let layer = Arc::new(RejectingLayer::default());
        let uploader = ArchiveUploader::new(layer.clone(), config(10));
        let err = uploader
            .upload_file(&source, "k.zip", "application/zip", HashMap::new(), &|_, _| {})
            .await
            .unwrap_err();

        assert!(err.to_string().contains("QuotaExceeded: bucket is full"));
        assert_eq!(*layer.aborted.lock().unwrap(), vec!["upload-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_part_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("archive.zip");
        std::fs::write(&source, b"zip").unwrap();

        let layer = Arc::new(RejectingLayer {
            stall: true,
            ..RejectingLayer::default()
        });
        let uploader = ArchiveUploader::new(layer.clone(), config(10));
        let err = uploader
            .upload_file(&source, "k.zip", "application/zip", HashMap::new(), &|_, _| {})
            .await
            .unwrap_err();

        assert!(matches!(err, ArchivistError::Timeout { .. }));
        assert_eq!(layer.aborted.lock().unwrap().len(), 1);
    }
}
