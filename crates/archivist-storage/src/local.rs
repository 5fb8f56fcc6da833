use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use archivist_common::error::{ArchivistError, Result};
use archivist_crypto::{CryptoError, MasterKey};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::traits::{CompletePart, ObjectInfo, ObjectLayer, PutOptions, StorageClass};

const SYS_DIR_NAME: &str = ".archivist.sys";
const MULTIPART_DIR_NAME: &str = "multipart";
const STAGING_DIR_NAME: &str = "tmp";
const META_FILE_NAME: &str = "archivist.meta";
const DATA_FILE_NAME: &str = "part.data";
const UPLOAD_FILE_NAME: &str = "upload.json";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const MAX_PART_NUMBER: i32 = 10_000;

/// Disk-backed object storage. Objects live at `<root>/<bucket>/<key>/` and
/// in-flight multipart uploads are staged under the system directory.
#[derive(Debug, Clone)]
pub struct LocalObjectLayer {
    root_dir: PathBuf,
    master_key: Option<MasterKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectMeta {
    version: String,
    size: u64,
    etag: String,
    content_type: String,
    storage_class: StorageClass,
    encrypted: bool,
    part_numbers: Vec<i32>,
    mod_time: DateTime<Utc>,
    tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UploadMeta {
    bucket: String,
    key: String,
    options: PutOptions,
    initiated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PartMeta {
    part_number: i32,
    size: u64,
    etag: String,
}

impl LocalObjectLayer {
    pub async fn new(root_dir: PathBuf, master_key: Option<MasterKey>) -> Result<Self> {
        fs::create_dir_all(&root_dir).await?;
        fs::create_dir_all(root_dir.join(SYS_DIR_NAME).join(MULTIPART_DIR_NAME)).await?;
        fs::create_dir_all(root_dir.join(SYS_DIR_NAME).join(STAGING_DIR_NAME)).await?;
        Ok(Self {
            root_dir,
            master_key,
        })
    }

    fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.root_dir.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.bucket_path(bucket).join(key)
    }

    fn upload_path(&self, upload_id: &str) -> PathBuf {
        self.root_dir
            .join(SYS_DIR_NAME)
            .join(MULTIPART_DIR_NAME)
            .join(upload_id)
    }

    fn object_key_material(&self, bucket: &str, key: &str) -> Result<[u8; 32]> {
        let master = self.master_key.as_ref().ok_or_else(|| {
            ArchivistError::StorageProvider(
                "server-side encryption requested but no master key is configured".to_string(),
            )
        })?;
        master.derive_object_key(bucket, key).map_err(map_crypto_error)
    }

    async fn read_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<UploadMeta> {
        validate_upload_id(upload_id)?;
        let path = self.upload_path(upload_id).join(UPLOAD_FILE_NAME);
        let bytes = fs::read(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                return ArchivistError::StorageProvider(format!(
                    "NoSuchUpload: multipart upload {upload_id} does not exist"
                ));
            }
            ArchivistError::Io(err)
        })?;
        let upload: UploadMeta = serde_json::from_slice(&bytes).map_err(|err| {
            ArchivistError::InternalError(format!("failed to parse upload metadata: {err}"))
        })?;
        if upload.bucket != bucket || upload.key != key {
            return Err(ArchivistError::InvalidArgument(format!(
                "multipart upload {upload_id} belongs to {}/{}",
                upload.bucket, upload.key
            )));
        }
        Ok(upload)
    }

    async fn read_object(&self, bucket: &str, key: &str) -> Result<(ObjectMeta, PathBuf)> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;
        ensure_bucket_exists(self, bucket).await?;

        let object_path = self.object_path(bucket, key);
        let meta_bytes = fs::read(object_path.join(META_FILE_NAME))
            .await
            .map_err(|_| ArchivistError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        let meta: ObjectMeta = serde_json::from_slice(&meta_bytes).map_err(|err| {
            ArchivistError::InternalError(format!("failed to parse {META_FILE_NAME}: {err}"))
        })?;
        Ok((meta, object_path))
    }
}

#[async_trait]
impl ObjectLayer for LocalObjectLayer {
    async fn make_bucket(&self, bucket: &str) -> Result<()> {
        validate_bucket_name(bucket)?;
        fs::create_dir_all(self.bucket_path(bucket)).await?;
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        mut options: PutOptions,
    ) -> Result<String> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;
        ensure_bucket_exists(self, bucket).await?;
        if options.server_side_encryption {
            self.object_key_material(bucket, key)?;
        }
        if options.content_type.is_empty() {
            options.content_type = DEFAULT_CONTENT_TYPE.to_string();
        }

        let upload_id = Uuid::new_v4().simple().to_string();
        let upload_dir = self.upload_path(&upload_id);
        fs::create_dir_all(&upload_dir).await?;

        let upload = UploadMeta {
            bucket: bucket.to_string(),
            key: key.to_string(),
            options,
            initiated: Utc::now(),
        };
        write_json(&upload_dir.join(UPLOAD_FILE_NAME), &upload).await?;
        debug!(bucket = %bucket, key = %key, upload_id = %upload_id, "multipart upload created");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String> {
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(ArchivistError::InvalidArgument(format!(
                "part number must be between 1 and {MAX_PART_NUMBER}: {part_number}"
            )));
        }
        let upload = self.read_upload(bucket, key, upload_id).await?;
        let etag = format!("{:x}", Md5::digest(&data));

        let payload = if upload.options.server_side_encryption {
            let object_key = self.object_key_material(bucket, key)?;
            archivist_crypto::seal(&object_key, &part_aad(part_number), &data)
                .map_err(map_crypto_error)?
        } else {
            data.to_vec()
        };

        let upload_dir = self.upload_path(upload_id);
        fs::write(upload_dir.join(format!("part.{part_number}")), payload).await?;
        let part = PartMeta {
            part_number,
            size: data.len() as u64,
            etag: etag.clone(),
        };
        write_json(&upload_dir.join(format!("part.{part_number}.json")), &part).await?;
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletePart>,
    ) -> Result<ObjectInfo> {
        let upload = self.read_upload(bucket, key, upload_id).await?;
        if parts.is_empty() {
            return Err(ArchivistError::InvalidArgument(
                "complete multipart upload requires at least one part".to_string(),
            ));
        }
        if parts
            .windows(2)
            .any(|pair| pair[0].part_number >= pair[1].part_number)
        {
            return Err(ArchivistError::InvalidArgument(
                "parts must be listed in ascending order".to_string(),
            ));
        }

        let upload_dir = self.upload_path(upload_id);
        let staging_dir = self
            .root_dir
            .join(SYS_DIR_NAME)
            .join(STAGING_DIR_NAME)
            .join(Uuid::new_v4().simple().to_string());
        let object_path = self.object_path(bucket, key);

        let staged = match stage_object(&upload, &upload_dir, &staging_dir, &parts).await {
            Ok(meta) => publish_object(&staging_dir, &object_path).await.map(|()| meta),
            Err(err) => Err(err),
        };
        let meta = match staged {
            Ok(meta) => meta,
            Err(err) => {
                discard_staging(&staging_dir).await;
                return Err(err);
            }
        };
        fs::remove_dir_all(&upload_dir).await?;

        Ok(object_info(bucket, key, &meta))
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.read_upload(bucket, key, upload_id).await?;
        fs::remove_dir_all(self.upload_path(upload_id)).await?;
        debug!(bucket = %bucket, key = %key, upload_id = %upload_id, "multipart upload aborted");
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<(ObjectInfo, Bytes)> {
        let (meta, object_path) = self.read_object(bucket, key).await?;
        let raw = fs::read(object_path.join(DATA_FILE_NAME))
            .await
            .map_err(|_| ArchivistError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        let data = if meta.encrypted {
            let object_key = self.object_key_material(bucket, key)?;
            decrypt_frames(&object_key, &meta.part_numbers, &raw)?
        } else {
            raw
        };

        Ok((object_info(bucket, key, &meta), Bytes::from(data)))
    }

    async fn get_object_info(&self, bucket: &str, key: &str) -> Result<ObjectInfo> {
        let (meta, _) = self.read_object(bucket, key).await?;
        Ok(object_info(bucket, key, &meta))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;
        ensure_bucket_exists(self, bucket).await?;

        let object_path = self.object_path(bucket, key);
        if !fs::try_exists(object_path.join(META_FILE_NAME)).await? {
            return Err(ArchivistError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        fs::remove_dir_all(object_path).await?;
        Ok(())
    }

    fn object_location(&self, bucket: &str, key: &str) -> String {
        format!("local://{bucket}/{key}")
    }
}

/// Writes the concatenated part data and object metadata into `staging_dir`.
async fn stage_object(
    upload: &UploadMeta,
    upload_dir: &Path,
    staging_dir: &Path,
    parts: &[CompletePart],
) -> Result<ObjectMeta> {
    fs::create_dir_all(staging_dir).await?;

    let mut data_file = fs::File::create(staging_dir.join(DATA_FILE_NAME)).await?;
    let mut digests = Vec::with_capacity(parts.len() * 16);
    let mut size = 0_u64;

    for part in parts {
        let meta_path = upload_dir.join(format!("part.{}.json", part.part_number));
        let meta_bytes = fs::read(&meta_path).await.map_err(|_| {
            ArchivistError::StorageProvider(format!(
                "InvalidPart: part {} was never uploaded",
                part.part_number
            ))
        })?;
        let stored: PartMeta = serde_json::from_slice(&meta_bytes).map_err(|err| {
            ArchivistError::InternalError(format!("failed to parse part metadata: {err}"))
        })?;
        if stored.etag != part.etag.trim_matches('"') {
            return Err(ArchivistError::StorageProvider(format!(
                "InvalidPart: etag mismatch for part {}",
                part.part_number
            )));
        }

        let payload = fs::read(upload_dir.join(format!("part.{}", part.part_number))).await?;
        if upload.options.server_side_encryption {
            let frame_len = u32::try_from(payload.len()).map_err(|_| {
                ArchivistError::InvalidArgument("part is too large to frame".to_string())
            })?;
            data_file.write_all(&frame_len.to_be_bytes()).await?;
        }
        data_file.write_all(&payload).await?;

        let digest = hex::decode(&stored.etag).map_err(|err| {
            ArchivistError::InternalError(format!("stored part etag is not hex: {err}"))
        })?;
        digests.extend_from_slice(&digest);
        size += stored.size;
    }
    data_file.flush().await?;
    drop(data_file);

    let meta = ObjectMeta {
        version: "1.0".to_string(),
        size,
        etag: format!("{:x}-{}", Md5::digest(&digests), parts.len()),
        content_type: upload.options.content_type.clone(),
        storage_class: upload.options.storage_class,
        encrypted: upload.options.server_side_encryption,
        part_numbers: parts.iter().map(|part| part.part_number).collect(),
        mod_time: Utc::now(),
        tags: upload.options.tags.clone(),
    };
    write_json(&staging_dir.join(META_FILE_NAME), &meta).await?;
    Ok(meta)
}

async fn publish_object(staging_dir: &Path, object_path: &Path) -> Result<()> {
    if is_existing_directory(object_path).await? {
        fs::remove_dir_all(object_path).await?;
    }
    if let Some(parent) = object_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(staging_dir, object_path).await?;
    Ok(())
}

async fn discard_staging(staging_dir: &Path) {
    match fs::remove_dir_all(staging_dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(path = %staging_dir.display(), error = %err, "failed to remove staged object");
        }
    }
}

fn object_info(bucket: &str, key: &str, meta: &ObjectMeta) -> ObjectInfo {
    ObjectInfo {
        bucket: bucket.to_string(),
        key: key.to_string(),
        size: meta.size,
        etag: meta.etag.clone(),
        content_type: meta.content_type.clone(),
        storage_class: meta.storage_class,
        encrypted: meta.encrypted,
        last_modified: meta.mod_time,
        tags: meta.tags.clone(),
    }
}

fn part_aad(part_number: i32) -> Vec<u8> {
    format!("part-{part_number}").into_bytes()
}

fn decrypt_frames(object_key: &[u8; 32], part_numbers: &[i32], raw: &[u8]) -> Result<Vec<u8>> {
    let mut plaintext = Vec::with_capacity(raw.len());
    let mut offset = 0_usize;

    for part_number in part_numbers {
        let header = raw.get(offset..offset + 4).ok_or_else(|| {
            ArchivistError::InternalError("encrypted object is truncated".to_string())
        })?;
        let frame_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        offset += 4;
        let frame = raw.get(offset..offset + frame_len).ok_or_else(|| {
            ArchivistError::InternalError("encrypted object frame is truncated".to_string())
        })?;
        offset += frame_len;

        let opened = archivist_crypto::open(object_key, &part_aad(*part_number), frame)
            .map_err(map_crypto_error)?;
        plaintext.extend_from_slice(&opened);
    }

    if offset != raw.len() {
        return Err(ArchivistError::InternalError(
            "encrypted object has trailing data".to_string(),
        ));
    }
    Ok(plaintext)
}

fn map_crypto_error(err: CryptoError) -> ArchivistError {
    ArchivistError::Crypto(err.to_string())
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value).map_err(|err| {
        ArchivistError::InternalError(format!("failed to serialize {}: {err}", path.display()))
    })?;
    fs::write(path, bytes).await?;
    Ok(())
}

fn validate_bucket_name(bucket: &str) -> Result<()> {
    if bucket.is_empty() || bucket == SYS_DIR_NAME || bucket.contains('/') || bucket.contains('\\') {
        return Err(ArchivistError::InvalidArgument(format!(
            "invalid bucket name: {bucket}"
        )));
    }
    Ok(())
}

fn validate_object_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('\\') {
        return Err(ArchivistError::InvalidArgument(format!("invalid object key: {key}")));
    }

    let key_path = Path::new(key);
    if key_path.is_absolute() {
        return Err(ArchivistError::InvalidArgument(format!("invalid object key: {key}")));
    }

    for component in key_path.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchivistError::InvalidArgument(format!(
                    "invalid object key: {key}"
                )));
            }
        }
    }

    Ok(())
}

fn validate_upload_id(upload_id: &str) -> Result<()> {
    if upload_id.is_empty() || !upload_id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ArchivistError::InvalidArgument(format!(
            "invalid upload id: {upload_id}"
        )));
    }
    Ok(())
}

async fn ensure_bucket_exists(storage: &LocalObjectLayer, bucket: &str) -> Result<()> {
    if !is_existing_directory(&storage.bucket_path(bucket)).await? {
        return Err(ArchivistError::BucketNotFound(bucket.to_string()));
    }
    Ok(())
}

async fn is_existing_directory(path: &Path) -> Result<bool> {
    match fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.is_dir()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ArchivistError::Io(err)),
    }
}
