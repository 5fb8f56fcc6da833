use std::{
    fmt,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use archivist_common::{
    error::{ArchivistError, Result},
    time,
    types::DatasetRecord,
};
use archivist_source::{DatasetSource, SourceInstance};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tempfile::{NamedTempFile, TempDir};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::{
    converter::InstanceConverter,
    naming::{archive_file_name, component},
};

pub const DESCRIPTOR_NAME: &str = "metadata.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyMode {
    /// Use the source's pre-built export verbatim.
    DelegatedExport,
    /// Convert each instance and pack them with a metadata descriptor.
    LocalAssembly,
}

impl AssemblyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DelegatedExport => "export",
            Self::LocalAssembly => "local",
        }
    }
}

impl fmt::Display for AssemblyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssemblyMode {
    type Err = ArchivistError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "export" | "delegated-export" => Ok(Self::DelegatedExport),
            "local" | "local-assembly" => Ok(Self::LocalAssembly),
            other => Err(ArchivistError::InvalidArgument(format!(
                "unknown assembly mode: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub mode: AssemblyMode,
    pub export_timeout: Duration,
    /// Directory for temporary archives. The system temp dir when unset.
    pub work_dir: Option<PathBuf>,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            mode: AssemblyMode::DelegatedExport,
            export_timeout: Duration::from_secs(10 * 60),
            work_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionFailure {
    pub instance_id: String,
    pub reason: String,
}

/// An archive on local disk, removed when dropped.
#[derive(Debug)]
pub struct AssembledArchive {
    file: NamedTempFile,
    pub file_name: String,
    pub size_bytes: u64,
    pub total_files: usize,
    pub successful_conversions: usize,
    pub failed: Vec<ConversionFailure>,
}

impl AssembledArchive {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveDescriptor<'a> {
    dataset_id: &'a str,
    patient_id: &'a str,
    patient_name: &'a str,
    study_instance_uid: &'a str,
    study_date: Option<&'a str>,
    instance_count: u32,
    series_count: u32,
    created_at: DateTime<Utc>,
    target_format: &'static str,
    source: String,
    total_original_files: usize,
    successful_conversions: usize,
    failed_conversions: &'a [ConversionFailure],
}

pub struct ArchiveAssembler {
    source: Arc<dyn DatasetSource>,
    converter: Arc<dyn InstanceConverter>,
    config: AssemblerConfig,
}

impl ArchiveAssembler {
    pub fn new(
        source: Arc<dyn DatasetSource>,
        converter: Arc<dyn InstanceConverter>,
        config: AssemblerConfig,
    ) -> Self {
        Self {
            source,
            converter,
            config,
        }
    }

    pub fn mode(&self) -> AssemblyMode {
        self.config.mode
    }

    /// Builds exactly one archive for `dataset`. `progress` receives
    /// `(files_done, files_total)`.
    pub async fn assemble(
        &self,
        dataset: &DatasetRecord,
        progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> Result<AssembledArchive> {
        let file_name = archive_file_name(dataset, time::now());
        let archive = match self.config.mode {
            AssemblyMode::DelegatedExport => self.export(dataset, file_name).await?,
            AssemblyMode::LocalAssembly => self.assemble_locally(dataset, file_name, progress).await?,
        };
        info!(
            dataset_id = %dataset.dataset_id,
            mode = %self.config.mode,
            file_name = %archive.file_name,
            size_bytes = archive.size_bytes,
            successful = archive.successful_conversions,
            total = archive.total_files,
            "archive assembled"
        );
        Ok(archive)
    }

    async fn export(&self, dataset: &DatasetRecord, file_name: String) -> Result<AssembledArchive> {
        let temp = self.temp_file()?;
        let mut file = fs::File::from_std(temp.reopen()?);
        let timeout = self.config.export_timeout;

        let transfer = async {
            let mut stream = self.source.export(&dataset.dataset_id).await?;
            let mut written = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok::<u64, ArchivistError>(written)
        };
        let size_bytes = tokio::time::timeout(timeout, transfer)
            .await
            .map_err(|_| ArchivistError::Timeout {
                operation: "dataset export".to_string(),
                seconds: timeout.as_secs(),
            })??;

        if size_bytes == 0 {
            return Err(ArchivistError::Network(format!(
                "dataset export for {} returned no data",
                dataset.dataset_id
            )));
        }

        let total = dataset.instance_count as usize;
        Ok(AssembledArchive {
            file: temp,
            file_name,
            size_bytes,
            total_files: total,
            successful_conversions: total,
            failed: Vec::new(),
        })
    }

    async fn assemble_locally(
        &self,
        dataset: &DatasetRecord,
        file_name: String,
        progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> Result<AssembledArchive> {
        let instances = self.source.list_instances(&dataset.dataset_id).await?;
        let total = instances.len();
        if total == 0 {
            return Err(ArchivistError::TotalConversionFailure { total });
        }

        let staging = self.staging_dir()?;
        let mut entries = Vec::with_capacity(total);
        let mut failed = Vec::new();
        for (index, instance) in instances.iter().enumerate() {
            match self.convert(instance).await {
                Ok(data) => {
                    let staged = staging.path().join(format!("{index}.part"));
                    fs::write(&staged, &data).await?;
                    entries.push((self.entry_name(index, instance), staged));
                }
                Err(err) => {
                    warn!(
                        dataset_id = %dataset.dataset_id,
                        instance_id = %instance.instance_id,
                        error = %err,
                        "instance conversion failed, skipping"
                    );
                    failed.push(ConversionFailure {
                        instance_id: instance.instance_id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
            progress(index + 1, total);
        }

        let successful_conversions = entries.len();
        if successful_conversions == 0 {
            return Err(ArchivistError::TotalConversionFailure { total });
        }

        let descriptor = ArchiveDescriptor {
            dataset_id: &dataset.dataset_id,
            patient_id: &dataset.patient_id,
            patient_name: &dataset.patient_name,
            study_instance_uid: &dataset.study_instance_uid,
            study_date: dataset.study_date.as_deref(),
            instance_count: dataset.instance_count,
            series_count: dataset.series_count,
            created_at: time::now(),
            target_format: self.converter.target_format(),
            source: self.source.describe(),
            total_original_files: total,
            successful_conversions,
            failed_conversions: &failed,
        };
        let descriptor = serde_json::to_vec_pretty(&descriptor).map_err(|err| {
            ArchivistError::InternalError(format!("failed to serialize archive descriptor: {err}"))
        })?;

        let temp = self.temp_file()?;
        let target = temp.reopen()?;
        debug!(dataset_id = %dataset.dataset_id, entries = successful_conversions, "packing archive");
        tokio::task::spawn_blocking(move || write_zip(target, entries, descriptor))
            .await
            .map_err(|err| ArchivistError::InternalError(format!("archive writer aborted: {err}")))??;
        let size_bytes = fs::metadata(temp.path()).await?.len();

        Ok(AssembledArchive {
            file: temp,
            file_name,
            size_bytes,
            total_files: total,
            successful_conversions,
            failed,
        })
    }

    async fn convert(&self, instance: &SourceInstance) -> Result<Bytes> {
        let data = self.source.fetch_instance(&instance.instance_id).await?;
        self.converter.convert(instance, data)
    }

    fn entry_name(&self, index: usize, instance: &SourceInstance) -> String {
        let stem = instance
            .sop_instance_uid
            .as_deref()
            .unwrap_or(&instance.instance_id);
        format!(
            "{:04}_{}.{}",
            index + 1,
            component(stem, "instance"),
            self.converter.extension()
        )
    }

    fn temp_file(&self) -> Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("archivist-").suffix(".zip");
        let file = match &self.config.work_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(file)
    }

    fn staging_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("archivist-staging-");
        let dir = match &self.config.work_dir {
            Some(dir) => builder.tempdir_in(dir)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }
}

fn write_zip(
    target: std::fs::File,
    entries: Vec<(String, PathBuf)>,
    descriptor: Vec<u8>,
) -> Result<()> {
    let mut zip = ZipWriter::new(target);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(6));

    for (name, staged) in entries {
        zip.start_file(name, options).map_err(zip_error)?;
        let mut input = std::fs::File::open(&staged)?;
        std::io::copy(&mut input, &mut zip)?;
    }
    zip.start_file(DESCRIPTOR_NAME, options).map_err(zip_error)?;
    zip.write_all(&descriptor)?;
    zip.finish().map_err(zip_error)?;
    Ok(())
}

fn zip_error(err: zip::result::ZipError) -> ArchivistError {
    ArchivistError::InternalError(format!("failed to write archive: {err}"))
}
