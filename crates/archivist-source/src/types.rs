use archivist_common::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub type ExportStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInstance {
    pub instance_id: String,
    #[serde(default)]
    pub series_id: Option<String>,
    #[serde(default)]
    pub sop_instance_uid: Option<String>,
}

/// Remote service holding the raw study content.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Human readable provenance recorded in archive descriptors.
    fn describe(&self) -> String;
    /// Streams a pre-built archive of the whole dataset.
    async fn export(&self, dataset_id: &str) -> Result<ExportStream>;
    async fn list_instances(&self, dataset_id: &str) -> Result<Vec<SourceInstance>>;
    async fn fetch_instance(&self, instance_id: &str) -> Result<Bytes>;
}
