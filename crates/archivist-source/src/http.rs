use std::time::Duration;

use archivist_common::error::{ArchivistError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::types::{DatasetSource, ExportStream, SourceInstance};

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub base_url: Url,
    pub username: Option<String>,
    pub password: Option<String>,
    pub export_timeout: Duration,
    pub request_timeout: Duration,
}

impl SourceConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            username: None,
            password: None,
            export_timeout: Duration::from_secs(10 * 60),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InstanceEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "ParentSeries", default)]
    parent_series: Option<String>,
    #[serde(rename = "MainDicomTags", default)]
    main_tags: Option<MainTags>,
}

#[derive(Debug, Deserialize)]
struct MainTags {
    #[serde(rename = "SOPInstanceUID", default)]
    sop_instance_uid: Option<String>,
}

/// Dataset source over the imaging server's REST API:
/// `GET studies/{id}/archive`, `GET studies/{id}/instances`, `GET instances/{id}/file`.
pub struct HttpDatasetSource {
    config: SourceConfig,
    client: Client,
}

impl HttpDatasetSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| {
                ArchivistError::InternalError(format!("failed to create source client: {err}"))
            })?;
        Ok(Self { config, client })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.config.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ArchivistError::InvalidArgument(format!(
                    "dataset source url cannot be a base: {}",
                    self.config.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.username {
            Some(username) => request.basic_auth(username, self.config.password.as_ref()),
            None => request,
        }
    }

    async fn send(
        &self,
        url: Url,
        timeout: Duration,
        operation: &'static str,
        subject: &str,
    ) -> Result<Response> {
        debug!(url = %url, operation, "dataset source request");
        let response = self
            .authorize(self.client.get(url).timeout(timeout))
            .send()
            .await
            .map_err(|err| map_transport_error(err, operation, timeout))?;
        check_status(response, subject)
    }
}

#[async_trait]
impl DatasetSource for HttpDatasetSource {
    fn describe(&self) -> String {
        self.config.base_url.to_string()
    }

    async fn export(&self, dataset_id: &str) -> Result<ExportStream> {
        let url = self.endpoint(&["studies", dataset_id, "archive"])?;
        let timeout = self.config.export_timeout;
        let response = self.send(url, timeout, "dataset export", dataset_id).await?;
        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|err| map_transport_error(err, "dataset export", timeout)));
        Ok(stream.boxed())
    }

    async fn list_instances(&self, dataset_id: &str) -> Result<Vec<SourceInstance>> {
        let url = self.endpoint(&["studies", dataset_id, "instances"])?;
        let timeout = self.config.request_timeout;
        let entries: Vec<InstanceEntry> = self
            .send(url, timeout, "instance listing", dataset_id)
            .await?
            .json()
            .await
            .map_err(|err| map_transport_error(err, "instance listing", timeout))?;

        Ok(entries
            .into_iter()
            .map(|entry| SourceInstance {
                instance_id: entry.id,
                series_id: entry.parent_series,
                sop_instance_uid: entry.main_tags.and_then(|tags| tags.sop_instance_uid),
            })
            .collect())
    }

    async fn fetch_instance(&self, instance_id: &str) -> Result<Bytes> {
        let url = self.endpoint(&["instances", instance_id, "file"])?;
        let timeout = self.config.request_timeout;
        self.send(url, timeout, "instance download", instance_id)
            .await?
            .bytes()
            .await
            .map_err(|err| map_transport_error(err, "instance download", timeout))
    }
}

fn check_status(response: Response, subject: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::NOT_FOUND => ArchivistError::RecordNotFound(subject.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ArchivistError::AccessDenied(format!(
            "dataset source rejected credentials with status {status}"
        )),
        _ => ArchivistError::Network(format!("dataset source returned status {status}")),
    })
}

fn map_transport_error(err: reqwest::Error, operation: &str, timeout: Duration) -> ArchivistError {
    if err.is_timeout() {
        ArchivistError::Timeout {
            operation: operation.to_string(),
            seconds: timeout.as_secs(),
        }
    } else {
        ArchivistError::Network(format!("{operation} failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use archivist_common::error::ArchivistError;
    use axum::{
        Json, Router,
        extract::Path,
        http::{HeaderMap, StatusCode},
        routing::get,
    };
    use futures::StreamExt;
    use url::Url;

    use super::{HttpDatasetSource, SourceConfig};
    use crate::types::DatasetSource;

    async fn spawn_source() -> Url {
        let app = Router::new()
            .route(
                "/api/studies/{id}/archive",
                get(|Path(id): Path<String>, headers: HeaderMap| async move {
                    if !headers.contains_key("authorization") {
                        return Err(StatusCode::UNAUTHORIZED);
                    }
                    match id.as_str() {
                        "slow" => {
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            Ok(Vec::new())
                        }
                        "known" => Ok(b"PK\x03\x04export".to_vec()),
                        _ => Err(StatusCode::NOT_FOUND),
                    }
                }),
            )
            .route(
                "/api/studies/{id}/instances",
                get(|| async {
                    Json(serde_json::json!([
                        {"ID": "i-1", "ParentSeries": "s-1", "MainDicomTags": {"SOPInstanceUID": "1.2.3"}},
                        {"ID": "i-2"}
                    ]))
                }),
            )
            .route(
                "/api/instances/{id}/file",
                get(|Path(id): Path<String>| async move { format!("file:{id}") }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/api/")).unwrap()
    }

    fn source(base_url: Url, export_timeout: Duration) -> HttpDatasetSource {
        HttpDatasetSource::new(SourceConfig {
            username: Some("archivist".to_string()),
            password: Some("secret".to_string()),
            export_timeout,
            ..SourceConfig::new(base_url)
        })
        .unwrap()
    }

    #[tokio::test]
    async fn export_streams_body() {
        let source = source(spawn_source().await, Duration::from_secs(5));
        let mut stream = source.export("known").await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"PK\x03\x04export");
    }

    #[tokio::test]
    async fn unknown_dataset_is_record_not_found() {
        let source = source(spawn_source().await, Duration::from_secs(5));
        let err = source.export("missing").await.err().unwrap();
        assert!(matches!(err, ArchivistError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn missing_credentials_are_access_denied() {
        let base = spawn_source().await;
        let source = HttpDatasetSource::new(SourceConfig::new(base)).unwrap();
        let err = source.export("known").await.err().unwrap();
        assert!(matches!(err, ArchivistError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn slow_export_times_out() {
        let source = source(spawn_source().await, Duration::from_millis(200));
        let err = source.export("slow").await.err().unwrap();
        assert!(matches!(err, ArchivistError::Timeout { .. }));
        assert!(err.to_string().contains("dataset export"));
    }

    #[tokio::test]
    async fn instances_are_listed_and_fetched() {
        let source = source(spawn_source().await, Duration::from_secs(5));
        let instances = source.list_instances("known").await.unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].series_id.as_deref(), Some("s-1"));
        assert_eq!(instances[0].sop_instance_uid.as_deref(), Some("1.2.3"));
        assert!(instances[1].series_id.is_none());

        let data = source.fetch_instance("i-2").await.unwrap();
        assert_eq!(&data[..], b"file:i-2");
    }
}
