//! `reqwest` client for the catalog's REST API.
//!
//! Thin by intent: builds requests, maps statuses, decodes JSON. There is no
//! retry here; the query cache retries reads on the next access and mutations
//! are never retried.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{
    Client, Response, StatusCode, Url,
    multipart::{Form, Part},
};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use super::{FileService, ServiceResult, UploadPayload};
use crate::{
    config::ApiConfig,
    error::{ServiceError, SyncError, SyncResult},
    model::{
        file::{FileId, FileRecord, StorageStats},
        filter::FilterCriteria,
    },
};

#[derive(Debug, Clone)]
pub struct HttpFileService {
    client: Client,
    // Parsed base, used to resolve storage locators.
    base: Url,
    // Base without trailing slash, prefix of every route.
    api_root: String,
}

impl HttpFileService {
    pub fn new(config: &ApiConfig) -> SyncResult<Self> {
        let api_root = config.base_url.trim_end_matches('/').to_owned();
        let base = Url::parse(&api_root)
            .map_err(|e| SyncError::Config(format!("invalid api base_url '{api_root}': {e}").into()))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {e}").into()))?;

        Ok(Self {
            client,
            base,
            api_root,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_root, path.trim_start_matches('/'))
    }

    /// Absolute locators are used as-is; relative ones resolve against the
    /// base URL (a leading `/` resolves against its origin).
    fn resolve_locator(&self, locator: &str) -> ServiceResult<Url> {
        self.base
            .join(locator)
            .map_err(|e| ServiceError::Decode(format!("invalid locator '{locator}': {e}")))
    }

    async fn decode<T: DeserializeOwned>(resp: Response) -> ServiceResult<T> {
        resp.json::<T>()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))
    }
}

fn transport_error(e: &reqwest::Error) -> ServiceError {
    if e.is_decode() {
        ServiceError::Decode(e.to_string())
    } else {
        ServiceError::Network(e.to_string())
    }
}

async fn ensure_success(resp: Response) -> ServiceResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), body = %body, "Catalog request rejected");

    if status == StatusCode::NOT_FOUND {
        Err(ServiceError::NotFound(body))
    } else {
        Err(ServiceError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl FileService for HttpFileService {
    #[instrument(skip(self, payload), fields(file_name = %payload.file_name, size = payload.size()))]
    async fn upload(&self, payload: UploadPayload) -> ServiceResult<FileRecord> {
        let part = Part::bytes(payload.content.to_vec()).file_name(payload.file_name);
        let form = Form::new().part("file", part);

        let resp = self
            .client
            .post(self.endpoint("files/"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        Self::decode(ensure_success(resp).await?).await
    }

    #[instrument(skip(self), fields(criteria = %criteria.cache_key()))]
    async fn list(&self, criteria: &FilterCriteria) -> ServiceResult<Vec<FileRecord>> {
        let resp = self
            .client
            .get(self.endpoint("files/"))
            .query(&criteria.to_query_pairs())
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        Self::decode(ensure_success(resp).await?).await
    }

    #[instrument(skip(self), fields(file_id = %id))]
    async fn delete(&self, id: &FileId) -> ServiceResult<()> {
        let resp = self
            .client
            .delete(self.endpoint(&format!("files/{id}/")))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        ensure_success(resp).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn storage_stats(&self) -> ServiceResult<StorageStats> {
        let resp = self
            .client
            .get(self.endpoint("files/storage_statistics/"))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let stats: StorageStats = match ensure_success(resp).await {
            Ok(resp) => Self::decode(resp).await?,
            // The collaborator has no statistics row until the first upload.
            Err(ServiceError::NotFound(_)) => StorageStats {
                total_files: 0,
                unique_files: 0,
                duplicates: 0,
                total_size: 0,
                actual_size: Some(0),
                saved_size: 0,
                last_updated: Utc::now(),
            },
            Err(e) => return Err(e),
        };

        if let Err(e) = stats.check_invariants() {
            warn!(
                marker = "SERVICE_OPERATION",
                operation_type = "stats_invariant",
                error = %e,
                "Storage statistics violate invariants"
            );
        }

        Ok(stats)
    }

    #[instrument(skip(self))]
    async fn fetch_blob(&self, locator: &str) -> ServiceResult<Bytes> {
        let url = self.resolve_locator(locator)?;

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        ensure_success(resp)
            .await?
            .bytes()
            .await
            .map_err(|e| transport_error(&e))
    }
}
