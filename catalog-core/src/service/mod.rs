//! Remote catalog collaborator.
//!
//! The engine talks to the catalog only through [`FileService`]. The HTTP
//! implementation lives in [`http`]; [`memory`] is an in-process double used
//! by the engine's tests and available to downstream crates.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::{ServiceError, SyncResult},
    model::{
        file::{FileId, FileRecord, StorageStats},
        filter::FilterCriteria,
        selection::SelectedFile,
    },
};

pub mod http;
pub use http::HttpFileService;

pub mod memory;
pub use memory::MemoryFileService;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Shared handle to whichever collaborator is in use.
pub type SharedFileService = Arc<dyn FileService>;

/// File content handed to [`FileService::upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPayload {
    pub file_name: String,
    pub content: Bytes,
}

impl UploadPayload {
    pub fn new(file_name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            content: content.into(),
        }
    }

    /// Read a selected file's content into a payload.
    pub async fn from_selected(file: &SelectedFile) -> SyncResult<Self> {
        Ok(Self {
            file_name: file.name().to_owned(),
            content: file.read_contents().await?,
        })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// Operations the remote catalog offers.
#[async_trait]
pub trait FileService: fmt::Debug + Send + Sync {
    /// Store a file; the collaborator decides whether it is a duplicate.
    async fn upload(&self, payload: UploadPayload) -> ServiceResult<FileRecord>;

    /// Records matching `criteria`, newest first.
    async fn list(&self, criteria: &FilterCriteria) -> ServiceResult<Vec<FileRecord>>;

    async fn delete(&self, id: &FileId) -> ServiceResult<()>;

    async fn storage_stats(&self) -> ServiceResult<StorageStats>;

    /// Raw bytes behind a record's storage locator.
    async fn fetch_blob(&self, locator: &str) -> ServiceResult<Bytes>;
}
