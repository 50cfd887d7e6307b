//! ``src/sync/download.rs``
//! ============================================================================
//! # Download Executor
//!
//! Fetches the bytes behind a storage locator and saves them locally. The
//! content is staged in a temporary file inside the destination directory
//! and persisted under the requested name, so a failed download never leaves
//! a partial file behind. Downloads have their own pending flag and never
//! touch the query cache.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{SyncError, SyncResult},
    model::file::FileRecord,
    service::SharedFileService,
    util::pending::PendingFlag,
};

/// Attempts at a free "name (n).ext" before giving up.
const MAX_NAME_ATTEMPTS: usize = 100;

/// Where downloaded content ends up.
#[async_trait]
pub trait SaveTarget: std::fmt::Debug + Send + Sync {
    /// Save `content` as `filename`, returning the final path.
    async fn save(&self, filename: &str, content: Bytes) -> SyncResult<PathBuf>;
}

/// Saves into one directory. Existing files are never overwritten; a
/// numbered name is chosen instead, like a browser's download shelf.
#[derive(Debug, Clone)]
pub struct DirectorySaveTarget {
    dir: PathBuf,
}

impl DirectorySaveTarget {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Reduce a remote-supplied name to a single safe path component.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();

    match cleaned {
        "" | "." | ".." => None,
        name => Some(name.to_owned()),
    }
}

fn numbered(name: &str, n: usize) -> String {
    if n == 0 {
        return name.to_owned();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}

fn write_unique(dir: &Path, name: &str, content: &[u8]) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let mut staged = tempfile::Builder::new()
        .prefix(".catalog-")
        .suffix(".part")
        .tempfile_in(dir)?;
    staged.write_all(content)?;
    staged.as_file().sync_all()?;

    for n in 0..MAX_NAME_ATTEMPTS {
        let candidate = dir.join(numbered(name, n));
        match staged.persist_noclobber(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => staged = e.file,
            Err(e) => return Err(e.error),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {name} after {MAX_NAME_ATTEMPTS} attempts"),
    ))
}

#[async_trait]
impl SaveTarget for DirectorySaveTarget {
    async fn save(&self, filename: &str, content: Bytes) -> SyncResult<PathBuf> {
        let name = sanitize_filename(filename)
            .ok_or_else(|| SyncError::validation(format!("invalid file name '{filename}'")))?;
        let dir = self.dir.clone();

        let path = tokio::task::spawn_blocking(move || write_unique(&dir, &name, &content))
            .await
            .map_err(|e| SyncError::download(filename, format!("save task failed: {e}")))??;

        debug!(path = %path.display(), "Download persisted");
        Ok(path)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadExecutor {
    service: SharedFileService,
    target: Arc<dyn SaveTarget>,
    pending: PendingFlag,
}

impl DownloadExecutor {
    pub fn new(service: SharedFileService, target: Arc<dyn SaveTarget>) -> Self {
        Self {
            service,
            target,
            pending: PendingFlag::new(),
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_pending()
    }

    pub fn watch_pending(&self) -> watch::Receiver<bool> {
        self.pending.subscribe()
    }

    /// Fetch `locator` and save it as `filename`. No retry.
    #[instrument(skip(self))]
    pub async fn download(&self, locator: &str, filename: &str) -> SyncResult<PathBuf> {
        let _pending = self.pending.begin();

        let content = match self.service.fetch_blob(locator).await {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    marker = "DOWNLOAD_OPERATION",
                    operation_type = "fetch_failure",
                    locator,
                    error = %e,
                    "Download fetch failed"
                );
                return Err(SyncError::download(locator, e));
            }
        };

        let size = content.len();
        let path = self.target.save(filename, content).await.map_err(|e| match e {
            SyncError::Download { .. } => e,
            other => SyncError::download(locator, other),
        })?;

        info!(
            marker = "DOWNLOAD_OPERATION",
            operation_type = "download_complete",
            locator,
            size,
            path = %path.display(),
            "Download saved"
        );
        Ok(path)
    }

    /// Download a record under the name shown for it.
    pub async fn download_record(&self, record: &FileRecord) -> SyncResult<PathBuf> {
        self.download(&record.locator, record.display_name()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ServiceError,
        service::{MemoryFileService, memory::ServiceCall},
    };
    use std::time::Duration;

    fn executor(dir: &Path) -> (DownloadExecutor, Arc<MemoryFileService>) {
        let svc = Arc::new(MemoryFileService::new());
        let exec = DownloadExecutor::new(svc.clone(), Arc::new(DirectorySaveTarget::new(dir)));
        (exec, svc)
    }

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_filename("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename("C:\\Users\\x\\a.txt").as_deref(), Some("a.txt"));
        assert_eq!(sanitize_filename("dir/.."), None);
        assert_eq!(sanitize_filename("  "), None);
        assert_eq!(sanitize_filename("report.pdf").as_deref(), Some("report.pdf"));
    }

    #[test]
    fn test_numbered_names() {
        assert_eq!(numbered("a.pdf", 0), "a.pdf");
        assert_eq!(numbered("a.pdf", 2), "a (2).pdf");
        assert_eq!(numbered("README", 1), "README (1)");
        assert_eq!(numbered(".env", 1), ".env (1)");
    }

    #[tokio::test]
    async fn test_download_saves_content_under_display_name() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, svc) = executor(dir.path());
        svc.seed("first.txt", "shared");
        let dup = svc.seed("second.txt", "shared");

        let path = exec.download_record(&dup).await.unwrap();
        assert_eq!(path, dir.path().join("first.txt"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"shared");
        assert!(!exec.is_pending());

        // Same name again lands beside it.
        let again = exec.download_record(&dup).await.unwrap();
        assert_eq!(again, dir.path().join("first (1).txt"));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_download_error_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, svc) = executor(dir.path());
        let rec = svc.seed("a.txt", "a");
        svc.fail(ServiceCall::FetchBlob, ServiceError::Network("reset".into()));

        let err = exec.download_record(&rec).await.unwrap_err();
        assert!(matches!(err, SyncError::Download { .. }));
        assert_eq!(svc.calls(ServiceCall::FetchBlob), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(!exec.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_flag_spans_the_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let svc = Arc::new(MemoryFileService::new().with_latency(Duration::from_millis(50)));
        let rec = svc.seed("a.txt", "a");
        let exec = DownloadExecutor::new(svc.clone(), Arc::new(DirectorySaveTarget::new(dir.path())));
        let mut pending = exec.watch_pending();
        assert!(!*pending.borrow_and_update());

        let task = {
            let exec = exec.clone();
            tokio::spawn(async move { exec.download_record(&rec).await })
        };

        pending.changed().await.unwrap();
        assert!(*pending.borrow_and_update());
        assert!(exec.is_pending());

        let path = task.await.unwrap().unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"a");
        assert!(!exec.is_pending());
        pending.changed().await.unwrap();
        assert!(!*pending.borrow());
    }

    #[tokio::test]
    async fn test_unusable_name_is_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, svc) = executor(dir.path());
        let rec = svc.seed("a.txt", "a");

        let err = exec.download(&rec.locator, "..").await.unwrap_err();
        assert!(matches!(err, SyncError::Download { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
