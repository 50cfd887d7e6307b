//! ``src/model/file.rs``
//! ============================================================================
//! # Catalog records: files and aggregate storage statistics
//!
//! These mirror the collaborator's JSON shapes. Duplicate detection and the
//! statistics themselves are computed remotely; the client only checks the
//! arithmetic it can check.

use std::fmt;

use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Opaque record identity assigned by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A single catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,

    pub name: String,

    /// Storage locator, fetched by the download executor.
    #[serde(rename = "file")]
    pub locator: String,

    pub size: u64,

    pub file_type: String,

    pub uploaded_at: DateTime<Utc>,

    pub is_duplicate: bool,

    /// Name of the record this one duplicates, if any.
    #[serde(default)]
    pub original_filename: Option<String>,
}

impl FileRecord {
    /// Name shown to the user: the original's name for duplicates.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.original_filename.as_deref().unwrap_or(&self.name)
    }

    /// Bytes not stored because this record reuses existing content.
    #[must_use]
    pub const fn bytes_saved(&self) -> u64 {
        if self.is_duplicate { self.size } else { 0 }
    }

    #[must_use]
    pub fn human_size(&self) -> String {
        ByteSize::b(self.size).to_string()
    }
}

/// Aggregate storage and deduplication figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_files: u64,

    pub unique_files: u64,

    pub duplicates: u64,

    pub total_size: u64,

    /// Bytes physically stored. Older collaborators omit it.
    #[serde(default)]
    pub actual_size: Option<u64>,

    pub saved_size: u64,

    pub last_updated: DateTime<Utc>,
}

impl StorageStats {
    /// Verify `unique_files + duplicates == total_files` and
    /// `saved_size <= total_size`.
    pub fn check_invariants(&self) -> SyncResult<()> {
        if self.unique_files.checked_add(self.duplicates) != Some(self.total_files) {
            return Err(SyncError::validation(format!(
                "unique_files ({}) + duplicates ({}) != total_files ({})",
                self.unique_files, self.duplicates, self.total_files
            )));
        }

        if self.saved_size > self.total_size {
            return Err(SyncError::validation(format!(
                "saved_size ({}) exceeds total_size ({})",
                self.saved_size, self.total_size
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn stored_size(&self) -> u64 {
        self.actual_size
            .unwrap_or_else(|| self.total_size.saturating_sub(self.saved_size))
    }

    /// Fraction of logical bytes saved by deduplication, in `0.0..=1.0`.
    #[expect(clippy::cast_precision_loss, reason = "Display-only ratio")]
    #[must_use]
    pub fn dedup_ratio(&self) -> f64 {
        if self.total_size == 0 {
            0.0
        } else {
            self.saved_size as f64 / self.total_size as f64
        }
    }

    /// One-line summary for status output.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} files ({} unique, {} duplicates), {} total, {} saved ({:.1}%)",
            self.total_files,
            self.unique_files,
            self.duplicates,
            ByteSize::b(self.total_size),
            ByteSize::b(self.saved_size),
            self.dedup_ratio() * 100.0
        )
    }
}
