//! ``src/model/selection.rs``
//! ============================================================================
//! # Upload selection state machine
//!
//! Tracks the file chosen for upload (via file input or drag-and-drop), the
//! validation/upload error shown next to it, and whether a drag is hovering
//! the drop zone. The drag flag is orthogonal: it never clears a selection.
//!
//! ```text
//!   Empty ──choose(valid)──▶ Selected ──submit ok──▶ Empty
//!     │                        │   └────submit err──▶ Error("upload failed")
//!     └─choose(invalid)─▶ Error ◀─────────┘
//!   Empty ──submit──▶ Error("no file selected")
//! ```

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs as TokioFs;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Default upload ceiling: 10 MiB.
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 10 * 1024 * 1024;

/// Why a selection or submission was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("no file selected")]
    NoFileSelected,

    #[error("exceeds size limit")]
    ExceedsSizeLimit { size: u64, limit: u64 },

    #[error("file type not allowed")]
    TypeNotAllowed(String),

    #[error("file is empty")]
    EmptyFile,

    #[error("upload failed")]
    UploadFailed,
}

impl From<SelectionError> for SyncError {
    fn from(e: SelectionError) -> Self {
        Self::validation(e)
    }
}

/// Pure, network-free checks applied when a file is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadPolicy {
    /// Largest accepted file, in bytes.
    pub max_size: u64,

    /// Accepted type tags, compared ignoring ASCII case. `None` accepts any type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_types: Option<Vec<String>>,

    pub allow_empty: bool,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_UPLOAD_SIZE,
            allowed_types: None,
            allow_empty: false,
        }
    }
}

impl UploadPolicy {
    #[must_use]
    pub const fn with_max_size(max_size: u64) -> Self {
        Self {
            max_size,
            allowed_types: None,
            allow_empty: false,
        }
    }

    pub fn validate(&self, file: &SelectedFile) -> Result<(), SelectionError> {
        if file.size > self.max_size {
            return Err(SelectionError::ExceedsSizeLimit {
                size: file.size,
                limit: self.max_size,
            });
        }

        if file.size == 0 && !self.allow_empty {
            return Err(SelectionError::EmptyFile);
        }

        if let Some(allowed) = &self.allowed_types
            && !allowed.iter().any(|t| t.eq_ignore_ascii_case(&file.file_type))
        {
            return Err(SelectionError::TypeNotAllowed(file.file_type.clone()));
        }

        Ok(())
    }
}

/// Where the selected file's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
}

/// A file chosen for upload. Size and type are captured at selection time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    name: String,
    size: u64,
    file_type: String,
    source: FileSource,
}

/// Type tag as the collaborator derives it: text after the last dot, case kept.
pub(crate) fn type_tag(name: &str) -> String {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_owned())
        .unwrap_or_default()
}

impl SelectedFile {
    pub fn from_bytes(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        let name = name.into();
        let content = content.into();
        Self {
            file_type: type_tag(&name),
            size: content.len() as u64,
            name,
            source: FileSource::Memory(content),
        }
    }

    /// Select a file on disk; reads metadata now, contents at submit time.
    pub async fn from_path(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let meta = TokioFs::metadata(path).await?;
        if !meta.is_file() {
            return Err(SyncError::validation(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SyncError::validation("path has no file name"))?;

        Ok(Self {
            file_type: type_tag(&name),
            size: meta.len(),
            name,
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn file_type(&self) -> &str {
        &self.file_type
    }

    #[must_use]
    pub const fn source(&self) -> &FileSource {
        &self.source
    }

    /// Load the bytes to upload.
    pub async fn read_contents(&self) -> SyncResult<Bytes> {
        match &self.source {
            FileSource::Memory(bytes) => Ok(bytes.clone()),
            FileSource::Path(path) => Ok(Bytes::from(TokioFs::read(path).await?)),
        }
    }
}

/// Raw selection state. `file` and `error` are never both set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionState {
    pub file: Option<SelectedFile>,
    pub error: Option<SelectionError>,
    pub drag_active: bool,
}

/// The state machine's position, ignoring the drag overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPhase<'a> {
    Empty,
    Selected(&'a SelectedFile),
    Error(&'a SelectionError),
}

/// Pointer, file-input and drag events routed from the drop zone.
#[derive(Debug, Clone)]
pub enum SelectionEvent {
    FileChosen(SelectedFile),
    DragEnter,
    DragOver,
    DragLeave,
    Drop(Option<SelectedFile>),
}

/// A selection handed to the uploader. The ticket ties the eventual outcome
/// back to the selection it came from.
#[derive(Debug, Clone)]
pub struct Submission {
    pub ticket: u64,
    pub file: SelectedFile,
}

#[derive(Debug, Clone, Default)]
pub struct UploadSelection {
    state: SelectionState,
    policy: UploadPolicy,
    // Incremented per chosen file.
    ticket: u64,
}

impl UploadSelection {
    #[must_use]
    pub fn new(policy: UploadPolicy) -> Self {
        Self {
            state: SelectionState::default(),
            policy,
            ticket: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &SelectionState {
        &self.state
    }

    #[must_use]
    pub const fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    #[must_use]
    pub fn phase(&self) -> SelectionPhase<'_> {
        match (&self.state.file, &self.state.error) {
            (Some(file), _) => SelectionPhase::Selected(file),
            (None, Some(err)) => SelectionPhase::Error(err),
            (None, None) => SelectionPhase::Empty,
        }
    }

    #[must_use]
    pub const fn drag_active(&self) -> bool {
        self.state.drag_active
    }

    #[must_use]
    pub const fn selected(&self) -> Option<&SelectedFile> {
        self.state.file.as_ref()
    }

    /// Submit button enabled.
    #[must_use]
    pub const fn can_submit(&self) -> bool {
        self.state.file.is_some()
    }

    pub fn apply(&mut self, event: SelectionEvent) {
        match event {
            SelectionEvent::FileChosen(file) => {
                self.choose(file);
            }
            SelectionEvent::DragEnter | SelectionEvent::DragOver => {
                self.state.drag_active = true;
            }
            SelectionEvent::DragLeave => {
                self.state.drag_active = false;
            }
            SelectionEvent::Drop(file) => {
                self.state.drag_active = false;
                if let Some(file) = file {
                    self.choose(file);
                }
            }
        }
    }

    /// Validate and select a file. Returns whether it was accepted.
    pub fn choose(&mut self, file: SelectedFile) -> bool {
        self.ticket = self.ticket.wrapping_add(1);

        match self.policy.validate(&file) {
            Ok(()) => {
                debug!(file_name = %file.name, size = file.size, "File selected for upload");
                self.state.file = Some(file);
                self.state.error = None;
                true
            }
            Err(e) => {
                debug!(file_name = %file.name, error = %e, "File rejected by upload policy");
                self.state.file = None;
                self.state.error = Some(e);
                false
            }
        }
    }

    /// Start an upload of the current selection.
    ///
    /// From `Empty` (or `Error`) this moves to `Error("no file selected")`.
    pub fn begin_submit(&mut self) -> Result<Submission, SelectionError> {
        match &self.state.file {
            Some(file) => {
                self.state.error = None;
                Ok(Submission {
                    ticket: self.ticket,
                    file: file.clone(),
                })
            }
            None => {
                self.state.error = Some(SelectionError::NoFileSelected);
                Err(SelectionError::NoFileSelected)
            }
        }
    }

    /// Record an upload outcome. Success empties the selection; failure
    /// clears it and shows "upload failed". Outcomes for a selection that has
    /// since been replaced are ignored.
    pub fn finish_submit(&mut self, ticket: u64, succeeded: bool) {
        if ticket != self.ticket {
            debug!(ticket, current = self.ticket, "Ignoring outcome for replaced selection");
            return;
        }

        self.state.file = None;
        self.state.error = (!succeeded).then_some(SelectionError::UploadFailed);
    }

    /// Back to `Empty`, keeping the drag flag.
    pub fn reset(&mut self) {
        self.state.file = None;
        self.state.error = None;
    }
}
