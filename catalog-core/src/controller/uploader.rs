//! Upload controller: drop-zone events in, one upload mutation out.

use tracing::{info, instrument};

use crate::{
    error::SyncResult,
    model::{
        file::FileRecord,
        selection::{SelectedFile, SelectionEvent, UploadPolicy, UploadSelection},
    },
    service::UploadPayload,
    sync::mutation::MutationCoordinator,
};

#[derive(Debug)]
pub struct Uploader {
    selection: UploadSelection,
    coordinator: MutationCoordinator,
}

impl Uploader {
    /// `coordinator` should share the cache used for catalog reads so a
    /// finished upload invalidates them.
    pub fn new(policy: UploadPolicy, coordinator: MutationCoordinator) -> Self {
        Self {
            selection: UploadSelection::new(policy),
            coordinator,
        }
    }

    #[must_use]
    pub const fn selection(&self) -> &UploadSelection {
        &self.selection
    }

    pub fn apply(&mut self, event: SelectionEvent) {
        self.selection.apply(event);
    }

    /// Equivalent to a file-input change event.
    pub fn choose(&mut self, file: SelectedFile) -> bool {
        self.selection.choose(file)
    }

    #[must_use]
    pub fn is_uploading(&self) -> bool {
        self.coordinator.is_pending()
    }

    /// Upload the current selection.
    ///
    /// Without a selection this fails locally with "no file selected". Any
    /// failure after that, including reading the file, ends in the "upload
    /// failed" state with the selection cleared.
    #[instrument(skip(self))]
    pub async fn submit(&mut self) -> SyncResult<FileRecord> {
        let submission = self.selection.begin_submit()?;

        let result = match UploadPayload::from_selected(&submission.file).await {
            Ok(payload) => self.coordinator.upload(payload).await,
            Err(e) => Err(e),
        };

        self.selection.finish_submit(submission.ticket, result.is_ok());

        if let Ok(record) = &result {
            info!(
                file_id = %record.id,
                is_duplicate = record.is_duplicate,
                "Upload complete"
            );
        }
        result
    }
}
