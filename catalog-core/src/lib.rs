//! Client-side cache and coordination engine for a deduplicating file
//! catalog: cached catalog reads with coalescing and invalidation, debounced
//! search input, mutation sequencing, downloads and the upload selection
//! state machine.

pub mod error;
pub use error::{ServiceError, SyncError, SyncResult};

pub mod config;
pub use config::Config;

pub mod logging;

pub mod cache {
    pub mod query_cache;
    pub use query_cache::{EntrySnapshot, KeyPattern, QueryCache, QueryKey, QueryKind};

    pub mod catalog;
    pub use catalog::{CatalogCache, CatalogQueries, CatalogValue};
}

pub mod model {
    pub mod file;
    pub use file::{FileId, FileRecord, StorageStats};

    pub mod filter;
    pub use filter::{FilterCriteria, FilterField};

    pub mod selection;
    pub use selection::{
        SelectedFile, SelectionError, SelectionEvent, SelectionPhase, UploadPolicy,
        UploadSelection,
    };
}

pub mod service;

pub mod sync {
    pub mod mutation;
    pub use mutation::{Mutation, MutationCoordinator, MutationOutcome};

    pub mod download;
    pub use download::{DirectorySaveTarget, DownloadExecutor, SaveTarget};
}

pub mod controller {
    pub mod browser;
    pub use browser::CatalogBrowser;

    pub mod uploader;
    pub use uploader::Uploader;
}

pub mod util {
    pub mod debounce;
    pub use debounce::{DebounceConfig, Debouncer};

    pub mod pending;
    pub use pending::{PendingFlag, PendingGuard};
}
