//! src/main.rs
//! ============================================================================
//! # `catalog`: command-line client for the file catalog
//!
//! ```text
//! catalog list [--file_type pdf] [--min_size 1024] [--from_date 2024-01-01] [search]
//! catalog stats
//! catalog upload <path>
//! catalog delete <id>
//! catalog download <id>
//! ```

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, warn};

use catalog_core::{
    cache::catalog::CatalogCache,
    config::Config,
    controller::{browser::CatalogBrowser, uploader::Uploader},
    logging::init_logging_with_config,
    model::{
        file::FileId,
        filter::FilterField,
        selection::SelectedFile,
    },
    service::{HttpFileService, SharedFileService},
    sync::mutation::MutationCoordinator,
};

const USAGE: &str = "usage: catalog <list [--<filter> <value>]... [search] | stats | upload <path> | delete <id> | download <id>>";

#[derive(Debug)]
enum Command {
    List {
        filters: Vec<(FilterField, String)>,
        search: Option<String>,
    },
    Stats,
    Upload(PathBuf),
    Delete(FileId),
    Download(FileId),
}

impl Command {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let name = args.next().ok_or_else(|| anyhow!(USAGE))?;

        let command = match name.as_str() {
            "list" => {
                let mut filters = Vec::new();
                let mut search = None;
                while let Some(arg) = args.next() {
                    if let Some(flag) = arg.strip_prefix("--") {
                        let field = flag.parse::<FilterField>()?;
                        let value = args
                            .next()
                            .with_context(|| format!("--{flag} needs a value"))?;
                        filters.push((field, value));
                    } else {
                        search = Some(arg);
                    }
                }
                Self::List { filters, search }
            }
            "stats" => Self::Stats,
            "upload" => Self::Upload(args.next().map(PathBuf::from).ok_or_else(|| anyhow!(USAGE))?),
            "delete" => Self::Delete(args.next().map(FileId::new).ok_or_else(|| anyhow!(USAGE))?),
            "download" => Self::Download(args.next().map(FileId::new).ok_or_else(|| anyhow!(USAGE))?),
            other => bail!("unknown command '{other}'\n{USAGE}"),
        };

        Ok(command)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let command = Command::parse(std::env::args().skip(1))?;

    let config = match Config::load().await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config, using defaults: {e:#}");
            Config::default()
        }
    };

    let _log_guard = init_logging_with_config(config.logging.clone())
        .await
        .context("Failed to initialize logging")?;
    info!(api = %config.api.base_url, ?command, "Starting catalog client");

    let service: SharedFileService =
        Arc::new(HttpFileService::new(&config.api).context("Failed to create API client")?);
    let cache = CatalogCache::with_config(config.cache.clone());
    let browser = CatalogBrowser::from_config(Arc::clone(&service), cache.clone(), &config);

    let outcome = run(command, &browser, &service, &cache, &config).await;

    browser.shutdown();
    cache.log_stats();

    if let Err(e) = &outcome {
        warn!(error = %e, "Command failed");
    }
    outcome
}

async fn run(
    command: Command,
    browser: &CatalogBrowser,
    service: &SharedFileService,
    cache: &CatalogCache,
    config: &Config,
) -> Result<()> {
    match command {
        Command::List { filters, search } => {
            for (field, value) in filters {
                browser
                    .set_field(field, &value)
                    .with_context(|| format!("Invalid value for {field}"))?;
            }
            if let Some(term) = search {
                browser.search(term);
                browser.flush_search();
            }

            let files = browser.files().await.context("Failed to list files")?;
            if files.is_empty() {
                println!("No files found.");
            }
            for f in files.iter() {
                let dup = if f.is_duplicate { " (duplicate)" } else { "" };
                println!(
                    "{:<24} {:<40} {:>10} {:<6} {}{dup}",
                    f.id,
                    f.display_name(),
                    f.human_size(),
                    f.file_type,
                    f.uploaded_at.format("%Y-%m-%d %H:%M"),
                );
            }
        }

        Command::Stats => {
            let stats = browser
                .storage_stats()
                .await
                .context("Failed to fetch storage statistics")?;
            println!("{}", stats.summary());
        }

        Command::Upload(path) => {
            let file = SelectedFile::from_path(&path)
                .await
                .with_context(|| format!("Cannot select {}", path.display()))?;

            let coordinator = MutationCoordinator::new(cache.clone(), Arc::clone(service));
            let mut uploader = Uploader::new(config.upload.clone(), coordinator);
            if !uploader.choose(file) {
                let reason = uploader
                    .selection()
                    .state()
                    .error
                    .as_ref()
                    .map_or_else(|| "rejected".to_owned(), ToString::to_string);
                bail!("Cannot upload {}: {reason}", path.display());
            }

            let record = uploader.submit().await.context("Upload failed")?;
            if record.is_duplicate {
                println!(
                    "Uploaded {} as {} (duplicate of {})",
                    record.name,
                    record.id,
                    record.original_filename.as_deref().unwrap_or("an existing file")
                );
            } else {
                println!("Uploaded {} as {}", record.name, record.id);
            }
        }

        Command::Delete(id) => {
            browser
                .delete(id.clone())
                .await
                .with_context(|| format!("Failed to delete {id}"))?;
            println!("Deleted {id}");
        }

        Command::Download(id) => {
            let files = browser.files().await.context("Failed to list files")?;
            let record = files
                .iter()
                .find(|f| f.id == id)
                .with_context(|| format!("No file with id {id}"))?;

            let path = browser
                .download(record)
                .await
                .with_context(|| format!("Failed to download {id}"))?;
            println!("Saved {}", path.display());
        }
    }

    Ok(())
}
