//! Crawl orchestrator.
//!
//! One crawl run moves through fixed phases:
//!
//! ```text
//! Authenticating → Discovering → (PolicySelection) → Walking+Extracting → Uploading
//! ```
//!
//! * **Discovering** lists every folder below the root before any file is
//!   touched. It runs in preflight mode, and in the other modes whenever a
//!   folder cache already exists (so that folders new since the last run are
//!   surfaced before extraction starts).
//! * **PolicySelection** (preflight only) asks about each discovered folder
//!   in walker order, with answers inherited by descendants.
//! * **Walking** visits folders depth-first: a folder's subfolders are
//!   finished before its own files. Per listed folder, the files are first
//!   classified by the sync planner in one batched index lookup; unchanged
//!   files are never downloaded.
//!
//! Everything is sequential. All run state lives in one [`CrawlOutcome`]
//! owned by the orchestrator for the duration of the run.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::{DeviceCodeAuth, TokenHolder};
use crate::config::Config;
use crate::discovery::{list_folder, DiscoveryWalker, ListingTimeouts};
use crate::drive::{DriveApi, GraphDrive};
use crate::embedding::create_embedder;
use crate::error::DriveResult;
use crate::extract::{ExtractLimits, Extractor, FileFormat};
use crate::index::{PineconeIndex, VectorIndex};
use crate::models::{
    ExtractedDocument, FailedFile, FailedFolder, RemoteItem, SkippedFile, SyncDecision,
};
use crate::ocr::OcrServices;
use crate::planner::SyncPlanner;
use crate::policy::{DecisionSource, FolderDecision, FolderPolicyStore, NonInteractive};
use crate::progress::{format_number, CrawlProgressEvent, CrawlProgressReporter, ProgressMode};
use crate::prompt::StdinPrompter;
use crate::storage::{AzureBlobStore, DocumentStore};
use crate::upload::{UploadReport, UploadSettings, Uploader};

/// How folder decisions are obtained for this run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum CrawlMode {
    /// Discover all folders first, then choose a decision for each.
    Preflight,
    /// Walk directly, asking about uncached folders as they are reached.
    Interactive,
    /// Never prompt; uncached folders are processed.
    Unattended,
}

/// Run-wide knobs, resolved from config and command-line flags.
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub mode: CrawlMode,
    pub max_files: Option<usize>,
    pub listing: ListingTimeouts,
    pub download_timeout_secs: u64,
    pub download_retries: u32,
    /// Linear backoff unit: attempt `n` waits `n × retry_backoff`.
    pub retry_backoff: Duration,
    pub discovery_retry_rounds: u32,
    pub fetch_batch_size: usize,
    pub excludes: GlobSet,
}

impl CrawlOptions {
    pub fn from_config(config: &Config, mode: CrawlMode) -> Result<Self> {
        let crawl = &config.crawl;
        Ok(Self {
            mode,
            max_files: crawl.max_files,
            listing: ListingTimeouts {
                first_secs: crawl.listing_timeout_secs,
                retry_secs: crawl.listing_retry_timeout_secs,
            },
            download_timeout_secs: crawl.download_timeout_secs,
            download_retries: crawl.download_retries,
            retry_backoff: Duration::from_secs(crawl.retry_backoff_secs),
            discovery_retry_rounds: crawl.discovery_retry_rounds,
            fetch_batch_size: config.index.fetch_batch_size,
            excludes: build_globset(&crawl.exclude_globs)?,
        })
    }
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    builder.build().context("Failed to build glob set")
}

/// Everything one walk produced.
#[derive(Debug, Default)]
pub struct CrawlOutcome {
    /// Files counted against the ceiling, including unchanged and listed ones.
    pub processed: usize,
    pub extracted: Vec<ExtractedDocument>,
    pub failed: Vec<FailedFile>,
    pub skipped: Vec<SkippedFile>,
    pub unchanged: usize,
    pub failed_folders: Vec<FailedFolder>,
    /// Folders that were missing from an existing cache.
    pub new_folders: Vec<String>,
    pub ceiling_reached: bool,
}

/// Pending walk steps. `Files` is pushed below a folder's subfolders so the
/// subfolders finish first.
enum Step {
    Enter(RemoteItem),
    Files { folder: String, files: Vec<RemoteItem> },
}

pub struct Crawler<'a> {
    drive: &'a dyn DriveApi,
    tokens: &'a TokenHolder,
    index: &'a dyn VectorIndex,
    extractor: &'a Extractor,
    progress: &'a dyn CrawlProgressReporter,
    options: CrawlOptions,
}

impl<'a> Crawler<'a> {
    pub fn new(
        drive: &'a dyn DriveApi,
        tokens: &'a TokenHolder,
        index: &'a dyn VectorIndex,
        extractor: &'a Extractor,
        progress: &'a dyn CrawlProgressReporter,
        options: CrawlOptions,
    ) -> Self {
        Self {
            drive,
            tokens,
            index,
            extractor,
            progress,
            options,
        }
    }

    /// Discover (when needed), settle folder decisions, then walk and extract.
    pub async fn crawl(
        &self,
        root_id: &str,
        root_path: &str,
        policy: &mut FolderPolicyStore,
        source: &mut dyn DecisionSource,
    ) -> Result<CrawlOutcome> {
        let mut outcome = CrawlOutcome::default();
        let mut unreachable: HashSet<String> = HashSet::new();

        let needs_discovery = self.options.mode == CrawlMode::Preflight || !policy.is_empty();
        if needs_discovery {
            let walker =
                DiscoveryWalker::new(self.drive, self.tokens, self.options.listing, self.progress);
            let (mut folders, failed) = walker.discover(root_id, root_path).await;
            let still_failing = walker
                .retry_failed(
                    root_path,
                    &mut folders,
                    failed,
                    self.options.discovery_retry_rounds,
                    source,
                )
                .await?;
            unreachable.extend(still_failing.iter().map(|f| f.path.clone()));
            outcome.failed_folders.extend(still_failing);

            if self.options.mode == CrawlMode::Preflight {
                policy.select_preflight(&folders, source)?;
            } else {
                outcome.new_folders = policy.detect_new_folders(&folders, source)?;
            }
        }

        let interactive = self.options.mode == CrawlMode::Interactive;
        self.walk(root_id, root_path, interactive, policy, source, &unreachable, &mut outcome)
            .await?;
        Ok(outcome)
    }

    fn at_ceiling(&self, outcome: &mut CrawlOutcome) -> bool {
        match self.options.max_files {
            Some(max) if outcome.processed >= max => {
                if !outcome.ceiling_reached {
                    info!(max_files = max, "File limit reached");
                    outcome.ceiling_reached = true;
                }
                true
            }
            _ => false,
        }
    }

    fn excluded(&self, file: &RemoteItem) -> bool {
        if self.options.excludes.is_match(&file.name) {
            debug!(file = %file.path(), "Excluded by glob");
            true
        } else {
            false
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn walk(
        &self,
        root_id: &str,
        root_path: &str,
        interactive: bool,
        policy: &mut FolderPolicyStore,
        source: &mut dyn DecisionSource,
        unreachable: &HashSet<String>,
        outcome: &mut CrawlOutcome,
    ) -> Result<()> {
        let mut planner = SyncPlanner::new(self.index, self.options.fetch_batch_size);
        let mut stack: Vec<Step> = Vec::new();
        self.open_folder(root_id, root_path, &mut stack, outcome).await;

        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(folder) => {
                    if self.at_ceiling(outcome) {
                        continue;
                    }
                    let path = folder.path();
                    if unreachable.contains(&path) {
                        debug!(folder = %path, "Skipping folder that failed discovery");
                        continue;
                    }
                    match policy.resolve(&path, &folder.name, interactive, source)? {
                        FolderDecision::Process => {
                            self.open_folder(&folder.id, &path, &mut stack, outcome).await;
                        }
                        FolderDecision::ListOnly => {
                            self.list_only(&folder, &mut planner, outcome).await?;
                        }
                        FolderDecision::Skip => {
                            debug!(folder = %path, "Skipped by policy");
                        }
                    }
                }
                Step::Files { folder, files } => {
                    self.process_files(&folder, files, &mut planner, outcome)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// List a folder and queue its subfolders (in listing order) ahead of its files.
    async fn open_folder(
        &self,
        id: &str,
        path: &str,
        stack: &mut Vec<Step>,
        outcome: &mut CrawlOutcome,
    ) {
        self.progress.report(CrawlProgressEvent::Walking {
            folder: path.to_string(),
        });
        let children = match list_folder(self.drive, self.tokens, id, path, self.options.listing)
            .await
        {
            Ok(children) => children,
            Err(e) => {
                warn!(folder = path, error = %e, "Folder listing failed; skipping subtree");
                outcome.failed_folders.push(FailedFolder {
                    path: path.to_string(),
                    id: id.to_string(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        let (folders, files): (Vec<RemoteItem>, Vec<RemoteItem>) =
            children.into_iter().partition(|c| c.is_folder());
        stack.push(Step::Files {
            folder: path.to_string(),
            files,
        });
        for sub in folders.into_iter().rev() {
            stack.push(Step::Enter(sub));
        }
    }

    async fn process_files(
        &self,
        folder: &str,
        files: Vec<RemoteItem>,
        planner: &mut SyncPlanner<'_>,
        outcome: &mut CrawlOutcome,
    ) -> Result<()> {
        let candidates: Vec<&RemoteItem> = files.iter().filter(|f| !self.excluded(f)).collect();
        if candidates.is_empty() || self.at_ceiling(outcome) {
            return Ok(());
        }
        planner.prefetch(&candidates).await?;
        debug!(folder, files = candidates.len(), "Processing files");

        for file in candidates {
            if self.at_ceiling(outcome) {
                break;
            }
            outcome.processed += 1;
            self.progress.report(CrawlProgressEvent::Processed {
                n: outcome.processed as u64,
                name: file.name.clone(),
            });

            let decision = planner.decide(file);
            if decision == SyncDecision::Unchanged {
                outcome.unchanged += 1;
                continue;
            }

            let format = FileFormat::from_name(&file.name);
            if !format.is_supported() {
                let extension = file.extension().unwrap_or_default();
                debug!(file = %file.path(), extension = %extension, "Unsupported type; indexing metadata");
                outcome.skipped.push(SkippedFile {
                    name: file.name.clone(),
                    extension,
                });
                outcome
                    .extracted
                    .push(document(file, unsupported_record(file), decision));
                continue;
            }

            let bytes = match self.download(file).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(
                        file = %file.name,
                        extension = %file.extension().unwrap_or_default(),
                        error = %e,
                        "Download failed"
                    );
                    outcome.failed.push(failed_file(file, e.to_string()));
                    continue;
                }
            };

            match self.extractor.extract(&file.name, &bytes).await {
                Some(text) => outcome.extracted.push(document(file, text, decision)),
                None => outcome
                    .failed
                    .push(failed_file(file, "no text extracted".to_string())),
            }
        }
        Ok(())
    }

    /// One listing record for a `list-only` folder; its subfolders are not entered.
    async fn list_only(
        &self,
        folder: &RemoteItem,
        planner: &mut SyncPlanner<'_>,
        outcome: &mut CrawlOutcome,
    ) -> Result<()> {
        let path = folder.path();
        let children =
            match list_folder(self.drive, self.tokens, &folder.id, &path, self.options.listing)
                .await
            {
                Ok(children) => children,
                Err(e) => {
                    warn!(folder = %path, error = %e, "Folder listing failed");
                    outcome.failed_folders.push(FailedFolder {
                        path,
                        id: folder.id.clone(),
                        reason: e.to_string(),
                    });
                    return Ok(());
                }
            };

        let files: Vec<&RemoteItem> = children
            .iter()
            .filter(|c| !c.is_folder() && !self.excluded(c))
            .collect();
        if files.is_empty() {
            return Ok(());
        }
        outcome.processed += files.len();

        let record = folder_listing(folder, &files);
        planner.prefetch(&[&record]).await?;
        let decision = planner.decide(&record);
        if decision == SyncDecision::Unchanged {
            outcome.unchanged += 1;
            return Ok(());
        }

        let mut lines = vec![
            format!("=== Folder: {} ===", path),
            format!("Contains {} files:", files.len()),
        ];
        lines.extend(files.iter().map(|f| format!("  • {} ({} bytes)", f.name, f.size)));
        outcome.extracted.push(ExtractedDocument {
            name: format!("{} (folder listing)", folder.name),
            path,
            text: lines.join("\n"),
            size: record.size,
            modified: record.modified,
            decision,
        });
        Ok(())
    }

    /// Download with bounded retries and linear backoff. An authorization
    /// failure gets one silent token refresh, which does not use up an attempt.
    async fn download(&self, file: &RemoteItem) -> DriveResult<Vec<u8>> {
        let mut attempt = 0u32;
        let mut refreshed = false;
        loop {
            attempt += 1;
            let token = self.tokens.current();
            match self
                .drive
                .download(file, self.options.download_timeout_secs, &token)
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_unauthorized() && !refreshed => {
                    refreshed = true;
                    attempt -= 1;
                    warn!(file = %file.name, "Token rejected during download, refreshing");
                    if let Err(refresh_err) = self.tokens.refresh().await {
                        warn!(error = %refresh_err, "Token refresh failed");
                        return Err(e);
                    }
                }
                Err(e) if e.is_transient() && attempt < self.options.download_retries => {
                    let wait = self.options.retry_backoff * attempt;
                    warn!(
                        file = %file.name,
                        attempt,
                        retries = self.options.download_retries,
                        error = %e,
                        "Download failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn document(file: &RemoteItem, text: String, decision: SyncDecision) -> ExtractedDocument {
    ExtractedDocument {
        name: file.name.clone(),
        path: file.path(),
        text,
        size: file.size,
        modified: file.modified.clone(),
        decision,
    }
}

fn failed_file(file: &RemoteItem, reason: String) -> FailedFile {
    FailedFile {
        name: file.name.clone(),
        extension: file.extension().unwrap_or_default(),
        reason,
    }
}

/// Identity stand-in for a listing record: the folder path, with the total
/// size and latest modification of the listed files, so the record counts
/// as unchanged exactly when none of its files changed.
fn folder_listing(folder: &RemoteItem, files: &[&RemoteItem]) -> RemoteItem {
    RemoteItem {
        id: folder.id.clone(),
        name: folder.name.clone(),
        parent_path: folder.parent_path.clone(),
        kind: folder.kind,
        size: files.iter().map(|f| f.size).sum(),
        modified: files
            .iter()
            .map(|f| f.modified.as_str())
            .max()
            .unwrap_or_default()
            .to_string(),
        download_url: None,
    }
}

/// Metadata-only text for a file whose type has no extractor.
pub fn unsupported_record(file: &RemoteItem) -> String {
    let ext = file
        .extension()
        .map(|e| format!(".{}", e))
        .unwrap_or_else(|| "no extension".to_string());
    format!(
        "File: {}\nType: {} (unsupported for text extraction)\nSize: {:.2} MB ({} bytes)\nLocation: {}",
        file.name,
        ext,
        file.size as f64 / (1024.0 * 1024.0),
        format_number(file.size),
        file.path()
    )
}

/// Resolve the crawl root, refreshing the token once if it is rejected.
pub async fn resolve_root(
    drive: &dyn DriveApi,
    tokens: &TokenHolder,
    path: &str,
) -> DriveResult<RemoteItem> {
    match drive.resolve_path(path, &tokens.current()).await {
        Err(e) if e.is_unauthorized() => {
            if tokens.refresh().await.is_err() {
                return Err(e);
            }
            drive.resolve_path(path, &tokens.current()).await
        }
        other => other,
    }
}

// ============ Command ============

/// Flags of `smartdrive crawl`.
#[derive(Debug, Clone)]
pub struct CrawlArgs {
    pub mode: CrawlMode,
    pub max_files: Option<usize>,
    pub clear: bool,
    pub progress: ProgressMode,
}

pub async fn run_crawl(config: &Config, args: CrawlArgs) -> Result<()> {
    let mut options = CrawlOptions::from_config(config, args.mode)?;
    if args.max_files.is_some() {
        options.max_files = args.max_files;
    }

    // Authenticating
    let auth = Arc::new(DeviceCodeAuth::from_config(config)?);
    let token = auth.acquire(args.mode != CrawlMode::Unattended).await?;
    let tokens = TokenHolder::new(token, auth.clone());

    let drive = GraphDrive::new(&config.drive.graph_url);
    let index = PineconeIndex::from_config(&config.index)?;
    let embedder = create_embedder(&config.embedding)?;
    if !config.embedding.is_enabled() {
        warn!("Embedding provider is disabled; documents will be extracted but not uploaded");
    }
    let store: Option<AzureBlobStore> = config
        .storage
        .as_ref()
        .map(AzureBlobStore::from_config)
        .transpose()?;
    let progress = args.progress.reporter();
    let extractor = Extractor::new(
        ExtractLimits::from_config(&config.extract),
        config.crawl.zip_mode,
        Some(OcrServices::from_config(&config.ocr)?),
        progress.clone(),
    );

    if args.clear {
        index.delete_all().await.context("Failed to clear index")?;
        println!("cleared namespace {}", config.index.namespace);
    }

    let mut policy = FolderPolicyStore::load(&config.state.folder_cache_path())?;
    let mut source: Box<dyn DecisionSource> = match args.mode {
        CrawlMode::Unattended => Box::new(NonInteractive),
        _ => Box::new(StdinPrompter::new()),
    };

    let root_path = config.drive.root_path.as_str();
    let root = resolve_root(&drive, &tokens, root_path)
        .await
        .with_context(|| format!("Failed to open {}", root_path))?;
    info!(root = root_path, mode = ?args.mode, "Crawl started");

    let crawler = Crawler::new(&drive, &tokens, &index, &extractor, progress.as_ref(), options);
    let outcome = crawler
        .crawl(&root.id, root_path, &mut policy, source.as_mut())
        .await?;

    let uploader = Uploader::new(
        &index,
        embedder.as_ref(),
        store.as_ref().map(|s| s as &dyn DocumentStore),
        progress.as_ref(),
        UploadSettings::from_config(config),
    );
    let report = uploader.upload(&outcome.extracted).await?;

    print_summary(root_path, &outcome, &report);
    Ok(())
}

fn print_summary(root: &str, outcome: &CrawlOutcome, report: &UploadReport) {
    println!("crawl {}", root);
    println!("  processed: {} files", format_number(outcome.processed as u64));
    if outcome.ceiling_reached {
        println!("  stopped at file limit");
    }
    println!("  extracted: {}", outcome.extracted.len());
    println!("  unchanged: {}", outcome.unchanged);
    println!("  failed: {}", outcome.failed.len());
    for f in &outcome.failed {
        println!("    {} (.{})", f.name, f.extension);
    }

    if !outcome.skipped.is_empty() {
        let mut by_ext: BTreeMap<&str, usize> = BTreeMap::new();
        for s in &outcome.skipped {
            *by_ext.entry(s.extension.as_str()).or_insert(0) += 1;
        }
        println!("  unsupported (metadata only): {}", outcome.skipped.len());
        for (ext, count) in by_ext {
            println!("    .{}: {}", ext, count);
        }
    }
    if !outcome.failed_folders.is_empty() {
        println!("  folders skipped after errors: {}", outcome.failed_folders.len());
        for f in &outcome.failed_folders {
            println!("    {} ({})", f.path, f.reason);
        }
    }
    if !outcome.new_folders.is_empty() {
        println!("  new folders since last run: {}", outcome.new_folders.len());
    }

    println!("upload");
    println!("  new: {}", report.new);
    println!("  updated: {}", report.updated);
    println!("  unchanged: {}", outcome.unchanged);
    println!("  too small: {}", report.too_small);
    if report.embed_failed + report.upsert_failed + report.store_failed > 0 {
        println!(
            "  errors: {} embedding, {} upsert, {} store",
            report.embed_failed, report.upsert_failed, report.store_failed
        );
    }
    println!("  upserted: {}", report.upserted);
    println!("ok");
}
