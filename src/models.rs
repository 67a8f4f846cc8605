//! Core data models used throughout the crawler.
//!
//! These types represent the remote drive items, the per-file sync decisions
//! and the extracted documents that flow from discovery to upload.

use serde::{Deserialize, Serialize};

/// Whether a remote item is a file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Folder,
}

/// A file or folder as reported by one drive listing call.
#[derive(Debug, Clone)]
pub struct RemoteItem {
    pub id: String,
    pub name: String,
    /// Path of the containing folder, e.g. `/Documents/Taxes`.
    pub parent_path: String,
    pub kind: ItemKind,
    pub size: u64,
    /// Last-modified timestamp exactly as the drive reports it.
    pub modified: String,
    /// Time-limited direct download URL (files only).
    pub download_url: Option<String>,
}

impl RemoteItem {
    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }

    /// Full remote path; the stable identity of the item is derived from it.
    pub fn path(&self) -> String {
        join_path(&self.parent_path, &self.name)
    }

    /// Lowercased extension, or `None` when the name has no dot.
    pub fn extension(&self) -> Option<String> {
        file_extension(&self.name)
    }
}

/// Join a folder path and a child name with a single `/`.
pub fn join_path(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

/// Lowercased extension of a file name, or `None` when it has no dot.
pub fn file_extension(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// A folder found by the discovery walker: `(path, name, id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFolder {
    pub path: String,
    pub name: String,
    pub id: String,
}

/// A folder whose listing failed during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFolder {
    pub path: String,
    pub id: String,
    pub reason: String,
}

/// Per-file classification against what the remote index already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDecision {
    New,
    Updated,
    Unchanged,
    SkippedTooSmall,
}

impl SyncDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDecision::New => "new",
            SyncDecision::Updated => "updated",
            SyncDecision::Unchanged => "unchanged",
            SyncDecision::SkippedTooSmall => "skipped-too-small",
        }
    }
}

/// One processed file (or list-only folder) ready for the upload stage.
///
/// Created once per file per crawl run and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub name: String,
    /// Full remote path; also the source of the document's stable identity.
    pub path: String,
    pub text: String,
    pub size: u64,
    pub modified: String,
    /// Planner decision made before extraction (`New` or `Updated`).
    pub decision: SyncDecision,
}

/// `(modified, size)` as recorded in the remote index for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFile {
    pub path: String,
    pub modified: String,
    pub size: u64,
}

/// A file whose download or extraction failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFile {
    pub name: String,
    pub extension: String,
    pub reason: String,
}

/// A file of an unsupported type, indexed by metadata only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub name: String,
    pub extension: String,
}
