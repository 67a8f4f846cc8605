//! Sync planner: decide per file whether it needs extracting at all.
//!
//! Every file's identity is the SHA-256 of its full remote path, the same
//! value used as the vector id on upload. Before any file in a folder is
//! downloaded, the identities of all candidate files are looked up in the
//! index in batches; a file whose recorded `(modified, size)` equals the
//! current pair is `unchanged` and costs no download, extraction or
//! embedding.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::index::VectorIndex;
use crate::models::{IndexedFile, RemoteItem, SyncDecision};

/// Documents with less trimmed text than this are never uploaded.
pub const MIN_CONTENT_CHARS: usize = 50;

/// Stable identity for a remote path: lowercase hex SHA-256.
pub fn stable_id(path: &str) -> String {
    hex::encode(Sha256::digest(path.as_bytes()))
}

pub fn passes_content_floor(text: &str) -> bool {
    text.trim().chars().count() >= MIN_CONTENT_CHARS
}

/// Read `(modified, size)` from stored vector metadata. Sizes may come back
/// as floats from the index.
pub fn indexed_file_from_metadata(metadata: &serde_json::Value) -> Option<IndexedFile> {
    let path = metadata.get("file_path")?.as_str()?.to_string();
    let modified = metadata.get("modified")?.as_str()?.to_string();
    let size_value = metadata.get("size")?;
    let size = match size_value.as_u64() {
        Some(n) => n,
        None => {
            let f = size_value.as_f64()?;
            if f < 0.0 || f.fract() != 0.0 {
                return None;
            }
            f as u64
        }
    };
    Some(IndexedFile {
        path,
        modified,
        size,
    })
}

pub struct SyncPlanner<'a> {
    index: &'a dyn VectorIndex,
    batch_size: usize,
    /// Identities already looked up, with what the index holds for them.
    known: HashMap<String, Option<IndexedFile>>,
}

impl<'a> SyncPlanner<'a> {
    pub fn new(index: &'a dyn VectorIndex, batch_size: usize) -> Self {
        Self {
            index,
            batch_size: batch_size.max(1),
            known: HashMap::new(),
        }
    }

    /// Look up every not-yet-known identity for `items` in batches.
    ///
    /// A failed batch is logged and its files are treated as new, so they
    /// are re-extracted rather than silently dropped.
    pub async fn prefetch(&mut self, items: &[&RemoteItem]) -> Result<()> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = items
            .iter()
            .map(|item| stable_id(&item.path()))
            .filter(|id| !self.known.contains_key(id) && seen.insert(id.clone()))
            .collect();

        for batch in ids.chunks(self.batch_size) {
            match self.index.fetch(batch).await {
                Ok(found) => {
                    for id in batch {
                        let entry = found.get(id).and_then(indexed_file_from_metadata);
                        self.known.insert(id.clone(), entry);
                    }
                }
                Err(e) => {
                    warn!(batch = batch.len(), error = %e, "Index lookup failed; treating files as new");
                    for id in batch {
                        self.known.insert(id.clone(), None);
                    }
                }
            }
        }
        Ok(())
    }

    /// Classify one file against what the index holds for it.
    pub fn decide(&self, item: &RemoteItem) -> SyncDecision {
        let id = stable_id(&item.path());
        match self.known.get(&id) {
            Some(Some(existing)) => {
                if existing.modified == item.modified && existing.size == item.size {
                    debug!(file = %item.path(), "Unchanged since last index");
                    SyncDecision::Unchanged
                } else {
                    SyncDecision::Updated
                }
            }
            _ => SyncDecision::New,
        }
    }

    /// Number of identities looked up so far.
    pub fn known_count(&self) -> usize {
        self.known.len()
    }
}
