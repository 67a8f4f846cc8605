//! Index and policy-cache upkeep commands.
//!
//! * `delete-folder` removes every vector under one remote folder and marks
//!   the folder `skip` so later crawls leave it alone.
//! * `folders` inspects and edits the folder policy cache.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::{DeviceCodeAuth, TokenHolder};
use crate::config::Config;
use crate::discovery::{list_folder, ListingTimeouts};
use crate::drive::{DriveApi, GraphDrive};
use crate::index::{PineconeIndex, VectorIndex};
use crate::planner::stable_id;
use crate::policy::{FolderDecision, FolderPolicyStore};

/// Identities deleted per index request.
pub const DELETE_BATCH_SIZE: usize = 100;

/// Every file path below `folder_path`, plus the folder paths themselves
/// (a list-only folder is indexed under its own path). A subfolder whose
/// listing fails is reported and left out.
pub async fn collect_paths(
    drive: &dyn DriveApi,
    tokens: &TokenHolder,
    folder_id: &str,
    folder_path: &str,
    timeouts: ListingTimeouts,
) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    let mut stack = vec![(folder_id.to_string(), folder_path.to_string())];
    let mut root = true;

    while let Some((id, path)) = stack.pop() {
        let children = match list_folder(drive, tokens, &id, &path, timeouts).await {
            Ok(children) => children,
            Err(e) if root => {
                return Err(anyhow::Error::new(e).context(format!("Failed to list {}", path)))
            }
            Err(e) => {
                warn!(folder = %path, error = %e, "Listing failed; its files stay indexed");
                continue;
            }
        };
        root = false;
        paths.push(path);
        for child in children {
            if child.is_folder() {
                stack.push((child.id.clone(), child.path()));
            } else {
                paths.push(child.path());
            }
        }
    }
    Ok(paths)
}

/// Delete the identities of `paths` in batches. Returns how many were sent.
pub async fn delete_paths(index: &dyn VectorIndex, paths: &[String]) -> Result<usize> {
    let ids: Vec<String> = paths.iter().map(|p| stable_id(p)).collect();
    for (i, batch) in ids.chunks(DELETE_BATCH_SIZE).enumerate() {
        index
            .delete(batch)
            .await
            .with_context(|| format!("Failed to delete batch {}", i + 1))?;
        info!(batch = i + 1, count = batch.len(), "Deleted vectors");
    }
    Ok(ids.len())
}

pub async fn run_delete_folder(config: &Config, folder_path: &str) -> Result<()> {
    if !folder_path.starts_with('/') {
        bail!("Folder path must start with '/': {}", folder_path);
    }
    let folder_path = folder_path.trim_end_matches('/');

    let auth = Arc::new(DeviceCodeAuth::from_config(config)?);
    let token = auth.acquire(true).await?;
    let tokens = TokenHolder::new(token, auth.clone());
    let drive = GraphDrive::new(&config.drive.graph_url);
    let index = PineconeIndex::from_config(&config.index)?;

    let folder = drive
        .resolve_path(folder_path, &tokens.current())
        .await
        .with_context(|| format!("Failed to open {}", folder_path))?;
    let timeouts = ListingTimeouts {
        first_secs: config.crawl.listing_timeout_secs,
        retry_secs: config.crawl.listing_retry_timeout_secs,
    };
    let paths = collect_paths(&drive, &tokens, &folder.id, folder_path, timeouts).await?;
    let deleted = delete_paths(&index, &paths).await?;

    let mut policy = FolderPolicyStore::load(&config.state.folder_cache_path())?;
    policy.set(folder_path, FolderDecision::Skip)?;

    println!("delete-folder {}", folder_path);
    println!("  identities deleted: {}", deleted);
    println!("  folder marked: skip");
    println!("ok");
    Ok(())
}

// ============ Folder policy cache ============

pub fn list_folders(config: &Config) -> Result<()> {
    let path = config.state.folder_cache_path();
    let policy = FolderPolicyStore::load(&path)?;
    if policy.is_empty() {
        println!("No folder decisions saved ({}).", path.display());
        return Ok(());
    }

    let entries: Vec<(&String, &FolderDecision)> = policy.iter().collect();
    let width = entries
        .iter()
        .map(|(p, _)| p.len())
        .max()
        .unwrap_or(0)
        .min(80);
    println!("{:<width$}  DECISION", "FOLDER", width = width);
    for (folder, decision) in entries {
        println!("{:<width$}  {}", folder, decision, width = width);
    }

    let counts = policy.counts();
    println!();
    println!(
        "{} folders: {} process, {} list-only, {} skip",
        policy.len(),
        counts.process,
        counts.list_only,
        counts.skip
    );
    Ok(())
}

pub fn reset_folders(config: &Config) -> Result<()> {
    let mut policy = FolderPolicyStore::load(&config.state.folder_cache_path())?;
    let count = policy.len();
    policy.reset()?;
    println!("Cleared {} folder decisions.", count);
    Ok(())
}

pub fn cycle_folder(config: &Config, folder: &str) -> Result<()> {
    let mut policy = FolderPolicyStore::load(&config.state.folder_cache_path())?;
    match policy.cycle(folder)? {
        Some(decision) => println!("{} → {}", folder, decision),
        None => bail!("No saved decision for {}", folder),
    }
    Ok(())
}

pub fn remove_folder(config: &Config, folder: &str) -> Result<()> {
    let mut policy = FolderPolicyStore::load(&config.state.folder_cache_path())?;
    match policy.remove(folder)? {
        Some(previous) => println!("Removed {} (was {})", folder, previous),
        None => bail!("No saved decision for {}", folder),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{QueryMatch, VectorRecord};
    use crate::sparse::SparseVector;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct DeletingIndex {
        deletes: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl VectorIndex for DeletingIndex {
        async fn fetch(&self, _: &[String]) -> Result<HashMap<String, serde_json::Value>> {
            Ok(HashMap::new())
        }
        async fn upsert(&self, _: &[VectorRecord]) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, ids: &[String]) -> Result<()> {
            self.deletes.lock().unwrap().push(ids.len());
            Ok(())
        }
        async fn delete_all(&self) -> Result<()> {
            Ok(())
        }
        async fn query(&self, _: &[f32], _: Option<&SparseVector>, _: usize) -> Result<Vec<QueryMatch>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn deletes_in_batches_of_one_hundred() {
        let index = DeletingIndex::default();
        let paths: Vec<String> = (0..250).map(|i| format!("/Documents/Old/{}.txt", i)).collect();
        let sent = delete_paths(&index, &paths).await.unwrap();
        assert_eq!(sent, 250);
        assert_eq!(*index.deletes.lock().unwrap(), vec![100, 100, 50]);
    }
}
