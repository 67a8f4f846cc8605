//! Discovery walker: enumerate every folder below a root before any file work.
//!
//! Folders come out depth-first, parent before children, siblings in listing
//! order. That order drives the preflight prompts: an ancestor is always
//! answered before any of its descendants is considered.
//!
//! A folder whose listing fails is recorded as a [`FailedFolder`] and not
//! descended into; discovery carries on with its siblings.

use anyhow::Result;
use tracing::{info, warn};

use crate::auth::TokenHolder;
use crate::drive::DriveApi;
use crate::error::DriveResult;
use crate::models::{DiscoveredFolder, FailedFolder, RemoteItem};
use crate::policy::DecisionSource;
use crate::progress::{CrawlProgressEvent, CrawlProgressReporter};

/// Listing timeouts: the first attempt, and the single retry after a timeout.
#[derive(Debug, Clone, Copy)]
pub struct ListingTimeouts {
    pub first_secs: u64,
    pub retry_secs: u64,
}

/// List one folder with the full failure policy applied:
///
/// * a timeout is retried once with the longer timeout;
/// * an authorization failure triggers one silent token refresh, after
///   which the request is retried once with the new token.
///
/// Any error left after that is returned to the caller.
pub async fn list_folder(
    drive: &dyn DriveApi,
    tokens: &TokenHolder,
    folder_id: &str,
    folder_path: &str,
    timeouts: ListingTimeouts,
) -> DriveResult<Vec<RemoteItem>> {
    let token = tokens.current();
    let result = match drive
        .list_children(folder_id, folder_path, timeouts.first_secs, &token)
        .await
    {
        Err(e) if e.is_timeout() => {
            warn!(
                folder = folder_path,
                timeout_secs = timeouts.first_secs,
                retry_timeout_secs = timeouts.retry_secs,
                "Listing timed out, retrying with longer timeout"
            );
            drive
                .list_children(folder_id, folder_path, timeouts.retry_secs, &token)
                .await
        }
        other => other,
    };

    match result {
        Err(e) if e.is_unauthorized() => {
            warn!(folder = folder_path, "Token rejected, refreshing");
            if let Err(refresh_err) = tokens.refresh().await {
                warn!(folder = folder_path, error = %refresh_err, "Token refresh failed");
                return Err(e);
            }
            let token = tokens.current();
            drive
                .list_children(folder_id, folder_path, timeouts.retry_secs, &token)
                .await
        }
        other => other,
    }
}

pub struct DiscoveryWalker<'a> {
    drive: &'a dyn DriveApi,
    tokens: &'a TokenHolder,
    timeouts: ListingTimeouts,
    progress: &'a dyn CrawlProgressReporter,
}

impl<'a> DiscoveryWalker<'a> {
    pub fn new(
        drive: &'a dyn DriveApi,
        tokens: &'a TokenHolder,
        timeouts: ListingTimeouts,
        progress: &'a dyn CrawlProgressReporter,
    ) -> Self {
        Self {
            drive,
            tokens,
            timeouts,
            progress,
        }
    }

    /// All folders below `root_path` (the root itself excluded), plus the
    /// folders whose listing failed.
    pub async fn discover(
        &self,
        root_id: &str,
        root_path: &str,
    ) -> (Vec<DiscoveredFolder>, Vec<FailedFolder>) {
        let mut folders = Vec::new();
        let mut failed = Vec::new();
        self.walk(root_id, root_path, None, &mut folders, &mut failed)
            .await;
        info!(
            folders = folders.len(),
            failed = failed.len(),
            root = root_path,
            "Discovery finished"
        );
        (folders, failed)
    }

    /// Pre-order walk below one folder. The start folder is recorded only
    /// when `start_name` is given; any folder is recorded only once its
    /// listing succeeds, so an unreachable folder is never offered for a
    /// decision.
    async fn walk(
        &self,
        start_id: &str,
        start_path: &str,
        start_name: Option<String>,
        folders: &mut Vec<DiscoveredFolder>,
        failed: &mut Vec<FailedFolder>,
    ) {
        // (id, path, name to record under)
        let mut stack: Vec<(String, String, Option<String>)> =
            vec![(start_id.to_string(), start_path.to_string(), start_name)];

        while let Some((id, path, name)) = stack.pop() {
            let children =
                match list_folder(self.drive, self.tokens, &id, &path, self.timeouts).await {
                    Ok(children) => children,
                    Err(e) => {
                        warn!(folder = %path, error = %e, "Folder listing failed; marking for retry");
                        failed.push(FailedFolder {
                            path,
                            id,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };

            if let Some(name) = name {
                folders.push(DiscoveredFolder {
                    path: path.clone(),
                    name,
                    id: id.clone(),
                });
                if folders.len() % 5 == 0 {
                    self.progress.report(CrawlProgressEvent::Discovering {
                        folders: folders.len() as u64,
                    });
                }
            }

            let subfolders: Vec<RemoteItem> =
                children.into_iter().filter(|c| c.is_folder()).collect();
            for sub in subfolders.into_iter().rev() {
                let sub_path = sub.path();
                stack.push((sub.id, sub_path, Some(sub.name)));
            }
        }
    }

    /// Offer up to `max_rounds` retries of the failed set. Folders found on a
    /// retry are appended to `folders` (the root itself is never recorded).
    /// Returns the folders still failing, which are skipped for the rest of
    /// this run.
    pub async fn retry_failed(
        &self,
        root_path: &str,
        folders: &mut Vec<DiscoveredFolder>,
        mut failed: Vec<FailedFolder>,
        max_rounds: u32,
        source: &mut dyn DecisionSource,
    ) -> Result<Vec<FailedFolder>> {
        let mut round = 0;
        while !failed.is_empty() && round < max_rounds {
            if !source.confirm_retry(&failed)? {
                info!(count = failed.len(), "Continuing without failed folders");
                break;
            }
            round += 1;
            info!(round, count = failed.len(), "Retrying failed folders");

            let mut still_failing = Vec::new();
            for folder in failed {
                let name = (folder.path != root_path).then(|| folder_name(&folder.path));
                self.walk(&folder.id, &folder.path, name, folders, &mut still_failing)
                    .await;
            }
            failed = still_failing;
        }

        for folder in &failed {
            warn!(folder = %folder.path, reason = %folder.reason, "Folder permanently skipped for this run");
        }
        Ok(failed)
    }
}

fn folder_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}
