//! Folder policy store.
//!
//! Maps a folder path to one of `process`, `list-only` or `skip`. The map is
//! persisted as a JSON object in the operator's home directory and rewritten
//! in full (temp file + rename) after every decision, so a crash never leaves
//! a half-written cache behind.
//!
//! Decisions come from three places, highest precedence first:
//!
//! 1. an explicit cached decision for the exact path,
//! 2. a propagating decision made on an ancestor earlier in the same
//!    preflight session (`[y]`, `[l]`, `[x]`),
//! 3. the operator, through a [`DecisionSource`].
//!
//! Without an operator the default is `process`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::models::{DiscoveredFolder, FailedFolder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FolderDecision {
    Process,
    ListOnly,
    Skip,
}

impl FolderDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderDecision::Process => "process",
            FolderDecision::ListOnly => "list-only",
            FolderDecision::Skip => "skip",
        }
    }

    /// process → list-only → skip → process
    pub fn cycled(&self) -> Self {
        match self {
            FolderDecision::Process => FolderDecision::ListOnly,
            FolderDecision::ListOnly => FolderDecision::Skip,
            FolderDecision::Skip => FolderDecision::Process,
        }
    }
}

impl std::fmt::Display for FolderDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to the ad-hoc prompt shown while walking with no cached decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdHocChoice {
    Process,
    Skip,
    ListOnly,
    AlwaysProcess,
    AlwaysSkip,
    AlwaysListOnly,
}

impl AdHocChoice {
    pub fn decision(&self) -> FolderDecision {
        match self {
            AdHocChoice::Process | AdHocChoice::AlwaysProcess => FolderDecision::Process,
            AdHocChoice::Skip | AdHocChoice::AlwaysSkip => FolderDecision::Skip,
            AdHocChoice::ListOnly | AdHocChoice::AlwaysListOnly => FolderDecision::ListOnly,
        }
    }

    /// Sticky answers are written to the cache; the others apply to this run only.
    pub fn is_sticky(&self) -> bool {
        matches!(
            self,
            AdHocChoice::AlwaysProcess | AdHocChoice::AlwaysSkip | AdHocChoice::AlwaysListOnly
        )
    }
}

/// Answer to the preflight menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightChoice {
    /// Process this folder and every folder below it.
    Process,
    /// List-only this folder and every folder below it.
    ListOnly,
    /// Skip this folder; subfolders are still asked about.
    Skip,
    /// Skip this folder and every folder below it.
    Exclude,
    /// Process this and all remaining folders without asking.
    Quick,
}

/// Where policy answers come from. The CLI implements this over stdin; tests
/// and non-interactive runs inject their own.
pub trait DecisionSource: Send {
    fn ad_hoc(&mut self, path: &str, name: &str) -> Result<AdHocChoice>;

    fn preflight(
        &mut self,
        position: usize,
        total: usize,
        path: &str,
        name: &str,
    ) -> Result<PreflightChoice>;

    /// A folder missing from an existing cache. `None` leaves it undecided
    /// (processed this run, asked again next time).
    fn new_folder(&mut self, path: &str, name: &str) -> Result<Option<FolderDecision>>;

    /// Whether to run another discovery round over the failed folders.
    fn confirm_retry(&mut self, failed: &[FailedFolder]) -> Result<bool>;
}

/// Decision source for unattended runs: never prompts, processes everything
/// that is not already cached, and never retries failed discovery.
pub struct NonInteractive;

impl DecisionSource for NonInteractive {
    fn ad_hoc(&mut self, _path: &str, _name: &str) -> Result<AdHocChoice> {
        Ok(AdHocChoice::Process)
    }

    fn preflight(&mut self, _: usize, _: usize, _path: &str, _name: &str) -> Result<PreflightChoice> {
        Ok(PreflightChoice::Process)
    }

    fn new_folder(&mut self, path: &str, _name: &str) -> Result<Option<FolderDecision>> {
        warn!(folder = path, "New folder not in policy cache; processing without saving");
        Ok(None)
    }

    fn confirm_retry(&mut self, _failed: &[FailedFolder]) -> Result<bool> {
        Ok(false)
    }
}

/// Totals per decision, for summaries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PolicyCounts {
    pub process: usize,
    pub list_only: usize,
    pub skip: usize,
}

pub struct FolderPolicyStore {
    path: Option<PathBuf>,
    entries: BTreeMap<String, FolderDecision>,
}

impl FolderPolicyStore {
    /// Load the cache file, or start empty when it does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read folder cache: {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse folder cache: {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries,
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<FolderDecision> {
        self.entries.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FolderDecision)> {
        self.entries.iter()
    }

    pub fn counts(&self) -> PolicyCounts {
        let mut counts = PolicyCounts::default();
        for decision in self.entries.values() {
            match decision {
                FolderDecision::Process => counts.process += 1,
                FolderDecision::ListOnly => counts.list_only += 1,
                FolderDecision::Skip => counts.skip += 1,
            }
        }
        counts
    }

    /// Record a decision and rewrite the cache file.
    pub fn set(&mut self, path: &str, decision: FolderDecision) -> Result<()> {
        self.entries.insert(path.to_string(), decision);
        self.persist()
    }

    pub fn remove(&mut self, path: &str) -> Result<Option<FolderDecision>> {
        let removed = self.entries.remove(path);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Advance one entry to its next decision. `None` when the path is not cached.
    pub fn cycle(&mut self, path: &str) -> Result<Option<FolderDecision>> {
        let Some(current) = self.get(path) else {
            return Ok(None);
        };
        let next = current.cycled();
        self.set(path, next)?;
        Ok(Some(next))
    }

    pub fn reset(&mut self) -> Result<()> {
        self.entries.clear();
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write folder cache: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace folder cache: {}", path.display()))?;
        Ok(())
    }

    /// Decision for one folder met while walking.
    ///
    /// A cached answer wins. Otherwise, when `interactive`, the operator is
    /// asked once; only sticky answers are persisted. Non-interactive walks
    /// process uncached folders.
    pub fn resolve(
        &mut self,
        path: &str,
        name: &str,
        interactive: bool,
        source: &mut dyn DecisionSource,
    ) -> Result<FolderDecision> {
        if let Some(decision) = self.get(path) {
            debug!(folder = path, decision = %decision, "Cached folder decision");
            return Ok(decision);
        }
        if !interactive {
            return Ok(FolderDecision::Process);
        }

        let choice = source.ad_hoc(path, name)?;
        if choice.is_sticky() {
            self.set(path, choice.decision())?;
            info!(folder = path, decision = %choice.decision(), "Saved folder decision");
        }
        Ok(choice.decision())
    }

    /// Preflight selection over a discovered folder list (walker order).
    ///
    /// Every folder ends up with a persisted decision. Propagating answers
    /// are inherited by all later folders below the answered one, so those
    /// are never prompted.
    pub fn select_preflight(
        &mut self,
        folders: &[DiscoveredFolder],
        source: &mut dyn DecisionSource,
    ) -> Result<()> {
        let mut inherited: Vec<(String, FolderDecision)> = Vec::new();
        let mut quick = false;
        let total = folders.len();

        for (idx, folder) in folders.iter().enumerate() {
            if let Some(decision) = self.get(&folder.path) {
                debug!(folder = %folder.path, decision = %decision, "Cached folder decision");
                continue;
            }

            if let Some(decision) = inherited_decision(&inherited, &folder.path) {
                self.set(&folder.path, decision)?;
                debug!(folder = %folder.path, decision = %decision, "Inherited from parent");
                continue;
            }

            if quick {
                self.set(&folder.path, FolderDecision::Process)?;
                continue;
            }

            let choice = source.preflight(idx + 1, total, &folder.path, &folder.name)?;
            let decision = match choice {
                PreflightChoice::Process => {
                    inherited.push((folder.path.clone(), FolderDecision::Process));
                    FolderDecision::Process
                }
                PreflightChoice::ListOnly => {
                    inherited.push((folder.path.clone(), FolderDecision::ListOnly));
                    FolderDecision::ListOnly
                }
                PreflightChoice::Skip => FolderDecision::Skip,
                PreflightChoice::Exclude => {
                    inherited.push((folder.path.clone(), FolderDecision::Skip));
                    FolderDecision::Skip
                }
                PreflightChoice::Quick => {
                    quick = true;
                    FolderDecision::Process
                }
            };
            self.set(&folder.path, decision)?;
        }

        let counts = self.counts();
        info!(
            process = counts.process,
            list_only = counts.list_only,
            skip = counts.skip,
            "Folder selection complete"
        );
        Ok(())
    }

    /// Ask about every discovered folder that the cache has never seen.
    /// Returns the paths that were new.
    pub fn detect_new_folders(
        &mut self,
        folders: &[DiscoveredFolder],
        source: &mut dyn DecisionSource,
    ) -> Result<Vec<String>> {
        let mut new_paths = Vec::new();
        for folder in folders {
            if self.get(&folder.path).is_some() {
                continue;
            }
            new_paths.push(folder.path.clone());
            if let Some(decision) = source.new_folder(&folder.path, &folder.name)? {
                self.set(&folder.path, decision)?;
            }
        }
        if !new_paths.is_empty() {
            info!(count = new_paths.len(), "New folders found since last run");
        }
        Ok(new_paths)
    }
}

/// Decision of the closest ancestor that propagated one.
fn inherited_decision(inherited: &[(String, FolderDecision)], path: &str) -> Option<FolderDecision> {
    inherited
        .iter()
        .filter(|(prefix, _)| is_descendant(path, prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, decision)| *decision)
}

/// `true` when `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}
