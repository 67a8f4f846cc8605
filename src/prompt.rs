//! Terminal prompts for folder decisions.

use anyhow::{bail, Result};
use std::io::{BufRead, Write};

use crate::models::FailedFolder;
use crate::policy::{AdHocChoice, DecisionSource, FolderDecision, PreflightChoice};

/// [`DecisionSource`] that asks the operator on stdin/stdout.
pub struct StdinPrompter {
    preflight_header_shown: bool,
    new_folder_header_shown: bool,
}

impl StdinPrompter {
    pub fn new() -> Self {
        Self {
            preflight_header_shown: false,
            new_folder_header_shown: false,
        }
    }

    fn ask(&self, question: &str) -> Result<String> {
        print!("{}", question);
        std::io::stdout().flush()?;
        let mut line = String::new();
        let read = std::io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            bail!("stdin closed while waiting for an answer");
        }
        Ok(line.trim().to_lowercase())
    }
}

impl Default for StdinPrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionSource for StdinPrompter {
    fn ad_hoc(&mut self, path: &str, name: &str) -> Result<AdHocChoice> {
        println!("\nFound folder: {}/", name);
        println!("   Path: {}", path);
        loop {
            let answer = self.ask(
                "   [y]es / [n]o / [l]ist-only / [a]lways yes / [s]kip always / [o]nly list always: ",
            )?;
            let choice = match answer.as_str() {
                "" | "y" | "yes" => AdHocChoice::Process,
                "n" | "no" => AdHocChoice::Skip,
                "l" | "list" | "list-only" => AdHocChoice::ListOnly,
                "a" | "always" => AdHocChoice::AlwaysProcess,
                "s" | "skip" => AdHocChoice::AlwaysSkip,
                "o" | "only" | "only-list" => AdHocChoice::AlwaysListOnly,
                _ => {
                    println!("   Invalid choice, please try again.");
                    continue;
                }
            };
            return Ok(choice);
        }
    }

    fn preflight(
        &mut self,
        position: usize,
        total: usize,
        path: &str,
        name: &str,
    ) -> Result<PreflightChoice> {
        if !self.preflight_header_shown {
            println!("\nFOLDER SELECTION: choose how to handle each folder");
            println!("  [y] process (this folder and all subfolders)");
            println!("  [l] list-only (index file names, no content)");
            println!("  [n] skip this folder only");
            println!("  [x] exclude (skip this folder and all subfolders)");
            println!("  [q] quick mode (process all remaining folders)");
            self.preflight_header_shown = true;
        }
        println!("\n[{}/{}] {}/", position, total, name);
        println!("   Path: {}", path);
        loop {
            let answer = self.ask("   Choice [y/l/n/x/q]: ")?;
            let choice = match answer.as_str() {
                "" | "y" | "yes" => PreflightChoice::Process,
                "l" | "list" | "list-only" => PreflightChoice::ListOnly,
                "n" | "no" | "skip" => PreflightChoice::Skip,
                "x" | "exclude" => PreflightChoice::Exclude,
                "q" | "quick" => PreflightChoice::Quick,
                _ => {
                    println!("   Invalid choice, please enter y/l/n/x/q");
                    continue;
                }
            };
            return Ok(choice);
        }
    }

    fn new_folder(&mut self, path: &str, name: &str) -> Result<Option<FolderDecision>> {
        if !self.new_folder_header_shown {
            println!("\nNEW FOLDERS DETECTED: [y] process  [l] list-only  [n] skip");
            self.new_folder_header_shown = true;
        }
        println!("\nNew folder: {}/", name);
        println!("   Path: {}", path);
        loop {
            let answer = self.ask("   Choice [y/l/n]: ")?;
            let decision = match answer.as_str() {
                "" | "y" | "yes" => FolderDecision::Process,
                "l" | "list" | "list-only" => FolderDecision::ListOnly,
                "n" | "no" | "skip" => FolderDecision::Skip,
                _ => {
                    println!("   Invalid choice, please enter y/l/n");
                    continue;
                }
            };
            return Ok(Some(decision));
        }
    }

    fn confirm_retry(&mut self, failed: &[FailedFolder]) -> Result<bool> {
        println!("\n{} folder(s) failed during discovery:", failed.len());
        for folder in failed {
            println!("   - {}: {}", folder.path, folder.reason);
        }
        let answer = self.ask("Retry failed folders? [y/n]: ")?;
        Ok(matches!(answer.as_str(), "y" | "yes"))
    }
}
