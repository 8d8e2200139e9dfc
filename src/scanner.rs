//! Repository scanner for detecting changes
//!
//! Compares HEAD against the last scanned commit (persisted as a one-line
//! marker file) and decides whether the change set warrants a test run.

use crate::config::Settings;
use crate::git_ops::VersionControl;
use crate::models::ScanResult;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

pub struct RepoScanner {
    vcs: Arc<dyn VersionControl>,
    repo_root: PathBuf,
    marker: PathBuf,
    include_prefixes: Vec<String>,
    exclude_patterns: Vec<String>,
}

impl RepoScanner {
    pub fn new(settings: &Settings, vcs: Arc<dyn VersionControl>) -> Self {
        Self {
            vcs,
            repo_root: settings.repo_path.clone(),
            marker: settings.scan_marker_file(),
            include_prefixes: settings.include_prefixes.clone(),
            exclude_patterns: settings.exclude_patterns.clone(),
        }
    }

    fn last_scanned_commit(&self) -> Option<String> {
        fs::read_to_string(&self.marker)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn save_last_scanned_commit(&self, commit: &str) -> Result<()> {
        if let Some(parent) = self.marker.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.marker, commit)
            .with_context(|| format!("Failed to write {}", self.marker.display()))
    }

    /// A path is relevant when it sits under an include prefix and matches no
    /// exclusion pattern. Both checks are plain substring tests.
    pub fn is_relevant(&self, path: &str) -> bool {
        let included = self.include_prefixes.iter().any(|p| path.contains(p.as_str()));
        let excluded = self.exclude_patterns.iter().any(|p| path.contains(p.as_str()));
        included && !excluded
    }

    /// Scan for relevant changes since the last run.
    ///
    /// The first scan only records HEAD. Every later scan advances the marker
    /// to HEAD, whether or not anything relevant changed.
    pub fn scan(&self) -> Result<ScanResult> {
        tracing::info!(path = %self.repo_root.display(), "scanning repository");

        let current = self.vcs.head_commit()?;
        let Some(last) = self.last_scanned_commit() else {
            tracing::info!(commit = %current, "first scan, recording baseline");
            self.save_last_scanned_commit(&current)?;
            return Ok(ScanResult::unchanged(current, None));
        };

        if last == current {
            tracing::info!(commit = %current, "no new commits");
            return Ok(ScanResult::unchanged(current, Some(last)));
        }

        let changed_files = self.vcs.changed_files(&last, &current).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to list changed files");
            Vec::new()
        });
        let new_commits = self.vcs.commits_between(&last, &current).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to list new commits");
            Vec::new()
        });

        let relevant: Vec<String> = changed_files
            .into_iter()
            .filter(|path| self.is_relevant(path))
            .collect();

        self.save_last_scanned_commit(&current)?;

        tracing::info!(
            commits = new_commits.len(),
            relevant_files = relevant.len(),
            "scan complete"
        );

        Ok(ScanResult {
            has_changes: !relevant.is_empty(),
            changed_files: relevant,
            new_commits,
            last_scanned_commit: Some(last),
            current_commit: current,
        })
    }

    /// Content of `path`, from the working tree or as of `commit`.
    pub fn file_content(&self, path: &str, commit: Option<&str>) -> Result<String> {
        match commit {
            Some(commit) => self.vcs.file_at(commit, path),
            None => {
                let full = self.repo_root.join(path);
                fs::read_to_string(&full)
                    .with_context(|| format!("Failed to read {}", full.display()))
            }
        }
    }

    /// Working-tree diff of `path` since `since_commit`; empty on error.
    pub fn file_diff(&self, path: &str, since_commit: &str) -> String {
        self.vcs.file_diff(since_commit, path).unwrap_or_else(|err| {
            tracing::debug!(path, error = %err, "diff unavailable");
            String::new()
        })
    }
}
