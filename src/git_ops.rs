//! Local git access for change detection
//!
//! `VersionControl` is the seam the scanner talks to; `GitRepo` implements it
//! over git2, reopening the repository per call.

use anyhow::{Context, Result};
use git2::{DiffFormat, DiffOptions, Oid, Repository, Sort};
use std::path::{Path, PathBuf};

/// Read-only view of the watched repository's history
pub trait VersionControl: Send + Sync {
    /// Full hex id of the commit HEAD points at
    fn head_commit(&self) -> Result<String>;

    /// Paths touched between two commits, in diff order
    fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>>;

    /// Commits reachable from `to` but not from `from`, newest first
    fn commits_between(&self, from: &str, to: &str) -> Result<Vec<String>>;

    /// File content as of `commit`
    fn file_at(&self, commit: &str, path: &str) -> Result<String>;

    /// Unified diff of `path` from `since` to the working tree
    fn file_diff(&self, since: &str, path: &str) -> Result<String>;
}

pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.root)
            .with_context(|| format!("Failed to open repository at {}", self.root.display()))
    }
}

fn parse_oid(rev: &str) -> Result<Oid> {
    Oid::from_str(rev).with_context(|| format!("Invalid commit id '{}'", rev))
}

impl VersionControl for GitRepo {
    fn head_commit(&self) -> Result<String> {
        let repo = self.open()?;
        let head = repo.head().context("Failed to get HEAD")?;
        let commit = head.peel_to_commit().context("HEAD does not point at a commit")?;
        Ok(commit.id().to_string())
    }

    fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let repo = self.open()?;
        let old_tree = repo.find_commit(parse_oid(from)?)?.tree()?;
        let new_tree = repo.find_commit(parse_oid(to)?)?.tree()?;
        let diff = repo
            .diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)
            .context("Failed to diff commits")?;

        let mut paths = Vec::new();
        for delta in diff.deltas() {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|p| p.to_string_lossy().replace('\\', "/"));
            if let Some(path) = path {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        Ok(paths)
    }

    fn commits_between(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let repo = self.open()?;
        let mut revwalk = repo.revwalk()?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
        revwalk.push(parse_oid(to)?)?;
        revwalk.hide(parse_oid(from)?)?;

        let mut commits = Vec::new();
        for oid in revwalk {
            commits.push(oid?.to_string());
        }
        Ok(commits)
    }

    fn file_at(&self, commit: &str, path: &str) -> Result<String> {
        let repo = self.open()?;
        let tree = repo.find_commit(parse_oid(commit)?)?.tree()?;
        let entry = tree
            .get_path(Path::new(path))
            .with_context(|| format!("'{}' not found at {}", path, commit))?;
        let blob = entry
            .to_object(&repo)?
            .peel_to_blob()
            .with_context(|| format!("'{}' is not a file", path))?;
        Ok(String::from_utf8_lossy(blob.content()).to_string())
    }

    fn file_diff(&self, since: &str, path: &str) -> Result<String> {
        let repo = self.open()?;
        let tree = repo.find_commit(parse_oid(since)?)?.tree()?;
        let mut opts = DiffOptions::new();
        opts.pathspec(path);
        let diff = repo
            .diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))
            .context("Failed to diff working tree")?;

        let mut patch = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            match line.origin() {
                '+' | '-' | ' ' => patch.push(line.origin()),
                _ => {}
            }
            patch.push_str(&String::from_utf8_lossy(line.content()));
            true
        })?;
        Ok(patch)
    }
}
