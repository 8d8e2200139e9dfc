//! Persisted workflow state
//!
//! One JSON document holds the orchestrator state, every known report and a
//! timestamp. It is rewritten wholesale on each save.

use crate::models::{AgentState, BugReport};
use crate::util::{preserve_corrupt_file, write_atomic};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_TIMEOUT_SECS: u64 = 10;
const LOCK_RETRY_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub state: AgentState,
    #[serde(default)]
    pub reports: Vec<BugReport>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            state: AgentState::Idle,
            reports: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

impl PersistedState {
    pub fn report_for_issue(&self, issue: u64) -> Option<&BugReport> {
        self.reports.iter().find(|r| r.issue_number == Some(issue))
    }
}

struct StateLock {
    file: fs::File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored state, or `None` when the file is missing or unreadable.
    /// A corrupt file is moved aside to `<name>.corrupt`.
    pub fn load_existing(&self) -> Option<PersistedState> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "cannot read state file");
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "corrupt state file, starting fresh"
                );
                preserve_corrupt_file(&self.path, &content);
                None
            }
        }
    }

    /// Stored state, or an idle state with no reports
    pub fn load(&self) -> PersistedState {
        self.load_existing().unwrap_or_default()
    }

    pub async fn save(&self, state: AgentState, reports: &[BugReport]) -> Result<()> {
        #[derive(Serialize)]
        struct Snapshot<'a> {
            state: AgentState,
            reports: &'a [BugReport],
            updated_at: DateTime<Utc>,
        }

        let content = serde_json::to_string_pretty(&Snapshot {
            state,
            reports,
            updated_at: Utc::now(),
        })
        .context("Failed to serialize state")?;

        let _lock = self.lock().await?;
        write_atomic(&self.path, &content)?;
        tracing::debug!(path = %self.path.display(), state = %state, reports = reports.len(), "state saved");
        Ok(())
    }

    /// Exclusive advisory lock on `<state file>.lock`. Waiting yields to the
    /// runtime.
    async fn lock(&self) -> Result<StateLock> {
        let mut lock_path = self.path.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open {}", lock_path.display()))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(StateLock { file }),
                Err(err) if err.kind() != ErrorKind::WouldBlock => return Err(err.into()),
                Err(_) if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) => {
                    anyhow::bail!("Timed out waiting for state lock ({}s)", LOCK_TIMEOUT_SECS)
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(LOCK_RETRY_MS)).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BugCategory, BugHypothesis, BugSeverity};

    fn report(issue: u64) -> BugReport {
        let h = BugHypothesis::new("t", "d", BugSeverity::Low, BugCategory::Api, 0.7, "r").unwrap();
        BugReport::new(h).with_issue(issue, format!("https://github.com/a/b/issues/{}", issue))
    }

    #[test]
    fn test_missing_file_is_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("agent_state.json"));
        assert!(store.load_existing().is_none());
        let state = store.load();
        assert_eq!(state.state, AgentState::Idle);
        assert!(state.reports.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("results/agent_state.json"));
        store
            .save(AgentState::WaitingConfirmation, &[report(3), report(5)])
            .await
            .unwrap();

        let loaded = store.load_existing().unwrap();
        assert_eq!(loaded.state, AgentState::WaitingConfirmation);
        assert_eq!(loaded.reports.len(), 2);
        assert_eq!(loaded.report_for_issue(5).unwrap().issue_number, Some(5));
        assert!(loaded.report_for_issue(4).is_none());

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"state\": \"waiting_confirmation\""));
    }

    #[test]
    fn test_corrupt_file_is_preserved_and_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = StateStore::new(&path);

        assert!(store.load_existing().is_none());
        assert!(dir.path().join("agent_state.json.corrupt").exists());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_save_waits_for_lock_without_blocking_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let holder = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.path().join("agent_state.json.lock"))
            .unwrap();
        FileExt::lock_exclusive(&holder).unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            FileExt::unlock(&holder).unwrap();
        });

        let store = StateStore::new(dir.path().join("agent_state.json"));
        store.save(AgentState::Idle, &[]).await.unwrap();
        release.await.unwrap();
        assert_eq!(store.load_existing().unwrap().state, AgentState::Idle);
    }
}
