//! In-memory capability fakes shared by unit tests

use crate::git_ops::VersionControl;
use crate::github::{HostingApi, IssueRef, PullRequest};
use crate::llm::{CompletionRequest, LlmClient};
use crate::models::TestResult;
use crate::reviewer::{CheckOutcome, Toolchain};
use crate::testing::TestRunner;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// ============================================================================
// LLM
// ============================================================================

#[derive(Debug, Clone)]
pub struct LlmCall {
    pub system: String,
    pub user: String,
    pub images: usize,
    pub tools: Vec<String>,
}

/// Replies scripted per system prompt, consumed in order. An exhausted
/// script makes `complete` fail.
#[derive(Default)]
pub struct FakeLlm {
    replies: Mutex<HashMap<String, VecDeque<String>>>,
    calls: Mutex<Vec<LlmCall>>,
}

impl FakeLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_to(&self, system: &str, reply: &str) {
        self.replies
            .lock()
            .unwrap()
            .entry(system.to_string())
            .or_default()
            .push_back(reply.to_string());
    }

    pub fn calls(&self) -> Vec<LlmCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String> {
        self.calls.lock().unwrap().push(LlmCall {
            system: request.system.to_string(),
            user: request.user.to_string(),
            images: request.images.len(),
            tools: request
                .tools
                .map(|t| t.names().into_iter().map(str::to_string).collect())
                .unwrap_or_default(),
        });
        self.replies
            .lock()
            .unwrap()
            .get_mut(request.system)
            .and_then(|queue| queue.pop_front())
            .ok_or_else(|| anyhow::anyhow!("no scripted reply"))
    }

    fn model_name(&self) -> &str {
        "fake-model"
    }
}

// ============================================================================
// Hosting
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FiledIssue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenedPr {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub labels: Vec<String>,
}

#[derive(Default)]
struct HostingLog {
    issues: Vec<FiledIssue>,
    comments: Vec<(u64, String)>,
    added_labels: Vec<(u64, String)>,
    removed_labels: Vec<(u64, String)>,
    branches: Vec<(String, String)>,
    files: Vec<(String, String)>,
    prs: Vec<OpenedPr>,
    labelled: HashMap<String, Vec<u64>>,
    failing: HashSet<&'static str>,
}

/// Records every call. Issues are numbered from 1, pull requests from 100.
#[derive(Default)]
pub struct FakeHosting {
    log: Mutex<HostingLog>,
}

impl FakeHosting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named operation fail from now on
    pub fn fail(&self, operation: &'static str) {
        self.log.lock().unwrap().failing.insert(operation);
    }

    pub fn set_labelled(&self, label: &str, issues: &[u64]) {
        self.log
            .lock()
            .unwrap()
            .labelled
            .insert(label.to_string(), issues.to_vec());
    }

    pub fn issues(&self) -> Vec<FiledIssue> {
        self.log.lock().unwrap().issues.clone()
    }

    pub fn comments(&self) -> Vec<(u64, String)> {
        self.log.lock().unwrap().comments.clone()
    }

    pub fn added_labels(&self) -> Vec<(u64, String)> {
        self.log.lock().unwrap().added_labels.clone()
    }

    pub fn removed_labels(&self) -> Vec<(u64, String)> {
        self.log.lock().unwrap().removed_labels.clone()
    }

    pub fn branches(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().branches.clone()
    }

    pub fn files(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().files.clone()
    }

    pub fn pull_requests(&self) -> Vec<OpenedPr> {
        self.log.lock().unwrap().prs.clone()
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.log.lock().unwrap().failing.contains(operation) {
            anyhow::bail!("{} failed", operation);
        }
        Ok(())
    }
}

#[async_trait]
impl HostingApi for FakeHosting {
    async fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<IssueRef> {
        self.check("create_issue")?;
        let mut log = self.log.lock().unwrap();
        let number = log.issues.len() as u64 + 1;
        log.issues.push(FiledIssue {
            number,
            title: title.to_string(),
            body: body.to_string(),
            labels: labels.to_vec(),
        });
        Ok(IssueRef {
            number,
            html_url: format!("https://github.com/acme/webapp/issues/{}", number),
        })
    }

    async fn add_comment(&self, issue: u64, body: &str) -> Result<()> {
        self.check("add_comment")?;
        self.log
            .lock()
            .unwrap()
            .comments
            .push((issue, body.to_string()));
        Ok(())
    }

    async fn add_label(&self, issue: u64, label: &str) -> Result<()> {
        self.check("add_label")?;
        self.log
            .lock()
            .unwrap()
            .added_labels
            .push((issue, label.to_string()));
        Ok(())
    }

    async fn remove_label(&self, issue: u64, label: &str) -> Result<()> {
        self.check("remove_label")?;
        self.log
            .lock()
            .unwrap()
            .removed_labels
            .push((issue, label.to_string()));
        Ok(())
    }

    async fn issues_with_label(&self, label: &str) -> Result<Vec<IssueRef>> {
        self.check("issues_with_label")?;
        let log = self.log.lock().unwrap();
        Ok(log
            .labelled
            .get(label)
            .map(|numbers| {
                numbers
                    .iter()
                    .map(|&number| IssueRef {
                        number,
                        html_url: format!("https://github.com/acme/webapp/issues/{}", number),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_branch(&self, name: &str, base: &str) -> Result<()> {
        self.check("create_branch")?;
        self.log
            .lock()
            .unwrap()
            .branches
            .push((name.to_string(), base.to_string()));
        Ok(())
    }

    async fn upsert_file(
        &self,
        path: &str,
        content: &str,
        _message: &str,
        _branch: &str,
    ) -> Result<()> {
        self.check("upsert_file")?;
        self.log
            .lock()
            .unwrap()
            .files
            .push((path.to_string(), content.to_string()));
        Ok(())
    }

    async fn create_pull_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
        labels: &[String],
    ) -> Result<PullRequest> {
        self.check("create_pull_request")?;
        let mut log = self.log.lock().unwrap();
        let number = log.prs.len() as u64 + 100;
        log.prs.push(OpenedPr {
            number,
            title: title.to_string(),
            body: body.to_string(),
            head: head.to_string(),
            base: base.to_string(),
            labels: labels.to_vec(),
        });
        Ok(PullRequest {
            number,
            html_url: format!("https://github.com/acme/webapp/pull/{}", number),
        })
    }
}

// ============================================================================
// Test runner
// ============================================================================

/// Queued results per suite; an empty queue means everything passed.
#[derive(Default)]
pub struct FakeTestRunner {
    exploratory: Mutex<VecDeque<TestResult>>,
    regression: Mutex<VecDeque<TestResult>>,
    watched: Mutex<Option<PathBuf>>,
    seen_during_regression: Mutex<Vec<String>>,
    regression_runs: Mutex<usize>,
}

impl FakeTestRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_exploratory(&self, result: TestResult) {
        self.exploratory.lock().unwrap().push_back(result);
    }

    pub fn push_regression(&self, result: TestResult) {
        self.regression.lock().unwrap().push_back(result);
    }

    /// Snapshot `path` each time the regression suite runs
    pub fn watch_during_regression(&self, path: &Path) {
        *self.watched.lock().unwrap() = Some(path.to_path_buf());
    }

    pub fn seen_during_regression(&self) -> Vec<String> {
        self.seen_during_regression.lock().unwrap().clone()
    }

    pub fn regression_runs(&self) -> usize {
        *self.regression_runs.lock().unwrap()
    }
}

#[async_trait]
impl TestRunner for FakeTestRunner {
    async fn run_exploratory(&self) -> Result<TestResult> {
        Ok(self
            .exploratory
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| TestResult::all_passed(0)))
    }

    async fn run_regression(&self) -> Result<TestResult> {
        *self.regression_runs.lock().unwrap() += 1;
        let watched = self.watched.lock().unwrap().clone();
        if let Some(path) = watched {
            let content = std::fs::read_to_string(path).unwrap_or_default();
            self.seen_during_regression.lock().unwrap().push(content);
        }
        Ok(self
            .regression
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| TestResult::all_passed(0)))
    }

    async fn run_specific(&self, _test_file: &str) -> Result<TestResult> {
        Ok(TestResult::all_passed(1))
    }
}

// ============================================================================
// Toolchain
// ============================================================================

type Formatter = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Lint outcomes are queued (default `Passed`); formatting is off unless a
/// formatter is set.
#[derive(Default)]
pub struct FakeToolchain {
    lint: Mutex<VecDeque<CheckOutcome>>,
    linted: Mutex<Vec<String>>,
    linted_files: Mutex<Vec<PathBuf>>,
    formatter: Mutex<Option<Formatter>>,
    typecheck: Mutex<Option<CheckOutcome>>,
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_lint(&self, outcome: CheckOutcome) {
        self.lint.lock().unwrap().push_back(outcome);
    }

    pub fn set_format(&self, formatter: impl Fn(&str) -> String + Send + Sync + 'static) {
        *self.formatter.lock().unwrap() = Some(Box::new(formatter));
    }

    pub fn set_typecheck(&self, outcome: CheckOutcome) {
        *self.typecheck.lock().unwrap() = Some(outcome);
    }

    /// File contents seen by each lint call
    pub fn linted_sources(&self) -> Vec<String> {
        self.linted.lock().unwrap().clone()
    }

    pub fn linted_files(&self) -> Vec<PathBuf> {
        self.linted_files.lock().unwrap().clone()
    }
}

#[async_trait]
impl Toolchain for FakeToolchain {
    async fn lint(&self, file: &Path) -> CheckOutcome {
        let content = std::fs::read_to_string(file).unwrap_or_default();
        self.linted.lock().unwrap().push(content);
        self.linted_files.lock().unwrap().push(file.to_path_buf());
        self.lint
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CheckOutcome::Passed)
    }

    async fn format(&self, source: &str) -> Option<String> {
        self.formatter.lock().unwrap().as_ref().map(|f| f(source))
    }

    async fn typecheck(&self) -> CheckOutcome {
        self.typecheck
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(CheckOutcome::Passed)
    }
}

// ============================================================================
// Version control
// ============================================================================

/// HEAD plus the change set reported for any range
#[derive(Default)]
pub struct FakeVcs {
    head: Mutex<String>,
    changed: Mutex<Vec<String>>,
}

impl FakeVcs {
    pub fn new(head: &str) -> Self {
        Self {
            head: Mutex::new(head.to_string()),
            changed: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, head: &str, changed: &[&str]) {
        *self.head.lock().unwrap() = head.to_string();
        *self.changed.lock().unwrap() = changed.iter().map(|s| s.to_string()).collect();
    }
}

impl VersionControl for FakeVcs {
    fn head_commit(&self) -> Result<String> {
        Ok(self.head.lock().unwrap().clone())
    }

    fn changed_files(&self, _from: &str, _to: &str) -> Result<Vec<String>> {
        Ok(self.changed.lock().unwrap().clone())
    }

    fn commits_between(&self, _from: &str, to: &str) -> Result<Vec<String>> {
        Ok(vec![to.to_string()])
    }

    fn file_at(&self, commit: &str, path: &str) -> Result<String> {
        anyhow::bail!("{} not recorded at {}", path, commit)
    }

    fn file_diff(&self, _since: &str, _path: &str) -> Result<String> {
        Ok(String::new())
    }
}
