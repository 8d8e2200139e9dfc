//! Workflow driver
//!
//! Two entry points: [`Orchestrator::run_cycle`] detects and reports bugs,
//! [`Orchestrator::handle_confirmation`] turns a confirmed report into a pull
//! request. Both run their phases strictly one after another and persist the
//! report list to the state file.

use crate::analyzer::BugAnalyzer;
use crate::config::Settings;
use crate::fixer::{CodeFixer, FixJournal};
use crate::git_ops::{GitRepo, VersionControl};
use crate::github::{GitHubClient, HostingApi, PullRequest};
use crate::llm::{LlmClient, OpenRouterClient};
use crate::models::{AgentState, BugReport, CodeFix};
use crate::reporter::Reporter;
use crate::reviewer::{CodeReviewer, NpxToolchain, Toolchain};
use crate::scanner::RepoScanner;
use crate::state::StateStore;
use crate::testing::{PlaywrightRunner, TestRunner};
use crate::util::truncate;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;


const NO_FIX_COMMENT: &str = "Unable to generate an automated fix for this bug. \
     The analysis may need refinement or the fix may require manual intervention.";
const MAX_FAILURE_COMMENT_CHARS: usize = 1000;

/// External collaborators the workflow drives
#[derive(Clone)]
pub struct Capabilities {
    pub llm: Arc<dyn LlmClient>,
    pub hosting: Arc<dyn HostingApi>,
    pub tests: Arc<dyn TestRunner>,
    pub vcs: Arc<dyn VersionControl>,
    pub toolchain: Arc<dyn Toolchain>,
}

impl Capabilities {
    /// OpenRouter, GitHub, Playwright, git2 and npx tooling per `settings`
    pub fn production(settings: &Settings) -> Result<Self> {
        Ok(Self {
            llm: Arc::new(OpenRouterClient::from_settings(settings)?),
            hosting: Arc::new(GitHubClient::from_settings(settings)?),
            tests: Arc::new(PlaywrightRunner::new(
                settings.ui_root(),
                settings.base_url.clone(),
                Duration::from_secs(settings.test_timeout_secs),
            )),
            vcs: Arc::new(GitRepo::new(settings.repo_path.clone())),
            toolchain: Arc::new(NpxToolchain::new(settings.ui_root())),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    NoChanges,
    AllPassed,
    Reported { bugs_reported: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    ReportNotFound,
    NoFixGenerated,
    RegressionFailed { failed_tests: u32 },
    PullRequestOpened { number: u64, url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSummary {
    pub state: AgentState,
    pub reports: usize,
    pub updated_at: DateTime<Utc>,
    /// Issues whose bug has not been fixed yet
    pub open_issues: Vec<u64>,
}

/// Summary of the persisted state, `None` when nothing was saved yet
pub fn read_status(store: &StateStore) -> Option<StatusSummary> {
    let persisted = store.load_existing()?;
    Some(StatusSummary {
        state: persisted.state,
        reports: persisted.reports.len(),
        updated_at: persisted.updated_at,
        open_issues: persisted
            .reports
            .iter()
            .filter(|r| !r.fixed)
            .filter_map(|r| r.issue_number)
            .collect(),
    })
}

enum Verification {
    Regressed(u32),
    Opened(PullRequest),
}

pub struct Orchestrator {
    state: AgentState,
    reports: Vec<BugReport>,
    max_bugs_per_cycle: usize,
    min_confidence: f64,
    scanner: RepoScanner,
    tests: Arc<dyn TestRunner>,
    analyzer: BugAnalyzer,
    reporter: Reporter,
    fixer: CodeFixer,
    reviewer: CodeReviewer,
    store: StateStore,
}

impl Orchestrator {
    pub fn new(settings: &Settings, caps: Capabilities) -> Self {
        Self {
            state: AgentState::Idle,
            reports: Vec::new(),
            max_bugs_per_cycle: settings.max_bugs_per_cycle,
            min_confidence: settings.min_report_confidence,
            scanner: RepoScanner::new(settings, caps.vcs),
            tests: caps.tests,
            analyzer: BugAnalyzer::new(settings, caps.llm.clone()),
            reporter: Reporter::new(settings, caps.hosting),
            fixer: CodeFixer::new(settings, caps.llm.clone()),
            reviewer: CodeReviewer::new(settings, caps.llm, caps.toolchain),
            store: StateStore::new(settings.state_file()),
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn reports(&self) -> &[BugReport] {
        &self.reports
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn status(&self) -> Option<StatusSummary> {
        read_status(&self.store)
    }

    /// Record a state change. Moves outside the declared table are logged,
    /// never refused.
    fn transition(&mut self, next: AgentState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!(from = %self.state, to = %next, "unexpected state transition");
        }
        tracing::info!(from = %self.state, to = %next, "state transition");
        self.state = next;
    }

    async fn persist(&self) -> Result<()> {
        self.store.save(self.state, &self.reports).await
    }

    async fn persist_best_effort(&self) {
        if let Err(err) = self.persist().await {
            tracing::error!(error = %format!("{:#}", err), "failed to save state");
        }
    }

    // ========================================================================
    // Detection cycle
    // ========================================================================

    /// Scan, test, analyse and report. Already filed issues are kept when a
    /// later step fails.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        tracing::info!("starting detection cycle");
        match self.detect_and_report().await {
            Ok(outcome) => {
                tracing::info!(?outcome, "detection cycle finished");
                Ok(outcome)
            }
            Err(err) => {
                tracing::error!(error = %format!("{:#}", err), "detection cycle failed");
                self.transition(AgentState::Failed);
                self.persist_best_effort().await;
                Err(err)
            }
        }
    }

    async fn detect_and_report(&mut self) -> Result<CycleOutcome> {
        self.reports = self.store.load().reports;

        self.transition(AgentState::Scanning);
        let scan = self.scanner.scan().context("Repository scan failed")?;
        if !scan.has_changes {
            self.transition(AgentState::Idle);
            return Ok(CycleOutcome::NoChanges);
        }
        tracing::info!(files = ?scan.changed_files, "relevant changes detected");

        self.transition(AgentState::Testing);
        let result = self
            .tests
            .run_exploratory()
            .await
            .context("Exploratory test run failed")?;
        if result.failures.is_empty() {
            tracing::info!(total = result.total_tests, "all exploratory tests passed");
            self.transition(AgentState::Idle);
            return Ok(CycleOutcome::AllPassed);
        }

        self.transition(AgentState::Analyzing);
        if result.failures.len() > self.max_bugs_per_cycle {
            tracing::info!(
                failures = result.failures.len(),
                limit = self.max_bugs_per_cycle,
                "analysing only the first failures"
            );
        }

        let mut bugs_reported = 0;
        for failure in result.failures.iter().take(self.max_bugs_per_cycle) {
            let Some(hypothesis) = self.analyzer.analyze_failure(failure).await else {
                continue;
            };
            if hypothesis.confidence() < self.min_confidence {
                continue;
            }

            self.transition(AgentState::Reporting);
            let mut report = self.reporter.create_bug_report(hypothesis).await?;
            report.set_state(AgentState::WaitingConfirmation);
            tracing::info!(issue = ?report.issue_number, title = %report.hypothesis.title, "bug reported");
            self.reports.push(report);
            bugs_reported += 1;
        }

        self.transition(AgentState::WaitingConfirmation);
        self.persist().await?;
        Ok(CycleOutcome::Reported { bugs_reported })
    }

    // ========================================================================
    // Confirmation
    // ========================================================================

    /// Generate, review, verify and propose a fix for the bug filed as
    /// `issue`. The state file is the source of truth for known reports.
    pub async fn handle_confirmation(&mut self, issue: u64) -> Result<ConfirmationOutcome> {
        let persisted = self.store.load();
        self.state = persisted.state;
        self.reports = persisted.reports;

        let Some(index) = self
            .reports
            .iter()
            .position(|r| r.issue_number == Some(issue))
        else {
            tracing::warn!(issue, "no report for confirmed issue");
            return Ok(ConfirmationOutcome::ReportNotFound);
        };

        tracing::info!(issue, "handling confirmation");
        match self.fix_and_propose(index, issue).await {
            Ok(outcome) => {
                tracing::info!(issue, ?outcome, "confirmation handled");
                Ok(outcome)
            }
            Err(err) => {
                tracing::error!(issue, error = %format!("{:#}", err), "fix workflow failed");
                self.transition(AgentState::Failed);
                self.reports[index].set_state(AgentState::Failed);

                let comment = format!(
                    "Automated fix attempt failed:\n\n```\n{}\n```",
                    truncate(&format!("{:#}", err), MAX_FAILURE_COMMENT_CHARS)
                );
                if let Err(comment_err) = self.reporter.add_comment(issue, &comment).await {
                    tracing::warn!(issue, error = %comment_err, "could not post failure comment");
                }
                self.persist_best_effort().await;
                Err(err)
            }
        }
    }

    fn enter(&mut self, index: usize, state: AgentState) {
        self.transition(state);
        self.reports[index].set_state(state);
    }

    async fn fix_and_propose(&mut self, index: usize, issue: u64) -> Result<ConfirmationOutcome> {
        self.reports[index].confirmed = true;
        self.enter(index, AgentState::Fixing);

        let hypothesis = self.reports[index].hypothesis.clone();
        let fixes = self.fixer.generate_fix(&hypothesis).await;
        if fixes.is_empty() {
            self.reporter.add_comment(issue, NO_FIX_COMMENT).await?;
            self.enter(index, AgentState::WaitingConfirmation);
            self.persist().await?;
            return Ok(ConfirmationOutcome::NoFixGenerated);
        }

        self.enter(index, AgentState::Reviewing);
        let mut reviewed = Vec::with_capacity(fixes.len());
        for fix in fixes {
            reviewed.push(self.reviewer.review_and_improve(fix).await);
        }
        self.reports[index].proposed_fixes = reviewed.clone();

        self.enter(index, AgentState::TestingFix);
        let mut journal = FixJournal::default();
        let verification = match self.fixer.apply_fixes(&reviewed, &mut journal).await {
            Ok(()) => self.verify_and_propose(index).await,
            Err(err) => Err(err.context("Failed to apply fixes")),
        };
        // The pull request branch carries the change; the local tree goes
        // back to how it was. Only edits that were made are undone.
        let restored = self.fixer.revert_fixes(journal).await;
        if let Err(err) = &restored {
            tracing::error!(issue, error = %format!("{:#}", err), "failed to restore working tree");
        }

        match verification? {
            Verification::Regressed(failed_tests) => {
                restored.context("Failed to revert fixes after regression failure")?;
                self.reporter
                    .add_comment(
                        issue,
                        &format!(
                            "Automated fix failed regression tests ({} failed). \
                             The changes were reverted and no pull request was opened.",
                            failed_tests
                        ),
                    )
                    .await?;
                self.enter(index, AgentState::WaitingConfirmation);
                self.persist().await?;
                Ok(ConfirmationOutcome::RegressionFailed { failed_tests })
            }
            Verification::Opened(pr) => {
                let report = &mut self.reports[index];
                report.pr_number = Some(pr.number);
                report.pr_url = Some(pr.html_url.clone());
                report.fixed = true;
                self.enter(index, AgentState::Completed);
                self.persist().await?;
                Ok(ConfirmationOutcome::PullRequestOpened {
                    number: pr.number,
                    url: pr.html_url,
                })
            }
        }
    }

    /// Run the regression suite against the applied fixes and open the pull
    /// request when it passes.
    async fn verify_and_propose(&mut self, index: usize) -> Result<Verification> {
        let result = self
            .tests
            .run_regression()
            .await
            .context("Regression test run failed")?;
        if !result.passed {
            tracing::warn!(failed = result.failed_tests, "fix broke regression tests");
            return Ok(Verification::Regressed(result.failed_tests));
        }

        self.reports[index]
            .proposed_fixes
            .iter_mut()
            .for_each(|fix: &mut CodeFix| fix.tests_passed = true);

        self.enter(index, AgentState::CreatingPr);
        let pr = self
            .reporter
            .create_pull_request(&self.reports[index])
            .await
            .context("Failed to open pull request")?;
        Ok(Verification::Opened(pr))
    }
}
