//! Data model shared by every phase of the bug workflow
//!
//! Everything here serialises to the persisted state file, so field names are
//! part of the on-disk format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Workflow state
// ============================================================================

/// States in the bug detection workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Scanning,
    Testing,
    Analyzing,
    Reporting,
    WaitingConfirmation,
    Fixing,
    Reviewing,
    TestingFix,
    CreatingPr,
    Completed,
    Failed,
}

impl AgentState {
    pub const ALL: [AgentState; 12] = [
        AgentState::Idle,
        AgentState::Scanning,
        AgentState::Testing,
        AgentState::Analyzing,
        AgentState::Reporting,
        AgentState::WaitingConfirmation,
        AgentState::Fixing,
        AgentState::Reviewing,
        AgentState::TestingFix,
        AgentState::CreatingPr,
        AgentState::Completed,
        AgentState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Scanning => "scanning",
            AgentState::Testing => "testing",
            AgentState::Analyzing => "analyzing",
            AgentState::Reporting => "reporting",
            AgentState::WaitingConfirmation => "waiting_confirmation",
            AgentState::Fixing => "fixing",
            AgentState::Reviewing => "reviewing",
            AgentState::TestingFix => "testing_fix",
            AgentState::CreatingPr => "creating_pr",
            AgentState::Completed => "completed",
            AgentState::Failed => "failed",
        }
    }

    /// States the workflow expects to move to from `self`.
    ///
    /// Any state may move to `Failed`. Resting states (idle, waiting,
    /// completed, failed) may start either workflow. A fix attempt that
    /// produces nothing usable returns the bug to `WaitingConfirmation`.
    pub fn allowed_next(&self) -> &'static [AgentState] {
        use AgentState::*;
        match self {
            Idle | WaitingConfirmation | Completed | Failed => &[Scanning, Fixing, Failed],
            Scanning => &[Idle, Testing, Failed],
            Testing => &[Idle, Analyzing, Failed],
            Analyzing => &[Reporting, WaitingConfirmation, Failed],
            Reporting => &[Reporting, WaitingConfirmation, Failed],
            Fixing => &[Reviewing, WaitingConfirmation, Failed],
            Reviewing => &[TestingFix, Failed],
            TestingFix => &[CreatingPr, WaitingConfirmation, Failed],
            CreatingPr => &[Completed, Failed],
        }
    }

    pub fn can_transition_to(&self, next: AgentState) -> bool {
        self.allowed_next().contains(&next)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Bug severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BugSeverity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Info,
}

impl BugSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            BugSeverity::Critical => "critical",
            BugSeverity::High => "high",
            BugSeverity::Medium => "medium",
            BugSeverity::Low => "low",
            BugSeverity::Info => "info",
        }
    }

    /// Lenient parse used for model output; unknown values map to `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "critical" => Some(BugSeverity::Critical),
            "high" => Some(BugSeverity::High),
            "medium" => Some(BugSeverity::Medium),
            "low" => Some(BugSeverity::Low),
            "info" => Some(BugSeverity::Info),
            _ => None,
        }
    }
}

/// Categories of bugs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BugCategory {
    Crash,
    #[default]
    Functional,
    Visual,
    Performance,
    Accessibility,
    Security,
    Responsive,
    Wallet,
    Api,
}

impl BugCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            BugCategory::Crash => "crash",
            BugCategory::Functional => "functional",
            BugCategory::Visual => "visual",
            BugCategory::Performance => "performance",
            BugCategory::Accessibility => "accessibility",
            BugCategory::Security => "security",
            BugCategory::Responsive => "responsive",
            BugCategory::Wallet => "wallet",
            BugCategory::Api => "api",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "crash" => Some(BugCategory::Crash),
            "functional" => Some(BugCategory::Functional),
            "visual" => Some(BugCategory::Visual),
            "performance" => Some(BugCategory::Performance),
            "accessibility" => Some(BugCategory::Accessibility),
            "security" => Some(BugCategory::Security),
            "responsive" => Some(BugCategory::Responsive),
            "wallet" => Some(BugCategory::Wallet),
            "api" => Some(BugCategory::Api),
            _ => None,
        }
    }
}

// ============================================================================
// Test evidence
// ============================================================================

/// Captured console message from the browser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    /// error, warning, log, ...
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Captured network request details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub timing: Option<f64>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl NetworkRequest {
    pub fn is_failure(&self) -> bool {
        self.failed || self.status.is_some_and(|s| s >= 400)
    }
}

/// One failing test execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFailure {
    pub test_name: String,
    pub test_file: String,
    pub browser: String,
    pub viewport: String,
    pub error_message: String,
    #[serde(default)]
    pub screenshot_path: Option<String>,
    #[serde(default)]
    pub video_path: Option<String>,
    #[serde(default)]
    pub console_logs: Vec<ConsoleMessage>,
    #[serde(default)]
    pub network_logs: Vec<NetworkRequest>,
    #[serde(default)]
    pub dom_snapshot: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl TestFailure {
    pub fn new(
        test_name: impl Into<String>,
        test_file: impl Into<String>,
        browser: impl Into<String>,
        viewport: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            test_name: test_name.into(),
            test_file: test_file.into(),
            browser: browser.into(),
            viewport: viewport.into(),
            error_message: error_message.into(),
            screenshot_path: None,
            video_path: None,
            console_logs: Vec::new(),
            network_logs: Vec::new(),
            dom_snapshot: None,
            timestamp: Utc::now(),
        }
    }
}

/// Result of one test-suite invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: bool,
    pub total_tests: u32,
    pub passed_tests: u32,
    pub failed_tests: u32,
    pub skipped_tests: u32,
    pub duration_ms: f64,
    #[serde(default)]
    pub failures: Vec<TestFailure>,
    #[serde(default)]
    pub report_path: Option<String>,
}

impl TestResult {
    pub fn all_passed(total: u32) -> Self {
        Self {
            passed: true,
            total_tests: total,
            passed_tests: total,
            failed_tests: 0,
            skipped_tests: 0,
            duration_ms: 0.0,
            failures: Vec::new(),
            report_path: None,
        }
    }
}

/// Result of repository scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub has_changes: bool,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub new_commits: Vec<String>,
    #[serde(default)]
    pub last_scanned_commit: Option<String>,
    pub current_commit: String,
}

impl ScanResult {
    pub fn unchanged(current_commit: String, last_scanned_commit: Option<String>) -> Self {
        Self {
            has_changes: false,
            changed_files: Vec::new(),
            new_commits: Vec::new(),
            last_scanned_commit,
            current_commit,
        }
    }
}

// ============================================================================
// Hypotheses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("confidence must be within [0, 1], got {0}")]
    ConfidenceOutOfRange(f64),
}

fn validate_confidence(confidence: f64) -> Result<f64, ValidationError> {
    if (0.0..=1.0).contains(&confidence) {
        Ok(confidence)
    } else {
        Err(ValidationError::ConfidenceOutOfRange(confidence))
    }
}

fn deserialize_confidence<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    validate_confidence(value).map_err(serde::de::Error::custom)
}

/// LLM-derived claim about a defect, pending human confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BugHypothesis {
    pub title: String,
    pub description: String,
    pub severity: BugSeverity,
    pub category: BugCategory,
    #[serde(deserialize_with = "deserialize_confidence")]
    confidence: f64,

    pub root_cause: String,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub affected_components: Vec<String>,

    #[serde(default)]
    pub reproduction_steps: Vec<String>,
    #[serde(default)]
    pub affected_browsers: Vec<String>,
    #[serde(default)]
    pub affected_viewports: Vec<String>,

    #[serde(default)]
    pub test_failures: Vec<TestFailure>,

    #[serde(default)]
    pub suggested_fix: Option<String>,
    #[serde(default)]
    pub related_issues: Vec<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_analyzed_by")]
    pub analyzed_by: String,
}

fn default_analyzed_by() -> String {
    "llm".to_string()
}

impl BugHypothesis {
    /// Build a hypothesis with the mandatory fields. Fails when `confidence`
    /// is outside [0, 1] (NaN included).
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        severity: BugSeverity,
        category: BugCategory,
        confidence: f64,
        root_cause: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            title: title.into(),
            description: description.into(),
            severity,
            category,
            confidence: validate_confidence(confidence)?,
            root_cause: root_cause.into(),
            affected_files: Vec::new(),
            affected_components: Vec::new(),
            reproduction_steps: Vec::new(),
            affected_browsers: Vec::new(),
            affected_viewports: Vec::new(),
            test_failures: Vec::new(),
            suggested_fix: None,
            related_issues: Vec::new(),
            created_at: Utc::now(),
            analyzed_by: default_analyzed_by(),
        })
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn with_affected_files(mut self, files: Vec<String>) -> Self {
        self.affected_files = files;
        self
    }

    pub fn with_affected_components(mut self, components: Vec<String>) -> Self {
        self.affected_components = components;
        self
    }

    pub fn with_reproduction_steps(mut self, steps: Vec<String>) -> Self {
        self.reproduction_steps = steps;
        self
    }

    pub fn with_environment(mut self, browsers: Vec<String>, viewports: Vec<String>) -> Self {
        self.affected_browsers = browsers;
        self.affected_viewports = viewports;
        self
    }

    pub fn with_evidence(mut self, failure: TestFailure) -> Self {
        self.test_failures.push(failure);
        self
    }

    pub fn with_suggested_fix(mut self, fix: Option<String>) -> Self {
        self.suggested_fix = fix;
        self
    }

    pub fn with_analyzed_by(mut self, model: impl Into<String>) -> Self {
        self.analyzed_by = model.into();
        self
    }

    /// Fold another hypothesis's evidence into this one.
    ///
    /// Evidence is appended; browsers and viewports are unioned keeping first
    /// occurrence order. Text fields and confidence are left untouched.
    pub fn absorb(&mut self, other: BugHypothesis) {
        self.test_failures.extend(other.test_failures);
        union_into(&mut self.affected_browsers, other.affected_browsers);
        union_into(&mut self.affected_viewports, other.affected_viewports);
    }
}

fn union_into(target: &mut Vec<String>, extra: Vec<String>) {
    for item in extra {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

// ============================================================================
// Fixes and reports
// ============================================================================

/// A proposed textual edit scoped to one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeFix {
    /// Path relative to the UI root
    pub file_path: String,
    /// Exact text expected in the live file at apply time
    pub original_content: String,
    pub fixed_content: String,
    pub description: String,

    #[serde(default)]
    pub linting_passed: bool,
    #[serde(default)]
    pub tests_passed: bool,
    #[serde(default)]
    pub self_review_notes: Vec<String>,
}

impl CodeFix {
    pub fn new(
        file_path: impl Into<String>,
        original_content: impl Into<String>,
        fixed_content: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            original_content: original_content.into(),
            fixed_content: fixed_content.into(),
            description: description.into(),
            linting_passed: false,
            tests_passed: false,
            self_review_notes: Vec::new(),
        }
    }
}

/// Top-level record for one reported bug
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BugReport {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub hypothesis: BugHypothesis,

    #[serde(default)]
    pub issue_number: Option<u64>,
    #[serde(default)]
    pub issue_url: Option<String>,
    #[serde(default)]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub pr_url: Option<String>,

    #[serde(default = "default_report_state")]
    pub state: AgentState,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub fixed: bool,

    #[serde(default)]
    pub proposed_fixes: Vec<CodeFix>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_report_state() -> AgentState {
    AgentState::Reporting
}

impl BugReport {
    pub fn new(hypothesis: BugHypothesis) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            hypothesis,
            issue_number: None,
            issue_url: None,
            pr_number: None,
            pr_url: None,
            state: default_report_state(),
            confirmed: false,
            fixed: false,
            proposed_fixes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_issue(mut self, number: u64, url: impl Into<String>) -> Self {
        self.issue_number = Some(number);
        self.issue_url = Some(url.into());
        self
    }

    /// Move this report to `state` and bump `updated_at`.
    pub fn set_state(&mut self, state: AgentState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}
