//! Browser test execution
//!
//! `TestRunner` is the seam the orchestrator drives. `PlaywrightRunner` shells
//! out to `npx playwright test --reporter=json` and turns the JSON report into
//! a [`TestResult`].

use crate::models::{TestFailure, TestResult};
use crate::util::{run_command_with_timeout, truncate, CommandRunResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

const EXPLORATORY_PROJECT: &str = "exploratory";
const EXPLORATORY_SUITE: &str = "playwright/tests/exploratory/";
const REGRESSION_SUITE: &str = "playwright/tests/regression/";

#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Broad suite used to discover bugs
    async fn run_exploratory(&self) -> Result<TestResult>;

    /// Smaller suite gating a proposed fix
    async fn run_regression(&self) -> Result<TestResult>;

    async fn run_specific(&self, test_file: &str) -> Result<TestResult>;
}

/// Raw files captured for a failing test
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TestArtifacts {
    pub screenshot: Option<Vec<u8>>,
    pub video: Option<Vec<u8>>,
}

/// Load the screenshot and video referenced by `failure`, when they exist.
pub async fn test_artifacts(failure: &TestFailure) -> TestArtifacts {
    TestArtifacts {
        screenshot: read_optional(failure.screenshot_path.as_deref()).await,
        video: read_optional(failure.video_path.as_deref()).await,
    }
}

async fn read_optional(path: Option<&str>) -> Option<Vec<u8>> {
    let path = path?;
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            tracing::debug!(path, error = %err, "artifact unavailable");
            None
        }
    }
}

// ============================================================================
// Playwright CLI runner
// ============================================================================

pub struct PlaywrightRunner {
    ui_root: PathBuf,
    base_url: String,
    timeout: Duration,
}

impl PlaywrightRunner {
    pub fn new(ui_root: impl Into<PathBuf>, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ui_root: ui_root.into(),
            base_url: base_url.into(),
            timeout,
        }
    }

    pub fn ui_root(&self) -> &Path {
        &self.ui_root
    }

    async fn run(
        &self,
        project: Option<&str>,
        pattern: Option<&str>,
        unreadable: UnreadableReport,
    ) -> Result<TestResult> {
        let mut cmd = Command::new("npx");
        cmd.args(["playwright", "test", "--reporter=json"]);
        if let Some(project) = project {
            cmd.args(["--project", project]);
        }
        if let Some(pattern) = pattern {
            cmd.arg(pattern);
        }
        cmd.current_dir(&self.ui_root)
            .env("BASE_URL", &self.base_url)
            .env("CI", "true");

        tracing::info!(project, pattern, "running playwright");
        let output = run_command_with_timeout(&mut cmd, None, self.timeout)
            .await
            .context("Failed to run playwright")?;

        if output.timed_out {
            anyhow::bail!(
                "Playwright did not finish within {}s",
                self.timeout.as_secs()
            );
        }

        interpret_run(&output, unreadable)
    }
}

/// What a run without a readable JSON report means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnreadableReport {
    /// Nothing to report
    Empty,
    /// The run proves nothing; fail it
    Error,
}

fn interpret_run(output: &CommandRunResult, unreadable: UnreadableReport) -> Result<TestResult> {
    let err = match parse_report(&output.stdout) {
        Ok(result) => return Ok(result),
        Err(err) => err,
    };
    let exit_code = output.status.and_then(|s| s.code());
    tracing::warn!(
        error = %err,
        exit_code,
        stderr = %truncate(&output.stderr, 500),
        "failed to parse playwright report"
    );
    match unreadable {
        UnreadableReport::Empty => Ok(summarize(&PlaywrightReport::default())),
        UnreadableReport::Error => Err(err.context(format!(
            "Playwright produced no readable report (exit code {}): {}",
            exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string()),
            truncate(output.stderr.trim(), 500)
        ))),
    }
}

#[async_trait]
impl TestRunner for PlaywrightRunner {
    async fn run_exploratory(&self) -> Result<TestResult> {
        tracing::info!("running exploratory tests");
        self.run(
            Some(EXPLORATORY_PROJECT),
            Some(EXPLORATORY_SUITE),
            UnreadableReport::Empty,
        )
        .await
    }

    async fn run_regression(&self) -> Result<TestResult> {
        tracing::info!("running regression tests");
        self.run(None, Some(REGRESSION_SUITE), UnreadableReport::Error)
            .await
    }

    async fn run_specific(&self, test_file: &str) -> Result<TestResult> {
        tracing::info!(test_file, "running specific test");
        self.run(None, Some(test_file), UnreadableReport::Error)
            .await
    }
}

// ============================================================================
// JSON report parsing
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct PlaywrightReport {
    #[serde(default)]
    suites: Vec<Suite>,
    #[serde(default)]
    stats: Stats,
}

#[derive(Debug, Default, Deserialize)]
struct Stats {
    #[serde(default)]
    expected: u32,
    #[serde(default)]
    unexpected: u32,
    #[serde(default)]
    skipped: u32,
    #[serde(default)]
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct Suite {
    #[serde(default)]
    title: String,
    #[serde(default)]
    specs: Vec<Spec>,
    #[serde(default)]
    suites: Vec<Suite>,
}

#[derive(Debug, Deserialize)]
struct Spec {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    tests: Vec<SpecTest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpecTest {
    #[serde(default)]
    project_name: Option<String>,
    #[serde(default)]
    results: Vec<RunResult>,
}

#[derive(Debug, Deserialize)]
struct RunResult {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    #[serde(default)]
    name: String,
    #[serde(default)]
    path: Option<String>,
}

/// Parse Playwright's JSON reporter output.
pub fn parse_report(raw: &str) -> Result<TestResult> {
    let report: PlaywrightReport =
        serde_json::from_str(raw.trim()).context("Playwright output is not a JSON report")?;
    Ok(summarize(&report))
}

fn summarize(report: &PlaywrightReport) -> TestResult {
    let stats = &report.stats;
    let mut failures = Vec::new();
    for suite in &report.suites {
        // Top-level titles look like "chromium - desktop" when projects are
        // named per browser; anything else leaves the browser unknown.
        let browser = suite
            .title
            .split_once(" - ")
            .map(|(b, _)| b.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        collect_failures(suite, &browser, &mut failures);
    }

    TestResult {
        passed: stats.unexpected == 0,
        total_tests: stats.expected + stats.unexpected,
        passed_tests: stats.expected,
        failed_tests: stats.unexpected,
        skipped_tests: stats.skipped,
        duration_ms: stats.duration,
        failures,
        report_path: None,
    }
}

fn collect_failures(suite: &Suite, browser: &str, out: &mut Vec<TestFailure>) {
    for spec in &suite.specs {
        for test in &spec.tests {
            for result in test.results.iter().filter(|r| r.status == "failed") {
                let mut failure = TestFailure::new(
                    spec.title.as_deref().unwrap_or("Unknown"),
                    spec.file.as_deref().unwrap_or("Unknown"),
                    browser,
                    test.project_name.as_deref().unwrap_or("unknown"),
                    extract_error(result),
                );
                failure.screenshot_path = find_attachment(result, "screenshot");
                failure.video_path = find_attachment(result, "video");
                failure.timestamp = Utc::now();
                out.push(failure);
            }
        }
    }
    for child in &suite.suites {
        collect_failures(child, browser, out);
    }
}

fn extract_error(result: &RunResult) -> String {
    match &result.error {
        None | Some(serde_json::Value::Null) => "Unknown error".to_string(),
        Some(serde_json::Value::Object(map)) => match map.get("message") {
            Some(serde_json::Value::String(msg)) => msg.clone(),
            _ => serde_json::Value::Object(map.clone()).to_string(),
        },
        Some(serde_json::Value::String(msg)) => msg.clone(),
        Some(other) => other.to_string(),
    }
}

fn find_attachment(result: &RunResult, prefix: &str) -> Option<String> {
    result
        .attachments
        .iter()
        .find(|a| a.name.starts_with(prefix))
        .and_then(|a| a.path.clone())
}
