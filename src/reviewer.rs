//! Fix review: lint, model review, format, re-lint
//!
//! External JavaScript tooling sits behind [`Toolchain`]; every check reports
//! a [`CheckOutcome`] and the caller decides what an inconclusive run means
//! through [`InconclusivePolicy`].

use crate::config::{InconclusivePolicy, Settings};
use crate::llm::parse::{null_as_default, parse_json_object};
use crate::llm::prompts::CODE_REVIEW_SYSTEM;
use crate::llm::{CompletionRequest, LlmClient};
use crate::models::CodeFix;
use crate::util::{run_command_with_timeout, truncate};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use walkdir::WalkDir;

const LINT_TIMEOUT: Duration = Duration::from_secs(30);
const FORMAT_TIMEOUT: Duration = Duration::from_secs(10);
const TYPECHECK_TIMEOUT: Duration = Duration::from_secs(120);

/// Stem of the scratch file linted in place of the real one
const SCRATCH_STEM: &str = ".temp_review";

const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", ".next", "dist", "build"];

/// Result of an external check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Passed,
    FailedWithErrors(Vec<String>),
    /// The check could not run to completion (timeout, missing tool)
    Inconclusive(String),
}

impl CheckOutcome {
    pub fn passes(&self, policy: InconclusivePolicy) -> bool {
        match self {
            CheckOutcome::Passed => true,
            CheckOutcome::FailedWithErrors(_) => false,
            CheckOutcome::Inconclusive(_) => policy == InconclusivePolicy::Pass,
        }
    }

    pub fn errors(&self) -> &[String] {
        match self {
            CheckOutcome::FailedWithErrors(errors) => errors,
            _ => &[],
        }
    }
}

/// Lint, format and typecheck capabilities of the web project
#[async_trait]
pub trait Toolchain: Send + Sync {
    async fn lint(&self, file: &Path) -> CheckOutcome;

    /// Formatted source, or `None` when the formatter fails
    async fn format(&self, source: &str) -> Option<String>;

    /// Project-wide typecheck; errors are raw compiler lines
    async fn typecheck(&self) -> CheckOutcome;
}

/// eslint, prettier and tsc through `npx` in the UI root
pub struct NpxToolchain {
    ui_root: PathBuf,
}

impl NpxToolchain {
    pub fn new(ui_root: impl Into<PathBuf>) -> Self {
        Self {
            ui_root: ui_root.into(),
        }
    }

    fn npx(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("npx");
        cmd.args(args).current_dir(&self.ui_root);
        cmd
    }
}

#[derive(Deserialize)]
struct EslintFile {
    #[serde(default)]
    messages: Vec<EslintMessage>,
}

#[derive(Deserialize)]
struct EslintMessage {
    #[serde(default)]
    severity: u8,
    #[serde(default)]
    line: Option<u32>,
    #[serde(default)]
    message: String,
}

/// Error-level messages of an eslint JSON report as `Line N: message`
pub fn parse_eslint_report(stdout: &str) -> Option<Vec<String>> {
    let files: Vec<EslintFile> = serde_json::from_str(stdout.trim()).ok()?;
    Some(
        files
            .iter()
            .flat_map(|f| &f.messages)
            .filter(|m| m.severity >= 2)
            .map(|m| match m.line {
                Some(line) => format!("Line {}: {}", line, m.message),
                None => m.message.clone(),
            })
            .collect(),
    )
}

/// Compiler output lines that mention `file_path`
pub fn typescript_errors_for(output: &str, file_path: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.contains(file_path))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Toolchain for NpxToolchain {
    async fn lint(&self, file: &Path) -> CheckOutcome {
        let path = file.to_string_lossy().into_owned();
        let mut cmd = self.npx(&["eslint", "--format", "json", path.as_str()]);
        let run = match run_command_with_timeout(&mut cmd, None, LINT_TIMEOUT).await {
            Ok(run) => run,
            Err(err) => return CheckOutcome::Inconclusive(format!("eslint: {:#}", err)),
        };
        if run.timed_out {
            tracing::warn!("linting timed out");
            return CheckOutcome::Inconclusive("eslint timed out".to_string());
        }
        if run.success() {
            return CheckOutcome::Passed;
        }

        match parse_eslint_report(&run.stdout) {
            Some(errors) if errors.is_empty() => CheckOutcome::FailedWithErrors(vec![format!(
                "eslint exited with {}",
                run.status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "no status".to_string())
            )]),
            Some(errors) => CheckOutcome::FailedWithErrors(errors),
            None if run.stdout.trim().is_empty() => {
                CheckOutcome::Inconclusive(truncate(run.stderr.trim(), 500))
            }
            None => CheckOutcome::FailedWithErrors(vec![truncate(run.stdout.trim(), 2000)]),
        }
    }

    async fn format(&self, source: &str) -> Option<String> {
        let mut cmd = self.npx(&["prettier", "--parser", "typescript"]);
        match run_command_with_timeout(&mut cmd, Some(source), FORMAT_TIMEOUT).await {
            Ok(run) if run.success() => Some(run.stdout),
            Ok(run) => {
                tracing::warn!(timed_out = run.timed_out, "formatting failed");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "formatting failed");
                None
            }
        }
    }

    async fn typecheck(&self) -> CheckOutcome {
        let mut cmd = self.npx(&["tsc", "--noEmit", "--pretty", "false"]);
        match run_command_with_timeout(&mut cmd, None, TYPECHECK_TIMEOUT).await {
            Ok(run) if run.timed_out => {
                tracing::warn!("typescript check timed out");
                CheckOutcome::Inconclusive("tsc timed out".to_string())
            }
            Ok(run) if run.success() => CheckOutcome::Passed,
            Ok(run) => {
                CheckOutcome::FailedWithErrors(run.stdout.lines().map(str::to_string).collect())
            }
            Err(err) => CheckOutcome::Inconclusive(format!("tsc: {:#}", err)),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ReviewReply {
    #[serde(default)]
    approved: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    issues: Vec<ReviewIssue>,
    #[serde(default)]
    improved_code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReviewIssue {
    #[serde(default, deserialize_with = "null_as_default")]
    severity: String,
    #[serde(default, deserialize_with = "null_as_default")]
    description: String,
}

pub struct CodeReviewer {
    llm: Arc<dyn LlmClient>,
    toolchain: Arc<dyn Toolchain>,
    ui_root: PathBuf,
    policy: InconclusivePolicy,
}

impl CodeReviewer {
    pub fn new(settings: &Settings, llm: Arc<dyn LlmClient>, toolchain: Arc<dyn Toolchain>) -> Self {
        Self {
            llm,
            toolchain,
            ui_root: settings.ui_root(),
            policy: settings.inconclusive_policy,
        }
    }

    /// Lint, ask the model to review, format, then re-lint. Review problems
    /// are logged and never fail the fix.
    pub async fn review_and_improve(&self, mut fix: CodeFix) -> CodeFix {
        tracing::info!(path = %fix.file_path, "reviewing fix");

        let lint = self.lint_fix(&fix).await;
        let context = review_context(&fix, lint.errors());

        match self
            .llm
            .complete(CompletionRequest::new(CODE_REVIEW_SYSTEM, &context))
            .await
            .and_then(|text| parse_json_object::<ReviewReply>(&text))
        {
            Ok(review) => apply_review(&mut fix, review),
            Err(err) => tracing::warn!(path = %fix.file_path, error = %err, "review failed"),
        }

        if let Some(formatted) = self.toolchain.format(&fix.fixed_content).await {
            fix.fixed_content = keep_trailing_newline(&fix.fixed_content, formatted);
        }

        fix.linting_passed = self.lint_fix(&fix).await.passes(self.policy);
        tracing::info!(path = %fix.file_path, linting_passed = fix.linting_passed, "review done");
        fix
    }

    /// Lint the target file with `fix` applied, via a scratch copy.
    async fn lint_fix(&self, fix: &CodeFix) -> CheckOutcome {
        let original = self.ui_root.join(&fix.file_path);
        let Ok(content) = tokio::fs::read_to_string(&original).await else {
            return CheckOutcome::Passed;
        };
        let patched = content.replacen(&fix.original_content, &fix.fixed_content, 1);

        let scratch = self.ui_root.join(scratch_file_name(&fix.file_path));
        if let Err(err) = tokio::fs::write(&scratch, patched).await {
            return CheckOutcome::Inconclusive(format!("cannot write scratch copy: {}", err));
        }
        let outcome = self.toolchain.lint(&scratch).await;
        let _ = tokio::fs::remove_file(&scratch).await;

        if let CheckOutcome::Inconclusive(reason) = &outcome {
            tracing::warn!(path = %fix.file_path, reason = %reason, "lint inconclusive");
        }
        outcome
    }

    /// Whether a spec/test file for the fixed module exists under the UI root
    pub async fn check_test_coverage(&self, fix: &CodeFix) -> bool {
        let Some(stem) = Path::new(&fix.file_path)
            .file_stem()
            .and_then(|s| s.to_str())
        else {
            return false;
        };
        let candidates: Vec<String> = ["spec", "test", "cy"]
            .iter()
            .flat_map(|kind| ["ts", "tsx"].map(|ext| format!("{}.{}.{}", stem, kind, ext)))
            .collect();

        WalkDir::new(&self.ui_root)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !e
                        .file_name()
                        .to_str()
                        .is_some_and(|name| SKIPPED_DIRS.contains(&name))
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .any(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|name| candidates.iter().any(|c| c == name))
            })
    }

    /// Project typecheck, scoped to errors mentioning the fixed file
    pub async fn validate_typescript(&self, fix: &CodeFix) -> CheckOutcome {
        match self.toolchain.typecheck().await {
            CheckOutcome::FailedWithErrors(lines) => {
                let errors = typescript_errors_for(&lines.join("\n"), &fix.file_path);
                if errors.is_empty() {
                    CheckOutcome::Passed
                } else {
                    CheckOutcome::FailedWithErrors(errors)
                }
            }
            other => other,
        }
    }
}

/// Scratch name keeping the fixed file's extension, so `.ts` sources are not
/// linted as TSX.
fn scratch_file_name(file_path: &str) -> String {
    let ext = Path::new(file_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("tsx");
    format!("{}.{}", SCRATCH_STEM, ext)
}

fn review_context(fix: &CodeFix, lint_errors: &[String]) -> String {
    let mut context = format!(
        "## Code Change to Review\n\n\
         **File**: `{}`\n\n\
         **Description**: {}\n\n\
         ### Original Code\n```typescript\n{}\n```\n\n\
         ### Proposed Change\n```typescript\n{}\n```\n",
        fix.file_path, fix.description, fix.original_content, fix.fixed_content
    );
    if !lint_errors.is_empty() {
        let _ = write!(
            context,
            "\n### Linting Errors\n```\n{}\n```\n",
            lint_errors.join("\n")
        );
    }
    context
}

fn apply_review(fix: &mut CodeFix, review: ReviewReply) {
    if review.approved {
        tracing::info!(path = %fix.file_path, "fix approved");
        return;
    }
    let Some(improved) = review
        .improved_code
        .filter(|code| !code.trim().is_empty() && *code != fix.fixed_content)
    else {
        return;
    };

    tracing::info!(path = %fix.file_path, issues = review.issues.len(), "fix improved");
    fix.fixed_content = improved;
    fix.self_review_notes = review
        .issues
        .iter()
        .map(|i| format!("[{}] {}", i.severity, i.description))
        .collect();
}

/// Formatters terminate output with a newline; a snippet that had none must
/// not gain one or the substitution changes the surrounding line.
fn keep_trailing_newline(before: &str, mut formatted: String) -> String {
    if !before.ends_with('\n') {
        while formatted.ends_with('\n') {
            formatted.pop();
        }
    }
    formatted
}
