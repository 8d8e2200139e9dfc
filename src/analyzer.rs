//! Bug analysis
//!
//! Turns a test failure into a [`BugHypothesis`] by asking the model, and
//! folds hypotheses that describe the same underlying bug together.

use crate::config::Settings;
use crate::llm::parse::{null_as_default, parse_json_object};
use crate::llm::prompts::BUG_ANALYSIS_SYSTEM;
use crate::llm::{CompletionRequest, LlmClient, ToolRegistry};
use crate::models::{BugCategory, BugHypothesis, BugSeverity, TestFailure};
use crate::util::prefix_chars;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

/// Context limits for the analysis prompt
const MAX_CONSOLE_MESSAGES: usize = 20;
const MAX_FAILED_REQUESTS: usize = 10;
const MAX_DOM_CHARS: usize = 5000;
/// `read_file` cap while analysing
pub const ANALYSIS_READ_CAP: usize = 10_000;

/// The model's verdict, as declared in the analysis prompt
#[derive(Debug, Deserialize)]
struct AnalysisReply {
    #[serde(default)]
    is_real_bug: bool,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    root_cause: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    affected_files: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    affected_components: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    reproduction_steps: Vec<String>,
    #[serde(default)]
    suggested_fix: Option<String>,
}

pub struct BugAnalyzer {
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    min_confidence: f64,
    word_overlap: usize,
}

impl BugAnalyzer {
    pub fn new(settings: &Settings, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            tools: ToolRegistry::repository(settings.ui_root(), ANALYSIS_READ_CAP),
            min_confidence: settings.min_report_confidence,
            word_overlap: settings.correlation_word_overlap,
        }
    }

    /// Analyse one failure. Every negative outcome (not a bug, low
    /// confidence, unparseable reply, transport error) is `None`.
    pub async fn analyze_failure(&self, failure: &TestFailure) -> Option<BugHypothesis> {
        tracing::info!(
            test = %failure.test_name,
            browser = %failure.browser,
            viewport = %failure.viewport,
            "analyzing failure"
        );

        let context = format_failure_context(failure);
        let images: Vec<Vec<u8>> = load_screenshot(failure).await.into_iter().collect();
        let request = CompletionRequest::new(BUG_ANALYSIS_SYSTEM, &context)
            .with_images(&images)
            .with_tools(&self.tools);

        let response = match self.llm.complete(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(test = %failure.test_name, error = %err, "analysis failed");
                return None;
            }
        };

        let reply: AnalysisReply = match parse_json_object(&response) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(test = %failure.test_name, error = %err, "unparseable analysis");
                return None;
            }
        };

        if !reply.is_real_bug {
            tracing::info!(test = %failure.test_name, "not a bug");
            return None;
        }

        let confidence = reply.confidence.unwrap_or(0.0);
        if confidence < self.min_confidence {
            tracing::info!(test = %failure.test_name, confidence, "confidence too low");
            return None;
        }

        let hypothesis = match self.build_hypothesis(reply, confidence, failure) {
            Ok(h) => h,
            Err(err) => {
                tracing::warn!(test = %failure.test_name, error = %err, "invalid hypothesis");
                return None;
            }
        };

        tracing::info!(
            title = %hypothesis.title,
            severity = hypothesis.severity.as_str(),
            confidence = hypothesis.confidence(),
            "bug detected"
        );
        Some(hypothesis)
    }

    fn build_hypothesis(
        &self,
        reply: AnalysisReply,
        confidence: f64,
        failure: &TestFailure,
    ) -> Result<BugHypothesis, crate::models::ValidationError> {
        let severity = reply
            .severity
            .as_deref()
            .and_then(BugSeverity::parse)
            .unwrap_or_default();
        let category = reply
            .category
            .as_deref()
            .and_then(BugCategory::parse)
            .unwrap_or_default();

        Ok(BugHypothesis::new(
            reply.title.unwrap_or_else(|| "Unknown Bug".to_string()),
            reply.description.unwrap_or_default(),
            severity,
            category,
            confidence,
            reply.root_cause.unwrap_or_else(|| "Unknown".to_string()),
        )?
        .with_affected_files(reply.affected_files)
        .with_affected_components(reply.affected_components)
        .with_reproduction_steps(reply.reproduction_steps)
        .with_environment(vec![failure.browser.clone()], vec![failure.viewport.clone()])
        .with_suggested_fix(reply.suggested_fix.filter(|s| !s.trim().is_empty()))
        .with_analyzed_by(self.llm.model_name())
        .with_evidence(failure.clone()))
    }

    /// Analyse failures in order and merge hypotheses about the same bug.
    ///
    /// Greedy: each new hypothesis folds into the first related one already
    /// kept, otherwise it is kept as a new bug.
    pub async fn correlate_failures(&self, failures: &[TestFailure]) -> Vec<BugHypothesis> {
        let mut hypotheses: Vec<BugHypothesis> = Vec::new();
        for failure in failures {
            let Some(hypothesis) = self.analyze_failure(failure).await else {
                continue;
            };
            match hypotheses
                .iter_mut()
                .find(|existing| are_related(existing, &hypothesis, self.word_overlap))
            {
                Some(existing) => {
                    tracing::info!(title = %existing.title, "merging related failure");
                    existing.absorb(hypothesis);
                }
                None => hypotheses.push(hypothesis),
            }
        }
        hypotheses
    }
}

/// Same bug when the hypotheses share an affected file, or their root causes
/// share more than `word_overlap` distinct words (case-insensitive).
pub fn are_related(a: &BugHypothesis, b: &BugHypothesis, word_overlap: usize) -> bool {
    if a.affected_files.iter().any(|f| b.affected_files.contains(f)) {
        return true;
    }

    let words = |text: &str| -> HashSet<String> {
        text.to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    };
    let a_words = words(&a.root_cause);
    let b_words = words(&b.root_cause);
    a_words.intersection(&b_words).count() > word_overlap
}

/// Build the user message describing a failure
pub fn format_failure_context(failure: &TestFailure) -> String {
    let mut context = String::new();
    let _ = write!(
        context,
        "## Test Failure\n\n\
         **Test**: {}\n\
         **File**: {}\n\
         **Browser**: {}\n\
         **Viewport**: {}\n\
         **Timestamp**: {}\n\n\
         ### Error\n```\n{}\n```\n\n### Console\n",
        failure.test_name,
        failure.test_file,
        failure.browser,
        failure.viewport,
        failure.timestamp.to_rfc3339(),
        failure.error_message,
    );

    if failure.console_logs.is_empty() {
        context.push_str("No console messages captured.\n");
    } else {
        let skip = failure.console_logs.len().saturating_sub(MAX_CONSOLE_MESSAGES);
        for log in &failure.console_logs[skip..] {
            let _ = writeln!(context, "[{}] {}", log.kind, log.text);
        }
    }

    context.push_str("\n### Failed Network Requests\n");
    let failed: Vec<_> = failure
        .network_logs
        .iter()
        .filter(|r| r.is_failure())
        .take(MAX_FAILED_REQUESTS)
        .collect();
    if failed.is_empty() {
        context.push_str("No failed requests captured.\n");
    } else {
        for req in failed {
            let status = req
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "FAILED".to_string());
            let _ = write!(context, "- {} {} -> {}", req.method, req.url, status);
            if let Some(err) = &req.error {
                let _ = write!(context, " ({})", err);
            }
            context.push('\n');
        }
    }

    if let Some(dom) = &failure.dom_snapshot {
        let _ = write!(
            context,
            "\n### DOM Snapshot (truncated)\n```html\n{}\n```\n",
            prefix_chars(dom, MAX_DOM_CHARS)
        );
    }

    context
}

async fn load_screenshot(failure: &TestFailure) -> Option<Vec<u8>> {
    let path = failure.screenshot_path.as_deref()?;
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            tracing::debug!(path, error = %err, "screenshot unavailable");
            None
        }
    }
}
