//! Fix generation and application
//!
//! A fix is a single first-occurrence substitution in one file under the UI
//! root. Candidates from the model are only kept when their anchor text is
//! present verbatim in the live file. Applied substitutions are journaled by
//! offset so a revert touches exactly the bytes that were changed.

use crate::config::Settings;
use crate::llm::parse::{null_as_default, parse_json_object};
use crate::llm::prompts::{test_for_fix_prompt, FIX_GENERATION_SYSTEM, TEST_WRITER_SYSTEM};
use crate::llm::tools::resolve_under;
use crate::llm::{CompletionRequest, LlmClient, ToolRegistry};
use crate::models::{BugHypothesis, CodeFix};
use crate::util::prefix_chars;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

/// `read_file` cap while generating fixes
pub const FIX_READ_CAP: usize = 15_000;
/// Per-file cap for the affected-file listing in the prompt
const CONTEXT_FILE_CHARS: usize = 10_000;

#[derive(Debug, Default, Deserialize)]
struct FixReply {
    #[serde(default, deserialize_with = "null_as_default")]
    fixes: Vec<FixCandidate>,
    #[serde(default)]
    explanation: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FixCandidate {
    #[serde(default, deserialize_with = "null_as_default")]
    file_path: String,
    #[serde(default, deserialize_with = "null_as_default")]
    description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    old_content: String,
    #[serde(default, deserialize_with = "null_as_default")]
    new_content: String,
}

#[derive(Debug)]
struct AppliedEdit {
    file_path: String,
    offset: usize,
    original: String,
    fixed: String,
}

/// Substitutions made by [`CodeFixer::apply_fixes`], in application order
#[derive(Debug, Default)]
pub struct FixJournal {
    edits: Vec<AppliedEdit>,
}

impl FixJournal {
    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}

pub struct CodeFixer {
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    ui_root: PathBuf,
}

impl CodeFixer {
    pub fn new(settings: &Settings, llm: Arc<dyn LlmClient>) -> Self {
        let ui_root = settings.ui_root();
        Self {
            llm,
            tools: ToolRegistry::repository(ui_root.clone(), FIX_READ_CAP),
            ui_root,
        }
    }

    /// Ask the model for edits fixing `hypothesis` and keep the ones that can
    /// be applied to the current tree. Never fails: errors yield no fixes.
    pub async fn generate_fix(&self, hypothesis: &BugHypothesis) -> Vec<CodeFix> {
        tracing::info!(title = %hypothesis.title, "generating fix");

        let context = self.format_bug_context(hypothesis).await;
        let request =
            CompletionRequest::new(FIX_GENERATION_SYSTEM, &context).with_tools(&self.tools);

        let response = match self.llm.complete(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, "fix generation failed");
                return Vec::new();
            }
        };

        let reply: FixReply = match parse_json_object(&response) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(error = %err, "unparseable fix reply");
                return Vec::new();
            }
        };
        if let Some(explanation) = &reply.explanation {
            tracing::debug!(explanation = %explanation, "fix approach");
        }

        let mut fixes = Vec::new();
        for candidate in reply.fixes {
            if let Some(fix) = self.validate_candidate(candidate).await {
                fixes.push(fix);
            }
        }

        if fixes.is_empty() {
            tracing::warn!(title = %hypothesis.title, "no applicable fixes generated");
        } else {
            tracing::info!(count = fixes.len(), "fixes generated");
        }
        fixes
    }

    async fn format_bug_context(&self, hypothesis: &BugHypothesis) -> String {
        let mut context = String::new();
        let _ = write!(
            context,
            "## Bug to Fix\n\n\
             **Title**: {}\n\n\
             **Description**: {}\n\n\
             **Root Cause**: {}\n\n\
             **Severity**: {}\n\
             **Category**: {}\n\n\
             ## Affected Files\n",
            hypothesis.title,
            hypothesis.description,
            hypothesis.root_cause,
            hypothesis.severity.as_str(),
            hypothesis.category.as_str(),
        );

        for file in &hypothesis.affected_files {
            let _ = write!(context, "\n### `{}`\n", file);
            let content = match resolve_under(&self.ui_root, file) {
                Ok(path) => tokio::fs::read_to_string(path).await.ok(),
                Err(_) => None,
            };
            match content {
                Some(content) => {
                    let shown = prefix_chars(&content, CONTEXT_FILE_CHARS);
                    let marker = if shown.len() < content.len() {
                        "\n... [truncated]"
                    } else {
                        ""
                    };
                    let _ = write!(context, "```typescript\n{}{}\n```\n", shown, marker);
                }
                None => context.push_str("_File not found_\n"),
            }
        }

        context.push_str("\n## Suggested Fix Approach\n");
        match &hypothesis.suggested_fix {
            Some(approach) => context.push_str(approach),
            None => context.push_str(
                "No specific approach suggested. Analyze the code and determine the best fix.",
            ),
        }
        context
    }

    async fn validate_candidate(&self, candidate: FixCandidate) -> Option<CodeFix> {
        if candidate.file_path.trim().is_empty()
            || candidate.old_content.is_empty()
            || candidate.new_content.is_empty()
        {
            tracing::warn!(path = %candidate.file_path, "dropping incomplete fix");
            return None;
        }

        let path = match resolve_under(&self.ui_root, &candidate.file_path) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(path = %candidate.file_path, error = %err, "dropping fix");
                return None;
            }
        };
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(current) => current,
            Err(_) => {
                tracing::warn!(path = %candidate.file_path, "dropping fix for missing file");
                return None;
            }
        };
        if !current.contains(&candidate.old_content) {
            tracing::warn!(
                path = %candidate.file_path,
                preview = %prefix_chars(&candidate.old_content, 100),
                "dropping fix whose anchor is not in the file"
            );
            return None;
        }

        Some(CodeFix::new(
            candidate.file_path,
            candidate.old_content,
            candidate.new_content,
            candidate.description,
        ))
    }

    /// Substitute each fix's original text with its fixed text, first
    /// occurrence only. Every substitution made is recorded in `journal`,
    /// including when a later fix fails.
    pub async fn apply_fixes(&self, fixes: &[CodeFix], journal: &mut FixJournal) -> Result<()> {
        for fix in fixes {
            if let Some(offset) = self
                .substitute_first(&fix.file_path, &fix.original_content, &fix.fixed_content)
                .await?
            {
                tracing::info!(path = %fix.file_path, offset, "fix applied");
                journal.edits.push(AppliedEdit {
                    file_path: fix.file_path.clone(),
                    offset,
                    original: fix.original_content.clone(),
                    fixed: fix.fixed_content.clone(),
                });
            }
        }
        Ok(())
    }

    /// Undo the edits in `journal`, last first, at the offsets where they
    /// were made. An edit whose text was changed since is left alone and
    /// reported as an error once every other edit has been undone.
    pub async fn revert_fixes(&self, journal: FixJournal) -> Result<()> {
        let mut conflicts = Vec::new();
        for edit in journal.edits.into_iter().rev() {
            let path = resolve_under(&self.ui_root, &edit.file_path)
                .map_err(|err| anyhow::anyhow!("{}", err))?;
            if !path.is_file() {
                tracing::warn!(path = %edit.file_path, "cannot revert missing file");
                conflicts.push(edit.file_path);
                continue;
            }

            let mut content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let range = edit.offset..edit.offset + edit.fixed.len();
            if content.get(range.clone()) != Some(edit.fixed.as_str()) {
                tracing::warn!(path = %edit.file_path, offset = edit.offset, "fixed text moved; not reverting");
                conflicts.push(edit.file_path);
                continue;
            }
            content.replace_range(range, &edit.original);
            tokio::fs::write(&path, content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(path = %edit.file_path, "fix reverted");
        }

        if !conflicts.is_empty() {
            anyhow::bail!("Could not revert edits in {}", conflicts.join(", "));
        }
        Ok(())
    }

    /// Byte offset of the substitution, `None` when the file or the text is
    /// missing.
    async fn substitute_first(&self, file_path: &str, from: &str, to: &str) -> Result<Option<usize>> {
        let path = resolve_under(&self.ui_root, file_path)
            .map_err(|err| anyhow::anyhow!("{}", err))?;
        if !path.is_file() {
            tracing::warn!(path = %file_path, "cannot edit missing file");
            return Ok(None);
        }

        let mut content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let Some(offset) = content.find(from) else {
            tracing::warn!(path = %file_path, "expected text not found; file left unchanged");
            return Ok(None);
        };
        content.replace_range(offset..offset + from.len(), to);
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(Some(offset))
    }

    /// Ask the model for a Playwright test covering `fix`.
    pub async fn create_test_for_fix(
        &self,
        fix: &CodeFix,
        hypothesis: &BugHypothesis,
    ) -> Option<String> {
        let prompt = test_for_fix_prompt(&hypothesis.title, &fix.file_path, &fix.description);
        match self
            .llm
            .complete(CompletionRequest::new(TEST_WRITER_SYSTEM, &prompt))
            .await
        {
            Ok(code) => Some(code),
            Err(err) => {
                tracing::error!(path = %fix.file_path, error = %err, "test generation failed");
                None
            }
        }
    }
}
