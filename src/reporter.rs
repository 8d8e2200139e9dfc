//! Issue and pull request rendering
//!
//! Hypotheses become markdown issues; fixed reports become a branch, one
//! commit per touched file and a pull request back to the base branch.

use crate::config::{Labels, Settings};
use crate::github::{HostingApi, PullRequest};
use crate::models::{BugHypothesis, BugReport};
use crate::util::prefix_chars;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

/// Evidence blocks shown per issue
const MAX_EVIDENCE_BLOCKS: usize = 3;
const MAX_EVIDENCE_ERROR_CHARS: usize = 2000;

pub struct Reporter {
    hosting: Arc<dyn HostingApi>,
    labels: Labels,
    base_branch: String,
    ui_dir: String,
    ui_root: PathBuf,
}

/// Deterministic branch carrying the fix for an issue
pub fn fix_branch_name(issue: u64) -> String {
    format!("bug-agent/fix-{}", issue)
}

/// Labels applied to a freshly filed issue
pub fn issue_labels(hypothesis: &BugHypothesis, labels: &Labels) -> Vec<String> {
    vec![
        "bug".to_string(),
        labels.agent_detected.clone(),
        labels.needs_confirmation.clone(),
        format!("severity:{}", hypothesis.severity.as_str()),
        format!("category:{}", hypothesis.category.as_str()),
    ]
}

pub fn render_issue_body(hypothesis: &BugHypothesis, labels: &Labels) -> String {
    let mut body = String::new();
    let _ = write!(
        body,
        "## Summary\n{}\n\n\
         ## Bug Details\n\n\
         | Attribute | Value |\n\
         |-----------|-------|\n\
         | **Severity** | {} |\n\
         | **Category** | {} |\n\
         | **Confidence** | {:.0}% |\n\
         | **Detected By** | {} |\n\
         | **Detected At** | {} |\n\n\
         ## Root Cause Analysis\n{}\n\n\
         ## Affected Files\n",
        hypothesis.description,
        hypothesis.severity.as_str().to_uppercase(),
        hypothesis.category.as_str(),
        hypothesis.confidence() * 100.0,
        hypothesis.analyzed_by,
        hypothesis.created_at.format("%Y-%m-%d %H:%M UTC"),
        hypothesis.root_cause,
    );

    if hypothesis.affected_files.is_empty() {
        body.push_str("_No specific files identified_\n");
    }
    for file in &hypothesis.affected_files {
        let _ = writeln!(body, "- `{}`", file);
    }

    body.push_str("\n## Affected Components\n");
    if hypothesis.affected_components.is_empty() {
        body.push_str("_No specific components identified_\n");
    }
    for component in &hypothesis.affected_components {
        let _ = writeln!(body, "- {}", component);
    }

    body.push_str("\n## Reproduction Steps\n");
    if hypothesis.reproduction_steps.is_empty() {
        body.push_str("_See test failure details below_\n");
    }
    for (i, step) in hypothesis.reproduction_steps.iter().enumerate() {
        let _ = writeln!(body, "{}. {}", i + 1, step);
    }

    let _ = write!(
        body,
        "\n## Environment\n- **Browsers**: {}\n- **Viewports**: {}\n",
        hypothesis.affected_browsers.join(", "),
        hypothesis.affected_viewports.join(", "),
    );

    if let Some(fix) = &hypothesis.suggested_fix {
        let _ = write!(body, "\n## Suggested Fix\n{}\n", fix);
    }

    body.push_str("\n---\n\n## Test Failure Evidence\n");
    for failure in hypothesis.test_failures.iter().take(MAX_EVIDENCE_BLOCKS) {
        let _ = write!(
            body,
            "\n### {}\n\n\
             - **File**: `{}`\n\
             - **Browser**: {}\n\
             - **Viewport**: {}\n\n\
             <details>\n<summary>Error Message</summary>\n\n\
             ```\n{}\n```\n\n\
             </details>\n",
            failure.test_name,
            failure.test_file,
            failure.browser,
            failure.viewport,
            prefix_chars(&failure.error_message, MAX_EVIDENCE_ERROR_CHARS),
        );
    }

    let _ = write!(
        body,
        "\n---\n\n## Next Steps\n\n\
         1. **Review this bug report** and verify the analysis is correct\n\
         2. **If confirmed**: add the `{}` label to trigger automated fix generation\n\
         3. **If not a bug**: close this issue with a comment explaining why\n\n\
         > This issue was filed automatically by bug-agent.\n",
        labels.confirmed,
    );
    body
}

pub fn render_pr_body(report: &BugReport, issue: u64) -> String {
    let mut body = format!(
        "## Summary\n\nAutomated fix for bug #{}: {}\n\n## Changes Made\n\n",
        issue, report.hypothesis.title
    );
    for fix in &report.proposed_fixes {
        let _ = write!(body, "### `{}`\n{}\n\n", fix.file_path, fix.description);
        for note in &fix.self_review_notes {
            let _ = writeln!(body, "- {}", note);
        }
        if !fix.self_review_notes.is_empty() {
            body.push('\n');
        }
    }

    let check = |ok: bool| if ok { "x" } else { " " };
    let lint_ok = report.proposed_fixes.iter().all(|f| f.linting_passed);
    let tests_ok = report.proposed_fixes.iter().all(|f| f.tests_passed);
    let _ = write!(
        body,
        "## Testing\n\n\
         - [{}] Generated fix passes linting\n\
         - [{}] Generated fix passes the regression suite\n\
         - [x] Automated review completed\n\n\
         ## Review Checklist\n\n\
         Before merging, please verify:\n\
         - [ ] The fix addresses the root cause\n\
         - [ ] No unintended side effects\n\
         - [ ] Code follows project conventions\n\
         - [ ] Tests adequately cover the fix\n\n\
         ---\n\n\
         > This PR was opened automatically by bug-agent.\n\
         > Fixes #{}\n",
        check(lint_ok),
        check(tests_ok),
        issue,
    );
    body
}

impl Reporter {
    pub fn new(settings: &Settings, hosting: Arc<dyn HostingApi>) -> Self {
        Self {
            hosting,
            labels: settings.labels.clone(),
            base_branch: settings.github_base_branch.clone(),
            ui_dir: settings.ui_dir.clone(),
            ui_root: settings.ui_root(),
        }
    }

    /// File an issue for `hypothesis` and wrap it in a new report.
    pub async fn create_bug_report(&self, hypothesis: BugHypothesis) -> Result<BugReport> {
        let title = format!("[Bug Agent] {}", hypothesis.title);
        let body = render_issue_body(&hypothesis, &self.labels);
        let labels = issue_labels(&hypothesis, &self.labels);

        let issue = self
            .hosting
            .create_issue(&title, &body, &labels)
            .await
            .with_context(|| format!("Failed to file issue '{}'", hypothesis.title))?;

        Ok(BugReport::new(hypothesis).with_issue(issue.number, issue.html_url))
    }

    pub async fn add_comment(&self, issue: u64, text: &str) -> Result<()> {
        self.hosting.add_comment(issue, text).await
    }

    /// Push the report's fixes to the fix branch and open a pull request.
    ///
    /// Each touched file is committed with its full working-tree content, so
    /// the fixes must already be applied locally.
    pub async fn create_pull_request(&self, report: &BugReport) -> Result<PullRequest> {
        let issue = report
            .issue_number
            .ok_or_else(|| anyhow::anyhow!("Report {} has no issue number", report.id))?;
        let branch = fix_branch_name(issue);

        self.hosting
            .create_branch(&branch, &self.base_branch)
            .await?;

        let mut committed: Vec<&str> = Vec::new();
        for fix in &report.proposed_fixes {
            if committed.contains(&fix.file_path.as_str()) {
                continue;
            }
            let local = self.ui_root.join(&fix.file_path);
            let content = tokio::fs::read_to_string(&local)
                .await
                .with_context(|| format!("Failed to read {}", local.display()))?;
            let remote_path = self.remote_path(&fix.file_path);
            let message = format!("fix: {}\n\nFixes #{}", fix.description, issue);
            self.hosting
                .upsert_file(&remote_path, &content, &message, &branch)
                .await?;
            committed.push(&fix.file_path);
        }

        let title = format!("fix: {}", report.hypothesis.title);
        let body = render_pr_body(report, issue);
        let pr_labels = vec![
            self.labels.agent_detected.clone(),
            self.labels.fix_ready.clone(),
        ];
        let pr = self
            .hosting
            .create_pull_request(&title, &body, &branch, &self.base_branch, &pr_labels)
            .await?;

        self.hosting
            .remove_label(issue, &self.labels.needs_confirmation)
            .await?;
        self.hosting
            .add_label(issue, &self.labels.fix_ready)
            .await?;
        self.hosting
            .add_comment(issue, &format!("Automated fix created in #{}", pr.number))
            .await?;

        Ok(pr)
    }

    /// Open issues still waiting for a human decision
    pub async fn pending_confirmations(&self) -> Result<Vec<u64>> {
        let issues = self
            .hosting
            .issues_with_label(&self.labels.needs_confirmation)
            .await?;
        Ok(issues.into_iter().map(|i| i.number).collect())
    }

    pub async fn confirmed_bugs(&self) -> Result<Vec<u64>> {
        let issues = self
            .hosting
            .issues_with_label(&self.labels.confirmed)
            .await?;
        Ok(issues.into_iter().map(|i| i.number).collect())
    }

    fn remote_path(&self, file_path: &str) -> String {
        let dir = self.ui_dir.trim_matches('/');
        if dir.is_empty() || dir == "." {
            file_path.to_string()
        } else {
            format!("{}/{}", dir, file_path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BugCategory, BugSeverity, CodeFix, TestFailure};
    use crate::testsupport::FakeHosting;

    fn hypothesis() -> BugHypothesis {
        let mut h = BugHypothesis::new(
            "Profile crashes on load",
            "The profile page throws before data arrives",
            BugSeverity::High,
            BugCategory::Functional,
            0.85,
            "profile is read before it loads",
        )
        .unwrap()
        .with_affected_files(vec!["components/Profile.tsx".into()])
        .with_reproduction_steps(vec!["Open /profile".into(), "Wait".into()])
        .with_environment(vec!["chromium".into(), "webkit".into()], vec!["desktop".into()]);
        for i in 0..4 {
            h = h.with_evidence(TestFailure::new(
                format!("evidence-{}", i),
                "profile.spec.ts",
                "chromium",
                "desktop",
                "E".repeat(2500),
            ));
        }
        h
    }

    fn settings(repo: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.repo_path = repo.to_path_buf();
        settings.ui_dir = "ui".to_string();
        settings
    }

    #[test]
    fn test_issue_body_sections() {
        let body = render_issue_body(&hypothesis(), &Labels::default());
        assert!(body.contains("| **Severity** | HIGH |"));
        assert!(body.contains("| **Confidence** | 85% |"));
        assert!(body.contains("- `components/Profile.tsx`"));
        assert!(body.contains("_No specific components identified_"));
        assert!(body.contains("1. Open /profile\n2. Wait\n"));
        assert!(body.contains("- **Browsers**: chromium, webkit"));
        assert!(!body.contains("## Suggested Fix"));
        assert!(body.contains("`confirmed` label"));
    }

    #[test]
    fn test_issue_body_limits_evidence() {
        let body = render_issue_body(&hypothesis(), &Labels::default());
        assert!(body.contains("### evidence-2"));
        assert!(!body.contains("### evidence-3"));
        assert!(body.contains(&"E".repeat(2000)));
        assert!(!body.contains(&"E".repeat(2001)));
    }

    #[test]
    fn test_labels_carry_severity_and_category() {
        let labels = issue_labels(&hypothesis(), &Labels::default());
        assert_eq!(
            labels,
            vec![
                "bug",
                "agent-detected",
                "needs-confirmation",
                "severity:high",
                "category:functional"
            ]
        );
    }

    #[test]
    fn test_pr_body_references_issue() {
        let mut report = BugReport::new(hypothesis()).with_issue(42, "u");
        let mut fix = CodeFix::new("components/Profile.tsx", "a", "b", "guard null profile");
        fix.linting_passed = true;
        fix.tests_passed = true;
        fix.self_review_notes.push("[warning] prefer optional chaining".into());
        report.proposed_fixes.push(fix);

        let body = render_pr_body(&report, 42);
        assert!(body.contains("Automated fix for bug #42: Profile crashes on load"));
        assert!(body.contains("### `components/Profile.tsx`\nguard null profile"));
        assert!(body.contains("- [warning] prefer optional chaining"));
        assert!(body.contains("- [x] Generated fix passes linting"));
        assert!(body.ends_with("> Fixes #42\n"));
    }

    #[tokio::test]
    async fn test_create_bug_report_files_issue() {
        let dir = tempfile::tempdir().unwrap();
        let hosting = Arc::new(FakeHosting::new());
        let reporter = Reporter::new(&settings(dir.path()), hosting.clone());

        let report = reporter.create_bug_report(hypothesis()).await.unwrap();
        assert_eq!(report.issue_number, Some(1));
        assert!(report.issue_url.as_deref().unwrap().ends_with("/issues/1"));

        let issues = hosting.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].title, "[Bug Agent] Profile crashes on load");
        assert!(issues[0].labels.contains(&"severity:high".to_string()));
    }

    #[tokio::test]
    async fn test_create_pull_request_commits_and_relabels() {
        let dir = tempfile::tempdir().unwrap();
        let ui = dir.path().join("ui/components");
        std::fs::create_dir_all(&ui).unwrap();
        std::fs::write(ui.join("Profile.tsx"), "const fixed = true;\n").unwrap();

        let hosting = Arc::new(FakeHosting::new());
        let reporter = Reporter::new(&settings(dir.path()), hosting.clone());
        let mut report = BugReport::new(hypothesis()).with_issue(7, "u");
        report.proposed_fixes = vec![
            CodeFix::new("components/Profile.tsx", "a", "b", "first"),
            CodeFix::new("components/Profile.tsx", "c", "d", "second"),
        ];

        let pr = reporter.create_pull_request(&report).await.unwrap();
        assert_eq!(pr.number, 100);

        assert_eq!(hosting.branches(), vec![("bug-agent/fix-7".to_string(), "main".to_string())]);
        let files = hosting.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "ui/components/Profile.tsx");
        assert_eq!(files[0].1, "const fixed = true;\n");

        let prs = hosting.pull_requests();
        assert_eq!(prs[0].title, "fix: Profile crashes on load");
        assert_eq!(prs[0].head, "bug-agent/fix-7");
        assert!(prs[0].body.contains("Fixes #7"));

        assert_eq!(hosting.removed_labels(), vec![(7, "needs-confirmation".to_string())]);
        assert_eq!(hosting.added_labels(), vec![(7, "fix-ready".to_string())]);
        assert_eq!(hosting.comments(), vec![(7, "Automated fix created in #100".to_string())]);
    }

    #[tokio::test]
    async fn test_pending_and_confirmed_lists() {
        let dir = tempfile::tempdir().unwrap();
        let hosting = Arc::new(FakeHosting::new());
        hosting.set_labelled("needs-confirmation", &[3, 4]);
        hosting.set_labelled("confirmed", &[9]);
        let reporter = Reporter::new(&settings(dir.path()), hosting);

        assert_eq!(reporter.pending_confirmations().await.unwrap(), vec![3, 4]);
        assert_eq!(reporter.confirmed_bugs().await.unwrap(), vec![9]);
    }
}
