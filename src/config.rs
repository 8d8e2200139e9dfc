//! Configuration management for bug-agent
//!
//! Settings come from an optional TOML file (`--config`, else
//! `~/.config/bug-agent/config.toml`), then environment overrides. Secrets are
//! never read from the file: they resolve from the environment first, then the
//! system keychain.

use crate::util::preserve_corrupt_file;
use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const KEYRING_SERVICE: &str = "bug-agent";
const OPENROUTER_KEY_USERNAME: &str = "openrouter_api_key";
const GITHUB_TOKEN_USERNAME: &str = "github_token";

/// How an inconclusive lint/typecheck (timeout, missing tool) is scored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InconclusivePolicy {
    #[default]
    Pass,
    Fail,
}

impl InconclusivePolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pass" => Some(InconclusivePolicy::Pass),
            "fail" => Some(InconclusivePolicy::Fail),
            _ => None,
        }
    }
}

/// Issue label names used across the workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Labels {
    pub agent_detected: String,
    pub needs_confirmation: String,
    pub confirmed: String,
    pub fix_ready: String,
}

impl Default for Labels {
    fn default() -> Self {
        Self {
            agent_detected: "agent-detected".to_string(),
            needs_confirmation: "needs-confirmation".to_string(),
            confirmed: "confirmed".to_string(),
            fix_ready: "fix-ready".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of the watched git repository
    pub repo_path: PathBuf,
    /// Where the state file and scan marker live
    pub results_path: PathBuf,
    /// Web application directory, relative to `repo_path`
    pub ui_dir: String,
    /// URL the browser tests run against
    pub base_url: String,

    /// `owner/name`; falls back to the origin remote when unset
    pub github_repository: Option<String>,
    pub github_base_branch: String,
    pub github_api_url: String,

    pub model: String,
    pub max_tokens: u32,
    pub llm_api_url: String,

    pub max_bugs_per_cycle: usize,
    pub min_report_confidence: f64,
    /// Root-cause word overlap above which two hypotheses count as one bug
    pub correlation_word_overlap: usize,

    pub include_prefixes: Vec<String>,
    pub exclude_patterns: Vec<String>,

    pub labels: Labels,
    pub inconclusive_policy: InconclusivePolicy,
    pub test_timeout_secs: u64,

    #[serde(skip)]
    openrouter_api_key: Option<String>,
    #[serde(skip)]
    github_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            results_path: PathBuf::from("bug-agent-results"),
            ui_dir: "ui".to_string(),
            base_url: "http://localhost:3000".to_string(),
            github_repository: None,
            github_base_branch: "main".to_string(),
            github_api_url: "https://api.github.com".to_string(),
            model: "anthropic/claude-sonnet-4".to_string(),
            max_tokens: 4096,
            llm_api_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            max_bugs_per_cycle: 5,
            min_report_confidence: 0.6,
            correlation_word_overlap: 5,
            include_prefixes: [
                "ui/components/",
                "ui/pages/",
                "ui/lib/",
                "ui/const/",
                "ui/styles/",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            exclude_patterns: [".md", ".txt", ".json", "test/", "spec/", ".cy."]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            labels: Labels::default(),
            inconclusive_policy: InconclusivePolicy::Pass,
            test_timeout_secs: 1800,
            openrouter_api_key: None,
            github_token: None,
        }
    }
}

impl Settings {
    /// Default config file location
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("bug-agent").join("config.toml"))
    }

    /// Load settings: file, then environment overrides.
    ///
    /// An explicit `path` must exist and parse. The default location is
    /// optional; a corrupt default file is moved aside and defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => Self::load_default_file(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    fn load_default_file() -> Self {
        let Some(path) = Self::default_config_path() else {
            return Self::default();
        };
        let Ok(content) = fs::read_to_string(&path) else {
            return Self::default();
        };
        match toml::from_str(&content) {
            Ok(settings) => settings,
            Err(err) => {
                preserve_corrupt_file(&path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Apply `BUG_AGENT_*` and well-known environment overrides.
    pub fn apply_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("BUG_AGENT_REPO_PATH") {
            self.repo_path = PathBuf::from(v);
        }
        if let Some(v) = get("BUG_AGENT_RESULTS_PATH") {
            self.results_path = PathBuf::from(v);
        }
        if let Some(v) = get("BUG_AGENT_UI_DIR") {
            self.ui_dir = v;
        }
        if let Some(v) = get("BASE_URL").or_else(|| get("BUG_AGENT_BASE_URL")) {
            self.base_url = v;
        }
        if let Some(v) = get("GITHUB_REPOSITORY") {
            self.github_repository = Some(v);
        }
        if let Some(v) = get("BUG_AGENT_BASE_BRANCH") {
            self.github_base_branch = v;
        }
        if let Some(v) = get("BUG_AGENT_MODEL") {
            self.model = v;
        }
        if let Some(v) = get("BUG_AGENT_MAX_TOKENS").and_then(|v| parse_or_warn(&v, "max_tokens")) {
            self.max_tokens = v;
        }
        if let Some(v) = get("BUG_AGENT_MAX_BUGS_PER_CYCLE")
            .and_then(|v| parse_or_warn(&v, "max_bugs_per_cycle"))
        {
            self.max_bugs_per_cycle = v;
        }
        if let Some(v) = get("BUG_AGENT_MIN_CONFIDENCE")
            .and_then(|v| parse_or_warn(&v, "min_report_confidence"))
        {
            self.min_report_confidence = v;
        }
        if let Some(v) = get("BUG_AGENT_INCONCLUSIVE_POLICY") {
            match InconclusivePolicy::parse(&v) {
                Some(policy) => self.inconclusive_policy = policy,
                None => tracing::warn!(value = %v, "ignoring unknown inconclusive policy"),
            }
        }
        if let Some(v) = get("OPENROUTER_API_KEY") {
            self.openrouter_api_key = Some(v);
        }
        if let Some(v) = get("GITHUB_TOKEN") {
            self.github_token = Some(v);
        }
    }

    /// Absolute-or-relative path of the web application root
    pub fn ui_root(&self) -> PathBuf {
        self.repo_path.join(&self.ui_dir)
    }

    pub fn state_file(&self) -> PathBuf {
        self.results_path.join("agent_state.json")
    }

    pub fn scan_marker_file(&self) -> PathBuf {
        self.results_path.join("last_scan.txt")
    }

    /// OpenRouter API key (environment, then keychain)
    pub fn openrouter_api_key(&self) -> Option<String> {
        self.openrouter_api_key
            .clone()
            .or_else(|| read_keyring_secret(OPENROUTER_KEY_USERNAME, "OPENROUTER_API_KEY"))
    }

    /// GitHub token (environment, then keychain)
    pub fn github_token(&self) -> Option<String> {
        self.github_token
            .clone()
            .or_else(|| read_keyring_secret(GITHUB_TOKEN_USERNAME, "GITHUB_TOKEN"))
    }

    /// Resolve `(owner, name)` of the hosted repository.
    pub fn github_repository(&self) -> Result<(String, String)> {
        if let Some(full) = &self.github_repository {
            let (owner, name) = full
                .split_once('/')
                .filter(|(o, n)| !o.is_empty() && !n.is_empty() && !n.contains('/'))
                .ok_or_else(|| {
                    anyhow::anyhow!("github_repository must look like owner/name, got '{}'", full)
                })?;
            return Ok((owner.to_string(), name.to_string()));
        }
        crate::github::get_remote_info(&self.repo_path)
    }
}

fn parse_or_warn<T: std::str::FromStr>(value: &str, field: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(field, value, "ignoring unparseable environment override");
            None
        }
    }
}

fn read_keyring_secret(username: &str, env_hint: &str) -> Option<String> {
    let entry = match Entry::new(KEYRING_SERVICE, username) {
        Ok(entry) => entry,
        Err(err) => {
            tracing::debug!(error = %err, "system keychain unavailable");
            return None;
        }
    };
    match entry.get_password() {
        Ok(secret) => Some(secret),
        Err(keyring::Error::NoEntry) => None,
        Err(err) => {
            tracing::warn!(
                error = %err,
                "failed to read {} from system keychain; set {} instead",
                username,
                env_hint
            );
            None
        }
    }
}
