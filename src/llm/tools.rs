//! Repository exploration tools offered to the model.
//!
//! Each tool declares a JSON schema; the registry checks a call's arguments
//! against the schema's required fields before dispatching it. Tool failures
//! are reported back to the model as text, never raised to the caller.

use super::agentic::ToolCallMessage;
use crate::util::prefix_chars;
use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Search output cap (about 1.2k tokens)
const MAX_SEARCH_OUTPUT: usize = 5000;
const MAX_LIST_ENTRIES: usize = 50;
const DEFAULT_FILE_PATTERN: &str = "*.tsx";

/// Directories never worth showing the model
const SKIPPED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    ".next",
    "dist",
    "build",
    "coverage",
    "playwright-report",
    "test-results",
];

// ═══════════════════════════════════════════════════════════════════════════
//  DEFINITIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Tool definition in OpenAI function-calling shape
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("{0}")]
    Failed(String),
}

/// A named capability the model may invoke
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema of the arguments object
    fn parameters(&self) -> Value;
    fn call(&self, args: &Map<String, Value>) -> Result<String, ToolError>;
}

// ═══════════════════════════════════════════════════════════════════════════
//  REGISTRY
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The three read-only exploration tools rooted at `root`.
    /// `read_cap` bounds how many characters `read_file` returns.
    pub fn repository(root: impl Into<PathBuf>, read_cap: usize) -> Self {
        let root = root.into();
        let mut registry = Self::new();
        registry.register(Box::new(ReadFile {
            root: root.clone(),
            max_chars: read_cap,
        }));
        registry.register(Box::new(SearchCodebase { root: root.clone() }));
        registry.register(Box::new(ListDirectory { root }));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition {
                tool_type: "function",
                function: FunctionDefinition {
                    name: tool.name(),
                    description: tool.description(),
                    parameters: tool.parameters(),
                },
            })
            .collect()
    }

    /// Validate `arguments` (a JSON string) and run the named tool.
    pub fn dispatch(&self, name: &str, arguments: &str) -> Result<String, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let args = validate_arguments(tool.as_ref(), arguments)?;
        tool.call(&args)
    }

    /// Run a model tool call, rendering any failure as the tool's reply.
    pub fn execute(&self, call: &ToolCallMessage) -> String {
        tracing::debug!(
            tool = %call.function.name,
            arguments = %call.function.arguments,
            "tool call"
        );
        match self.dispatch(&call.function.name, &call.function.arguments) {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!(tool = %call.function.name, error = %err, "tool call rejected");
                format!("Error: {}", err)
            }
        }
    }
}

fn validate_arguments(tool: &dyn Tool, arguments: &str) -> Result<Map<String, Value>, ToolError> {
    let invalid = |reason: String| ToolError::InvalidArguments {
        tool: tool.name().to_string(),
        reason,
    };

    let raw = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };
    let args = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(invalid("arguments must be a JSON object".to_string())),
        Err(e) => return Err(invalid(e.to_string())),
    };

    let schema = tool.parameters();
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for field in required.iter().filter_map(Value::as_str) {
        let declared = schema
            .pointer(&format!("/properties/{}/type", field))
            .and_then(Value::as_str);
        match (args.get(field), declared) {
            (None, _) | (Some(Value::Null), _) => {
                return Err(invalid(format!("missing required field '{}'", field)))
            }
            (Some(value), Some("string")) if !value.is_string() => {
                return Err(invalid(format!("field '{}' must be a string", field)))
            }
            _ => {}
        }
    }

    Ok(args)
}

fn string_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

/// Resolve a model-supplied relative path under `root`, refusing escapes.
pub(crate) fn resolve_under(root: &Path, candidate: &str) -> Result<PathBuf, ToolError> {
    let trimmed = candidate.trim().trim_start_matches("./");
    let relative = Path::new(trimmed);
    if relative.is_absolute() {
        return Err(ToolError::Failed(format!(
            "Absolute paths are not allowed: {}",
            candidate
        )));
    }
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ToolError::Failed(format!(
            "Parent traversal is not allowed: {}",
            candidate
        )));
    }
    Ok(root.join(relative))
}

// ═══════════════════════════════════════════════════════════════════════════
//  READ_FILE
// ═══════════════════════════════════════════════════════════════════════════

struct ReadFile {
    root: PathBuf,
    max_chars: usize,
}

impl Tool for ReadFile {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read the contents of a file from the web application source tree"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file relative to the application root"
                }
            },
            "required": ["path"]
        })
    }

    fn call(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let path = string_arg(args, "path").unwrap_or_default();
        let target = resolve_under(&self.root, path)?;
        if !target.is_file() {
            return Ok(format!("File not found: {}", path));
        }
        let content = fs::read_to_string(&target)
            .map_err(|e| ToolError::Failed(format!("Failed to read {}: {}", path, e)))?;
        Ok(prefix_chars(&content, self.max_chars).to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  SEARCH_CODEBASE
// ═══════════════════════════════════════════════════════════════════════════

struct SearchCodebase {
    root: PathBuf,
}

impl Tool for SearchCodebase {
    fn name(&self) -> &'static str {
        "search_codebase"
    }

    fn description(&self) -> &'static str {
        "Search source files for a pattern. Returns matching lines as path:line: text"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search pattern (supports regex)"
                },
                "file_pattern": {
                    "type": "string",
                    "description": "Glob limiting which files are searched (e.g. '*.tsx', 'components/**'). Default: *.tsx"
                }
            },
            "required": ["query"]
        })
    }

    fn call(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let query = string_arg(args, "query").unwrap_or_default();
        if query.is_empty() {
            return Err(ToolError::Failed("query must not be empty".to_string()));
        }
        let file_pattern = string_arg(args, "file_pattern")
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(DEFAULT_FILE_PATTERN);

        // An invalid regex is searched for literally.
        let matcher = Regex::new(query)
            .or_else(|_| Regex::new(&regex::escape(query)))
            .map_err(|e| ToolError::Failed(format!("Invalid query: {}", e)))?;
        let glob = FileGlob::new(file_pattern)?;

        let mut output = String::new();
        'files: for entry in WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_skipped_dir(e))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if !glob.matches(&relative) {
                continue;
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            for (idx, line) in content.lines().enumerate() {
                if matcher.is_match(line) {
                    output.push_str(&format!("{}:{}: {}\n", relative, idx + 1, line.trim_end()));
                    if output.len() >= MAX_SEARCH_OUTPUT {
                        output = prefix_chars(&output, MAX_SEARCH_OUTPUT).to_string();
                        output.push_str("\n... (output truncated)");
                        break 'files;
                    }
                }
            }
        }

        if output.is_empty() {
            Ok("No matches found".to_string())
        } else {
            Ok(output)
        }
    }
}

fn is_skipped_dir(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

/// Shell-style file filter. Patterns without `/` match the file name;
/// patterns with `/` match the whole relative path.
struct FileGlob {
    matcher: GlobMatcher,
    match_path: bool,
}

impl FileGlob {
    fn new(pattern: &str) -> Result<Self, ToolError> {
        let pattern = pattern.trim().trim_start_matches("./");
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| ToolError::Failed(format!("Invalid file pattern '{}': {}", pattern, e)))?
            .compile_matcher();
        Ok(Self {
            matcher,
            match_path: pattern.contains('/'),
        })
    }

    fn matches(&self, relative: &str) -> bool {
        if self.match_path {
            self.matcher.is_match(relative)
        } else {
            let name = relative.rsplit('/').next().unwrap_or(relative);
            self.matcher.is_match(name)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  LIST_DIRECTORY
// ═══════════════════════════════════════════════════════════════════════════

struct ListDirectory {
    root: PathBuf,
}

impl Tool for ListDirectory {
    fn name(&self) -> &'static str {
        "list_directory"
    }

    fn description(&self) -> &'static str {
        "List files and directories in a path of the application source tree"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path relative to the application root ('.' for the root)"
                }
            },
            "required": ["path"]
        })
    }

    fn call(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let path = string_arg(args, "path").unwrap_or_default();
        let target = resolve_under(&self.root, path)?;
        if !target.is_dir() {
            return Ok(format!("Directory not found: {}", path));
        }

        let mut entries: Vec<String> = fs::read_dir(&target)
            .map_err(|e| ToolError::Failed(format!("Failed to list {}: {}", path, e)))?
            .filter_map(|e| e.ok())
            .filter(|e| {
                !e.file_name()
                    .to_str()
                    .is_some_and(|name| SKIPPED_DIRS.contains(&name))
            })
            .map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                if e.path().is_dir() {
                    format!("{}/", name)
                } else {
                    name
                }
            })
            .collect();
        entries.sort();

        let total = entries.len();
        entries.truncate(MAX_LIST_ENTRIES);
        let mut output = entries.join("\n");
        if total > MAX_LIST_ENTRIES {
            output.push_str(&format!("\n... ({} more entries)", total - MAX_LIST_ENTRIES));
        }
        if output.is_empty() {
            output = "(empty directory)".to_string();
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::agentic::FunctionCallMessage;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("components/profile")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/react")).unwrap();
        fs::write(
            dir.path().join("components/profile/Card.tsx"),
            "export function Card({ user }) {\n  return user.name;\n}\n",
        )
        .unwrap();
        fs::write(dir.path().join("components/Nav.tsx"), "const user = null;\n").unwrap();
        fs::write(dir.path().join("components/util.ts"), "export const user = 1;\n").unwrap();
        fs::write(dir.path().join("node_modules/react/index.tsx"), "user\n").unwrap();
        dir
    }

    fn call(name: &str, args: &str) -> ToolCallMessage {
        ToolCallMessage {
            id: "call_1".to_string(),
            call_type: "function".to_string(),
            function: FunctionCallMessage {
                name: name.to_string(),
                arguments: args.to_string(),
            },
        }
    }

    #[test]
    fn test_definitions_cover_repository_tools() {
        let registry = ToolRegistry::repository("/tmp", 100);
        assert_eq!(
            registry.names(),
            vec!["list_directory", "read_file", "search_codebase"]
        );
        let json = serde_json::to_string(&registry.definitions()).unwrap();
        assert!(json.contains("\"type\":\"function\""));
        assert!(json.contains("file_pattern"));
    }

    #[test]
    fn test_read_file_is_capped() {
        let dir = fixture();
        let registry = ToolRegistry::repository(dir.path(), 10);
        let out = registry
            .dispatch("read_file", r#"{"path": "components/profile/Card.tsx"}"#)
            .unwrap();
        assert_eq!(out, "export fun");
    }

    #[test]
    fn test_read_file_missing_is_reported_not_raised() {
        let dir = fixture();
        let registry = ToolRegistry::repository(dir.path(), 100);
        let out = registry
            .dispatch("read_file", r#"{"path": "nope.tsx"}"#)
            .unwrap();
        assert_eq!(out, "File not found: nope.tsx");
    }

    #[test]
    fn test_read_file_rejects_traversal() {
        let dir = fixture();
        let registry = ToolRegistry::repository(dir.path(), 100);
        let out = registry.execute(&call("read_file", r#"{"path": "../../etc/passwd"}"#));
        assert!(out.starts_with("Error: Parent traversal"), "{}", out);
    }

    #[test]
    fn test_schema_validation_rejects_bad_arguments() {
        let registry = ToolRegistry::repository("/tmp", 100);
        let missing = registry.dispatch("read_file", "{}").unwrap_err();
        assert!(matches!(missing, ToolError::InvalidArguments { .. }));

        let wrong_type = registry.dispatch("read_file", r#"{"path": 7}"#).unwrap_err();
        assert!(wrong_type.to_string().contains("must be a string"));

        let not_object = registry.dispatch("list_directory", "[1,2]").unwrap_err();
        assert!(not_object.to_string().contains("JSON object"));

        let unknown = registry.dispatch("shell", "{}").unwrap_err();
        assert_eq!(unknown, ToolError::UnknownTool("shell".to_string()));
    }

    #[test]
    fn test_search_defaults_to_tsx_and_skips_node_modules() {
        let dir = fixture();
        let registry = ToolRegistry::repository(dir.path(), 100);
        let out = registry
            .dispatch("search_codebase", r#"{"query": "user"}"#)
            .unwrap();
        assert!(out.contains("components/Nav.tsx:1: const user = null;"));
        assert!(out.contains("components/profile/Card.tsx:2:"));
        assert!(!out.contains("util.ts"));
        assert!(!out.contains("node_modules"));
    }

    #[test]
    fn test_search_with_path_glob() {
        let dir = fixture();
        let registry = ToolRegistry::repository(dir.path(), 100);
        let out = registry
            .dispatch(
                "search_codebase",
                r#"{"query": "user", "file_pattern": "components/profile/**"}"#,
            )
            .unwrap();
        assert!(out.contains("Card.tsx"));
        assert!(!out.contains("Nav.tsx"));

        let none = registry
            .dispatch("search_codebase", r#"{"query": "zzz_nothing"}"#)
            .unwrap();
        assert_eq!(none, "No matches found");
    }

    #[test]
    fn test_search_invalid_regex_falls_back_to_literal() {
        let dir = fixture();
        fs::write(dir.path().join("components/Odd.tsx"), "call(foo\n").unwrap();
        let registry = ToolRegistry::repository(dir.path(), 100);
        let out = registry
            .dispatch("search_codebase", r#"{"query": "call(foo"}"#)
            .unwrap();
        assert!(out.contains("Odd.tsx:1:"));
    }

    #[test]
    fn test_list_directory() {
        let dir = fixture();
        let registry = ToolRegistry::repository(dir.path(), 100);
        let out = registry
            .dispatch("list_directory", r#"{"path": "components"}"#)
            .unwrap();
        assert_eq!(out, "Nav.tsx\nprofile/\nutil.ts");

        let root = registry
            .dispatch("list_directory", r#"{"path": "."}"#)
            .unwrap();
        assert_eq!(root, "components/");

        let missing = registry
            .dispatch("list_directory", r#"{"path": "pages"}"#)
            .unwrap();
        assert_eq!(missing, "Directory not found: pages");
    }

    #[test]
    fn test_file_glob_matching() {
        let glob = |g: &str| FileGlob::new(g).unwrap();
        assert!(glob("*.tsx").matches("components/Card.tsx"));
        assert!(!glob("*.tsx").matches("components/Card.ts"));
        assert!(glob("*.{ts,tsx}").matches("lib/api.ts"));
        assert!(glob("components/**").matches("components/a/b.tsx"));
        assert!(!glob("components/*.tsx").matches("components/a/b.tsx"));
        assert!(glob("**/*.tsx").matches("Card.tsx"));
        assert!(glob("**/*.tsx").matches("a/b/Card.tsx"));
        assert!(glob("./file?.ts").matches("file1.ts"));
        assert!(FileGlob::new("src/[").is_err());
    }
}
