use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Truncate to `max` characters, marking the cut with `...` (Unicode-safe).
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Hard prefix of at most `max_chars` characters, no marker.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }
}

/// Run a subprocess to completion, killing it once `timeout` elapses.
///
/// `stdin` is fed while output is collected and closed once written; both
/// happen inside the timeout window. A spawn failure is an error; a timeout
/// is reported through `timed_out`.
pub async fn run_command_with_timeout(
    command: &mut Command,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<CommandRunResult> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().context("Failed to start command")?;
    let pipe = child.stdin.take();

    let feed_stdin = async move {
        if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
            match pipe.write_all(input.as_bytes()).await {
                // The child exited without reading everything.
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {}
                other => other?,
            }
        }
        Ok::<(), std::io::Error>(())
    };
    let run = async {
        let (fed, output) = tokio::join!(feed_stdin, child.wait_with_output());
        fed.context("Failed to write command stdin")?;
        output.context("Failed to wait for command")
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(output) => {
            let output = output?;
            Ok(CommandRunResult {
                status: Some(output.status),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: false,
            })
        }
        // The child future is dropped here, and kill_on_drop reaps the process.
        Err(_) => Ok(CommandRunResult {
            status: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
        }),
    }
}

/// Write `content` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        let _ = fs::set_permissions(&tmp_path, perms);
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("Failed to replace {}", path.display()));
    }
    Ok(())
}

/// Move an unreadable file aside so the next write starts clean.
pub fn preserve_corrupt_file(path: &Path, content: &str) {
    let mut corrupt = path.as_os_str().to_owned();
    corrupt.push(".corrupt");
    let corrupt_path = std::path::PathBuf::from(corrupt);
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
