//! Agent Process Supervisor (C3).
//!
//! Launches the coding-agent CLI, streams its combined stdout+stderr to a
//! JSONL log on disk, enforces the dual no-output/hard watchdogs, and
//! retries with a continuation prompt up to a bounded attempt count.
//! stderr is drained on its own task so a child that only writes there can
//! never block its own pipe out from under a watchdog that only watched
//! stdout. Grounded on the teacher's `subprocess::runner::TokioProcessRunner`
//! for process spawning conventions, generalized here to a streaming read
//! loop since the supervisor needs to observe output as it arrives rather
//! than waiting for the child to exit.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CHUNK_SIZE: usize = 4096;
const EXCERPT_TAIL_CHARS: usize = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    None,
    NoOutput,
    Hard,
}

impl TimeoutKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeoutKind::None => "none",
            TimeoutKind::NoOutput => "no-output",
            TimeoutKind::Hard => "hard",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentRunConfig {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub model: String,
    pub ticket_id: String,
    pub binary_path: String,
    pub skip_git_repo_check: bool,
    pub log_root: PathBuf,
    pub no_output_timeout_ms: u64,
    pub hard_timeout_ms: u64,
    pub mcp_endpoint: Option<String>,
    pub max_attempts: u32,
    pub continuation_text: String,
}

impl Default for AgentRunConfig {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            working_dir: PathBuf::new(),
            model: String::new(),
            ticket_id: String::new(),
            binary_path: "codex".to_string(),
            skip_git_repo_check: false,
            log_root: PathBuf::from("/tmp/scriptorium/agents"),
            no_output_timeout_ms: 0,
            hard_timeout_ms: 0,
            mcp_endpoint: None,
            max_attempts: 1,
            continuation_text: "Continue from the previous attempt and complete the ticket."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub jsonl_log_path: PathBuf,
    pub last_message_path: PathBuf,
    pub last_message: String,
    pub timeout_kind: TimeoutKind,
}

impl AttemptOutcome {
    pub fn completed(&self) -> bool {
        self.exit_code == 0 && self.timeout_kind == TimeoutKind::None
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub outcome: AttemptOutcome,
    pub attempt_count: u32,
}

/// Maps arbitrary ticket ids to the `[A-Za-z0-9_-]` subset a filesystem path
/// and CLI arg can carry safely; empty input becomes `adhoc`.
pub fn sanitize_ticket_id(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "adhoc".to_string()
    } else {
        sanitized
    }
}

/// Builds the deterministic argv described in §4.3: config overrides first,
/// then the subcommand and its flags, then `-` for stdin.
fn build_args(config: &AgentRunConfig, last_message_path: &Path) -> Vec<String> {
    let mcp_servers_value = match &config.mcp_endpoint {
        None => "mcp_servers={}".to_string(),
        Some(endpoint) => format!(
            "mcp_servers={{scriptorium={{type=\"http\",url=\"{endpoint}/mcp\",enabled=true,required=true}}}}"
        ),
    };

    let mut args = vec![
        "-c".to_string(),
        "developer_instructions=".to_string(),
        "-c".to_string(),
        mcp_servers_value,
    ];

    args.push("exec".to_string());
    args.push("--json".to_string());
    args.push("--output-last-message".to_string());
    args.push(last_message_path.to_string_lossy().to_string());
    args.push("--cd".to_string());
    args.push(config.working_dir.to_string_lossy().to_string());
    args.push("--model".to_string());
    args.push(config.model.clone());
    args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
    if config.skip_git_repo_check {
        args.push("--skip-git-repo-check".to_string());
    }
    args.push("-".to_string());
    args
}

pub struct AgentSupervisor;

impl AgentSupervisor {
    /// Runs the agent CLI, retrying with a continuation prompt up to
    /// `config.max_attempts` times, until an attempt completes
    /// (`exit_code == 0 && timeout_kind == None`) or attempts are exhausted.
    pub async fn run(config: &AgentRunConfig) -> Result<RunOutcome> {
        if config.working_dir.as_os_str().is_empty() {
            return Err(Error::InvalidInput("agent working directory is required".into()));
        }
        if config.model.is_empty() {
            return Err(Error::InvalidInput("agent model is required".into()));
        }

        let max_attempts = config.max_attempts.max(1);
        let mut prompt = config.prompt.clone();
        let mut last_outcome = None;

        for attempt in 1..=max_attempts {
            let outcome = Self::run_attempt(config, &prompt, attempt).await?;
            let completed = outcome.completed();
            last_outcome = Some(outcome.clone());

            if completed || attempt == max_attempts {
                return Ok(RunOutcome {
                    outcome,
                    attempt_count: attempt,
                });
            }

            prompt = build_continuation_prompt(&config.prompt, attempt, &outcome, &config.continuation_text);
        }

        // unreachable given max_attempts >= 1, but keep the type honest
        Ok(RunOutcome {
            outcome: last_outcome.expect("at least one attempt always runs"),
            attempt_count: max_attempts,
        })
    }

    async fn run_attempt(config: &AgentRunConfig, prompt: &str, attempt: u32) -> Result<AttemptOutcome> {
        let sanitized_id = sanitize_ticket_id(&config.ticket_id);
        let ticket_dir = config.log_root.join(&sanitized_id);
        std::fs::create_dir_all(&ticket_dir)?;

        let jsonl_log_path = ticket_dir.join(format!("attempt-{attempt:02}.jsonl"));
        let last_message_path = ticket_dir.join(format!("attempt-{attempt:02}.last_message.txt"));

        let args = build_args(config, &last_message_path);
        debug!(binary = %config.binary_path, ?args, "spawning agent attempt");

        let mut cmd = Command::new(&config.binary_path);
        cmd.args(&args).current_dir(&config.working_dir);

        Self::run_child(cmd, prompt, config, &jsonl_log_path, &last_message_path).await
    }

    /// Spawns `cmd` with piped stdio, feeds it `prompt` on stdin, and drives
    /// it through the dual-watchdog poll loop. Split out from `run_attempt`
    /// so the watchdog logic can be exercised directly against an arbitrary
    /// child process rather than only through the agent CLI's argv shape.
    async fn run_child(
        mut cmd: Command,
        prompt: &str,
        config: &AgentRunConfig,
        jsonl_log_path: &Path,
        last_message_path: &Path,
    ) -> Result<AttemptOutcome> {
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(Error::Io)?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(prompt.as_bytes()).await.map_err(Error::Io)?;
            stdin.shutdown().await.map_err(Error::Io)?;
        }

        let mut stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let jsonl_file = tokio::fs::File::create(jsonl_log_path).await.map_err(Error::Io)?;
        let jsonl_file = Arc::new(tokio::sync::Mutex::new(jsonl_file));

        // A verbose agent that only writes to stderr would otherwise fill
        // the OS pipe buffer and block without either watchdog noticing
        // (both only watched stdout). Drain stderr on its own task so it
        // can never stall the stdout poll loop below, and fold its activity
        // into the same no-output clock.
        let last_output_time = Arc::new(Mutex::new(Instant::now()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_task = tokio::spawn(drain_stderr(
            stderr,
            Arc::clone(&jsonl_file),
            Arc::clone(&last_output_time),
            Arc::clone(&stderr_buf),
        ));

        let start = Instant::now();
        let mut stdout_buf = Vec::new();
        let mut timeout_kind = TimeoutKind::None;
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            if config.hard_timeout_ms > 0 && start.elapsed().as_millis() as u64 >= config.hard_timeout_ms {
                timeout_kind = TimeoutKind::Hard;
                let _ = child.kill().await;
                break;
            }
            let idle_for = last_output_time.lock().expect("last_output_time poisoned").elapsed();
            if config.no_output_timeout_ms > 0 && idle_for.as_millis() as u64 >= config.no_output_timeout_ms {
                timeout_kind = TimeoutKind::NoOutput;
                let _ = child.kill().await;
                break;
            }

            let read = tokio::time::timeout(POLL_INTERVAL, stdout.read(&mut buf)).await;
            match read {
                Ok(Ok(0)) => {
                    // EOF: child closed stdout. Confirm it has actually
                    // exited before declaring the stream done.
                    if child.try_wait().map_err(Error::Io)?.is_some() {
                        break;
                    }
                }
                Ok(Ok(n)) => {
                    use tokio::io::AsyncWriteExt;
                    stdout_buf.extend_from_slice(&buf[..n]);
                    jsonl_file.lock().await.write_all(&buf[..n]).await.map_err(Error::Io)?;
                    *last_output_time.lock().expect("last_output_time poisoned") = Instant::now();
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => {
                    stderr_task.abort();
                    return Err(Error::Io(e));
                }
                Err(_elapsed) => {
                    // Poll timeout: no data this tick. If the child already
                    // exited and the pipe is drained, stop polling.
                    if child.try_wait().map_err(Error::Io)?.is_some() {
                        break;
                    }
                }
            }
        }

        let status = match child.try_wait().map_err(Error::Io)? {
            Some(status) => status,
            None => child.wait().await.map_err(Error::Io)?,
        };
        let exit_code = status.code().unwrap_or(1);

        let _ = tokio::time::timeout(POLL_INTERVAL, stderr_task).await;
        stdout_buf.extend_from_slice(&stderr_buf.lock().expect("stderr_buf poisoned"));

        let last_message = tokio::fs::read_to_string(last_message_path)
            .await
            .unwrap_or_default();

        if timeout_kind != TimeoutKind::None {
            warn!(kind = timeout_kind.as_str(), "agent attempt timed out");
        }

        Ok(AttemptOutcome {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout_buf).to_string(),
            jsonl_log_path: jsonl_log_path.to_path_buf(),
            last_message_path: last_message_path.to_path_buf(),
            last_message,
            timeout_kind,
        })
    }
}

/// Reads `stderr` to EOF, appending each chunk to the combined JSONL log and
/// to `buf`, and bumping `last_output_time` on every read so the no-output
/// watchdog sees stderr-only activity too. Runs on its own task so a child
/// that only writes to stderr can never stall the stdout poll loop.
async fn drain_stderr(
    mut stderr: tokio::process::ChildStderr,
    jsonl_file: Arc<tokio::sync::Mutex<tokio::fs::File>>,
    last_output_time: Arc<Mutex<Instant>>,
    buf: Arc<Mutex<Vec<u8>>>,
) {
    use tokio::io::AsyncWriteExt;
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buf.lock().expect("stderr_buf poisoned").extend_from_slice(&chunk[..n]);
                if jsonl_file.lock().await.write_all(&chunk[..n]).await.is_err() {
                    break;
                }
                *last_output_time.lock().expect("last_output_time poisoned") = Instant::now();
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn build_continuation_prompt(
    original_prompt: &str,
    attempt: u32,
    outcome: &AttemptOutcome,
    continuation_text: &str,
) -> String {
    let excerpt_source = if outcome.last_message.trim().is_empty() {
        &outcome.stdout
    } else {
        &outcome.last_message
    };
    let excerpt = tail_chars(excerpt_source, EXCERPT_TAIL_CHARS);

    format!(
        "{original_prompt}\n\nAttempt {attempt} failed with exit code {} (timeout: {}).\nLast output excerpt:\n{excerpt}\n\n{continuation_text}\n",
        outcome.exit_code,
        outcome.timeout_kind.as_str(),
    )
}

fn tail_chars(s: &str, n: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= n {
        s.to_string()
    } else {
        s.chars().skip(char_count - n).collect()
    }
}

/// Env vars the supervisor is expected to carry unconditionally (none are
/// required by the core today, but maps stay available for harness-specific
/// extensions — see [`crate::harness`]).
pub type AgentEnv = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_maps_disallowed_characters() {
        assert_eq!(sanitize_ticket_id("0001-first"), "0001-first");
        assert_eq!(sanitize_ticket_id("a/b c"), "a-b-c");
        assert_eq!(sanitize_ticket_id(""), "adhoc");
    }

    #[test]
    fn continuation_prompt_includes_required_fields() {
        let outcome = AttemptOutcome {
            exit_code: 2,
            stdout: "some long stdout".to_string(),
            jsonl_log_path: PathBuf::new(),
            last_message_path: PathBuf::new(),
            last_message: String::new(),
            timeout_kind: TimeoutKind::Hard,
        };
        let prompt = build_continuation_prompt("do the thing", 1, &outcome, "keep going");
        assert!(prompt.starts_with("do the thing\n\n"));
        assert!(prompt.contains("Attempt 1 failed with exit code 2 (timeout: hard)."));
        assert!(prompt.contains("Last output excerpt:"));
        assert!(prompt.contains("some long stdout"));
        assert!(prompt.ends_with("keep going\n"));
    }

    #[test]
    fn tail_chars_truncates_from_the_end() {
        let s = "a".repeat(2000);
        let tail = tail_chars(&s, 1200);
        assert_eq!(tail.len(), 1200);
    }

    #[tokio::test]
    async fn run_rejects_missing_working_dir() {
        let config = AgentRunConfig {
            model: "codex-mini".to_string(),
            ..Default::default()
        };
        let result = AgentSupervisor::run(&config).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    fn sh_config(hard_timeout_ms: u64, no_output_timeout_ms: u64) -> (tempfile::TempDir, AgentRunConfig) {
        let log_root = tempfile::tempdir().unwrap();
        let config = AgentRunConfig {
            working_dir: std::env::temp_dir(),
            model: "codex-mini".to_string(),
            ticket_id: "0001".to_string(),
            log_root: log_root.path().to_path_buf(),
            hard_timeout_ms,
            no_output_timeout_ms,
            ..Default::default()
        };
        (log_root, config)
    }

    #[tokio::test]
    async fn hard_timeout_kills_a_child_that_never_stops_talking() {
        let (_log_root, config) = sh_config(300, 0);
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "while true; do echo tick; sleep 0.05; done"]);
        let outcome = AgentSupervisor::run_child(
            cmd,
            "",
            &config,
            &config.log_root.join("attempt.jsonl"),
            &config.log_root.join("attempt.last_message.txt"),
        )
        .await
        .unwrap();
        assert_eq!(outcome.timeout_kind, TimeoutKind::Hard);
        assert!(outcome.stdout.contains("tick"));
    }

    #[tokio::test]
    async fn no_output_timeout_kills_a_child_that_goes_quiet() {
        let (_log_root, config) = sh_config(0, 200);
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello; sleep 5"]);
        let outcome = AgentSupervisor::run_child(
            cmd,
            "",
            &config,
            &config.log_root.join("attempt.jsonl"),
            &config.log_root.join("attempt.last_message.txt"),
        )
        .await
        .unwrap();
        assert_eq!(outcome.timeout_kind, TimeoutKind::NoOutput);
        assert!(outcome.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn stderr_only_output_still_satisfies_the_no_output_watchdog() {
        // A child that writes solely to stderr must not trip the no-output
        // watchdog as long as stderr keeps arriving — the drain task feeds
        // the same activity clock the stdout loop watches.
        let (_log_root, config) = sh_config(0, 150);
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "for i in 1 2 3 4 5; do echo quiet >&2; sleep 0.05; done"]);
        let outcome = AgentSupervisor::run_child(
            cmd,
            "",
            &config,
            &config.log_root.join("attempt.jsonl"),
            &config.log_root.join("attempt.last_message.txt"),
        )
        .await
        .unwrap();
        assert_eq!(outcome.timeout_kind, TimeoutKind::None);
        assert_eq!(outcome.exit_code, 0);
        let logged = std::fs::read_to_string(config.log_root.join("attempt.jsonl")).unwrap();
        assert!(logged.contains("quiet"));
    }
}
