//! Bounded subprocess execution with pagination and spill.
//!
//! The executor owns the full child lifecycle: spawn with a filtered
//! environment, stream stdout/stderr under a memory cap (mirroring to spill
//! files when requested), enforce the timeout with a hard kill, and cut the
//! requested byte page out of whatever was captured.

mod buffer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::command::{StrippedCommand, WrapperParse};
use crate::page::Cursor;
use crate::spill::{SpillSink, SpillStore, read_range};
use buffer::TailBuffer;

/// What to do when a stream outgrows the page budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnLargeOutput {
    /// Mirror the full stream to a spill file and paginate over it.
    #[default]
    Spill,
    /// Keep only the page and mark the response truncated.
    Truncate,
    /// Fail the call with the observed totals.
    Error,
}

/// A fully-resolved execution: what to spawn and under which budgets.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    pub cursor_offset: u64,
    pub limit_bytes: u64,
    pub limit_lines: u64,
    pub max_output_bytes: u64,
    pub on_large_output: OnLargeOutput,
}

/// What one execution produced, already cut to the requested page.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub signal: Option<String>,
    pub duration_ms: u64,
    pub stdout_chunk: String,
    pub stderr_chunk: String,
    pub bytes_start: u64,
    pub bytes_end: u64,
    pub total_bytes: u64,
    pub stderr_total_bytes: u64,
    pub truncated: bool,
    pub next_cursor: Option<Cursor>,
    pub spill_uri: Option<String>,
    pub stderr_spill_uri: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("Output too large: {bytes} bytes, {lines} lines. Use pagination or spill mode.")]
    OutputTooLarge { bytes: u64, lines: u64 },
}

/// Spawns children and serves pages of their output.
#[derive(Debug)]
pub struct Executor {
    spill: SpillStore,
}

impl Executor {
    pub fn new(spill: SpillStore) -> Self {
        Self { spill }
    }

    pub fn spill(&self) -> &SpillStore {
        &self.spill
    }

    /// Run the request to completion and cut the page.
    ///
    /// Spawn failures and timeouts are not errors at this level: they come
    /// back as an outcome with `exit_code = -1` (and the kill signal for
    /// timeouts) so the caller always gets a structured result. The only
    /// `Err` is the `on_large_output = "error"` budget breach.
    pub async fn execute(&self, req: ExecRequest) -> Result<ExecOutcome, ExecError> {
        let started = Instant::now();
        let mem_cap = req.limit_bytes.saturating_mul(2).max(req.max_output_bytes) as usize;

        let spill_handle = match req.on_large_output {
            OnLargeOutput::Spill => Some(self.spill.new_handle()),
            _ => None,
        };

        let mut command = Command::new(&req.program);
        command
            .args(&req.args)
            .current_dir(&req.cwd)
            .env_clear()
            .envs(&req.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(program = %req.program, %err, "failed to spawn child");
                return Ok(failure_outcome(started));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (out_sink, err_sink) = match &spill_handle {
            Some(handle) => (
                Some(SpillSink::new(handle.stdout_path.clone())),
                Some(SpillSink::new(handle.stderr_path.clone())),
            ),
            None => (None, None),
        };

        let out_task = tokio::spawn(async move {
            match stdout {
                Some(reader) => drain_stream(reader, mem_cap, out_sink).await,
                None => StreamCapture::empty(),
            }
        });
        let err_task = tokio::spawn(async move {
            match stderr {
                Some(reader) => drain_stream(reader, mem_cap, err_sink).await,
                None => StreamCapture::empty(),
            }
        });

        let mut timed_out = false;
        let status = match tokio::time::timeout(req.timeout, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(err)) => {
                warn!(%err, "error collecting child exit status");
                None
            }
            Err(_) => {
                timed_out = true;
                debug!(timeout_ms = req.timeout.as_millis() as u64, "child timed out; killing");
                if let Err(err) = child.start_kill() {
                    warn!(%err, "failed to kill timed-out child");
                }
                match child.wait().await {
                    Ok(status) => Some(status),
                    Err(err) => {
                        warn!(%err, "error collecting killed child");
                        None
                    }
                }
            }
        };

        let stdout_capture = out_task.await.unwrap_or_else(|err| {
            warn!(%err, "stdout capture task failed");
            StreamCapture::empty()
        });
        let stderr_capture = err_task.await.unwrap_or_else(|err| {
            warn!(%err, "stderr capture task failed");
            StreamCapture::empty()
        });

        let (exit_code, signal) = exit_status_parts(status, timed_out);

        let stdout_lines = stdout_capture.line_total();
        if req.on_large_output == OnLargeOutput::Error
            && (stdout_capture.total > req.limit_bytes || stdout_lines > req.limit_lines)
        {
            if let Some(handle) = &spill_handle {
                self.spill.remove(&handle.stdout_path).await;
                self.spill.remove(&handle.stderr_path).await;
            }
            return Err(ExecError::OutputTooLarge {
                bytes: stdout_capture.total,
                lines: stdout_lines,
            });
        }
        let truncated = req.on_large_output == OnLargeOutput::Truncate
            && (stdout_capture.total > req.limit_bytes || stdout_lines > req.limit_lines);

        // Stdout page.
        let total_bytes = stdout_capture.total;
        let bytes_start = req.cursor_offset.min(total_bytes);
        let mut bytes_end = bytes_start.saturating_add(req.limit_bytes).min(total_bytes);

        let from_spill = match &stdout_capture.spill_path {
            Some(path) => match read_range(path, bytes_start, bytes_end).await {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    warn!(path = %path.display(), %err, "spill read failed; serving from memory");
                    None
                }
            },
            None => None,
        };
        let stdout_bytes = match from_spill {
            Some(bytes) => bytes,
            None => match stdout_capture.buffer.slice(bytes_start, bytes_end) {
                Some(bytes) => bytes,
                None => {
                    // The cursor points at bytes already discarded from the
                    // window and there is no spill file to consult. Make no
                    // progress; the caller should switch to spill mode.
                    bytes_end = bytes_start;
                    Vec::new()
                }
            },
        };

        let next_cursor = if !truncated && bytes_end < total_bytes {
            Some(Cursor::bytes(bytes_end))
        } else {
            None
        };

        // Stderr page: always from the start of the stream.
        let stderr_end = req.max_output_bytes.min(stderr_capture.total);
        let stderr_bytes = match &stderr_capture.spill_path {
            Some(path) => read_range(path, 0, stderr_end).await.unwrap_or_default(),
            None => stderr_capture
                .buffer
                .slice(0, stderr_end)
                .unwrap_or_default(),
        };

        let mut spill_uri = None;
        let mut stderr_spill_uri = None;
        if let Some(handle) = spill_handle {
            let keep = next_cursor.is_some();
            if stdout_capture.spill_path.is_some() {
                if keep {
                    spill_uri = Some(handle.stdout_uri.clone());
                } else {
                    self.spill.remove(&handle.stdout_path).await;
                }
            }
            if stderr_capture.spill_path.is_some() {
                if keep {
                    stderr_spill_uri = Some(handle.stderr_uri.clone());
                } else {
                    self.spill.remove(&handle.stderr_path).await;
                }
            }
        }

        Ok(ExecOutcome {
            exit_code,
            signal,
            duration_ms: started.elapsed().as_millis() as u64,
            stdout_chunk: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr_chunk: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            bytes_start,
            bytes_end,
            total_bytes,
            stderr_total_bytes: stderr_capture.total,
            truncated,
            next_cursor,
            spill_uri,
            stderr_spill_uri,
        })
    }
}

fn failure_outcome(started: Instant) -> ExecOutcome {
    ExecOutcome {
        exit_code: -1,
        signal: None,
        duration_ms: started.elapsed().as_millis() as u64,
        stdout_chunk: String::new(),
        stderr_chunk: String::new(),
        bytes_start: 0,
        bytes_end: 0,
        total_bytes: 0,
        stderr_total_bytes: 0,
        truncated: false,
        next_cursor: None,
        spill_uri: None,
        stderr_spill_uri: None,
    }
}

fn exit_status_parts(
    status: Option<std::process::ExitStatus>,
    timed_out: bool,
) -> (i32, Option<String>) {
    match status {
        Some(status) => {
            #[cfg(unix)]
            let raw_signal = status.signal();
            #[cfg(not(unix))]
            let raw_signal: Option<i32> = None;

            let mut signal = raw_signal.map(signal_name);
            if timed_out && signal.is_none() {
                signal = Some("SIGKILL".to_string());
            }
            (status.code().unwrap_or(-1), signal)
        }
        None => (-1, timed_out.then(|| "SIGKILL".to_string())),
    }
}

fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        3 => "SIGQUIT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        13 => "SIGPIPE".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("SIG{other}"),
    }
}

#[derive(Debug)]
struct StreamCapture {
    buffer: TailBuffer,
    total: u64,
    newline_count: u64,
    ends_with_newline: bool,
    spill_path: Option<PathBuf>,
}

impl StreamCapture {
    fn empty() -> Self {
        Self {
            buffer: TailBuffer::new(0),
            total: 0,
            newline_count: 0,
            ends_with_newline: false,
            spill_path: None,
        }
    }

    /// LF-delimited line total, counting an unterminated trailing segment.
    fn line_total(&self) -> u64 {
        if self.total == 0 {
            0
        } else if self.ends_with_newline {
            self.newline_count
        } else {
            self.newline_count + 1
        }
    }
}

async fn drain_stream<R>(mut reader: R, mem_cap: usize, sink: Option<SpillSink>) -> StreamCapture
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut capture = StreamCapture {
        buffer: TailBuffer::new(mem_cap),
        total: 0,
        newline_count: 0,
        ends_with_newline: false,
        spill_path: None,
    };
    let mut sink = sink;
    let mut buf = [0u8; 8192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                capture.total += n as u64;
                capture.newline_count += chunk.iter().filter(|b| **b == b'\n').count() as u64;
                capture.ends_with_newline = chunk[n - 1] == b'\n';
                capture.buffer.push_chunk(chunk);
                if let Some(sink) = sink.as_mut() {
                    sink.append(chunk).await;
                }
            }
            Err(err) => {
                warn!(%err, "error reading child stream");
                break;
            }
        }
    }

    capture.spill_path = match sink {
        Some(sink) => sink.finish().await,
        None => None,
    };
    capture
}

/// Compute the effective timeout: `timeout_seconds` wins over the legacy
/// `timeout_ms`, both clamped to their documented ranges and capped at the
/// policy ceiling.
pub fn effective_timeout_ms(
    timeout_seconds: Option<u64>,
    timeout_ms: Option<u64>,
    policy_ceiling_ms: u64,
) -> u64 {
    if let Some(seconds) = timeout_seconds {
        (seconds.clamp(1, 300) * 1000).min(policy_ceiling_ms)
    } else if let Some(ms) = timeout_ms {
        ms.clamp(1, 300_000).min(policy_ceiling_ms)
    } else {
        policy_ceiling_ms
    }
}

/// Compute the effective per-stream byte cap, clamped and ceiling-capped.
pub fn effective_max_output_bytes(requested: Option<u64>, policy_ceiling: u64) -> u64 {
    match requested {
        Some(bytes) => bytes.clamp(1_000, 10_000_000).min(policy_ceiling),
        None => policy_ceiling,
    }
}

/// Child environment: allowlisted parent variables, overridden by the
/// request's `KEY=value` prefix assignments.
pub fn build_child_env(
    allowlist: &[String],
    assignments: &[crate::command::EnvAssignment],
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for name in allowlist {
        if let Ok(value) = std::env::var(name) {
            env.insert(name.clone(), value);
        }
    }
    for assignment in assignments {
        env.insert(assignment.name.clone(), assignment.value.clone());
    }
    env
}

/// Turn a normalized invocation into the argv to spawn.
///
/// Wrappers respawn as `/bin/bash` or `/bin/sh` with the user's flags, `-l`
/// for login mode, the strict flags, `-c`, the command string (env prefixes
/// prepended so the shell performs the assignments), and any trailing
/// positional parameters. Direct commands spawn as given.
pub fn assemble_command(
    stripped: &StrippedCommand,
    wrapper: &WrapperParse,
) -> (String, Vec<String>) {
    let (true, Some(shell), Some(command_string)) = (
        wrapper.is_wrapper,
        wrapper.shell,
        wrapper.command_string.as_deref(),
    ) else {
        return (stripped.cmd.clone(), stripped.args.clone());
    };

    let mut args = wrapper.flags_before_command.clone();
    if wrapper.should_use_login {
        args.push("-l".to_string());
    }
    args.extend(shell.strict_flags().iter().map(|s| s.to_string()));
    args.push("-c".to_string());

    let mut effective = String::new();
    for assignment in &stripped.env_vars {
        effective.push_str(&assignment.to_token());
        effective.push(' ');
    }
    effective.push_str(command_string);
    args.push(effective);

    if let Some(index) = wrapper.args_after_command {
        args.extend(stripped.args.iter().skip(index).cloned());
    }

    (shell.program().to_string(), args)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::command::{parse_wrapper, strip_env_prefix};
    use tempfile::TempDir;

    fn executor() -> (TempDir, Executor) {
        let dir = TempDir::new().unwrap();
        let store = SpillStore::with_dir(dir.path().to_path_buf());
        (dir, Executor::new(store))
    }

    fn request(program: &str, args: &[&str]) -> ExecRequest {
        ExecRequest {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            timeout: Duration::from_secs(10),
            cursor_offset: 0,
            limit_bytes: 40_000,
            limit_lines: 2_000,
            max_output_bytes: 10_000_000,
            on_large_output: OnLargeOutput::Spill,
        }
    }

    // Emits 100000 bytes of stdout (10000 lines of "123456789\n").
    const BIG_OUTPUT: &str = "i=0; while [ $i -lt 10000 ]; do echo 123456789; i=$((i+1)); done";

    #[tokio::test]
    async fn test_simple_capture() {
        let (_dir, executor) = executor();
        let outcome = executor
            .execute(request("/bin/sh", &["-c", "echo hello"]))
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.signal.is_none());
        assert_eq!(outcome.stdout_chunk, "hello\n");
        assert_eq!(outcome.bytes_start, 0);
        assert_eq!(outcome.bytes_end, 6);
        assert_eq!(outcome.total_bytes, 6);
        assert!(outcome.next_cursor.is_none());
        assert!(outcome.spill_uri.is_none());
        assert!(!outcome.truncated);
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let (_dir, executor) = executor();
        let outcome = executor
            .execute(request("/bin/sh", &["-c", "exit 3"]))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
    }

    #[tokio::test]
    async fn test_stderr_is_captured_separately() {
        let (_dir, executor) = executor();
        let outcome = executor
            .execute(request("/bin/sh", &["-c", "echo out; echo err >&2"]))
            .await
            .unwrap();

        assert_eq!(outcome.stdout_chunk, "out\n");
        assert_eq!(outcome.stderr_chunk, "err\n");
        assert_eq!(outcome.stderr_total_bytes, 4);
    }

    #[tokio::test]
    async fn test_env_is_exactly_what_was_passed() {
        let (_dir, executor) = executor();
        let mut req = request("/bin/sh", &["-c", "echo ${FOO:-unset}"]);
        req.env.insert("FOO".to_string(), "bar".to_string());
        let outcome = executor.execute(req).await.unwrap();
        assert_eq!(outcome.stdout_chunk, "bar\n");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_structured_result() {
        let (_dir, executor) = executor();
        let outcome = executor
            .execute(request("/definitely/not/a/binary", &[]))
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.signal.is_none());
        assert_eq!(outcome.total_bytes, 0);
        assert!(outcome.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports_signal() {
        let (_dir, executor) = executor();
        let mut req = request("/bin/sh", &["-c", "sleep 30"]);
        req.timeout = Duration::from_millis(200);

        let started = Instant::now();
        let outcome = executor.execute(req).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(outcome.exit_code != 0);
        assert_eq!(outcome.signal.as_deref(), Some("SIGKILL"));
    }

    #[tokio::test]
    async fn test_pagination_with_spill() {
        let (_dir, executor) = executor();

        // First page.
        let outcome = executor
            .execute(request("/bin/sh", &["-c", BIG_OUTPUT]))
            .await
            .unwrap();
        assert_eq!(outcome.total_bytes, 100_000);
        assert_eq!(outcome.bytes_start, 0);
        assert_eq!(outcome.bytes_end, 40_000);
        assert_eq!(outcome.stdout_chunk.len(), 40_000);
        assert_eq!(outcome.next_cursor, Some(Cursor::bytes(40_000)));
        let uri = outcome.spill_uri.expect("spill uri for large output");
        let path = executor.spill().resolve_uri(&uri).unwrap();
        assert!(path.exists());

        // Last page of a fresh execution.
        let mut req = request("/bin/sh", &["-c", BIG_OUTPUT]);
        req.cursor_offset = 80_000;
        let outcome = executor.execute(req).await.unwrap();
        assert_eq!(outcome.bytes_start, 80_000);
        assert_eq!(outcome.bytes_end, 100_000);
        assert!(outcome.next_cursor.is_none());
        // Fully-consumed spill is deleted and its URI withheld.
        assert!(outcome.spill_uri.is_none());
    }

    #[tokio::test]
    async fn test_truncate_mode_sets_flag_and_drops_cursor() {
        let (_dir, executor) = executor();
        let mut req = request("/bin/sh", &["-c", BIG_OUTPUT]);
        req.on_large_output = OnLargeOutput::Truncate;
        let outcome = executor.execute(req).await.unwrap();

        assert!(outcome.truncated);
        assert!(outcome.next_cursor.is_none());
        assert!(outcome.spill_uri.is_none());
        assert_eq!(outcome.bytes_end, 40_000);
    }

    #[tokio::test]
    async fn test_error_mode_fails_with_totals() {
        let (_dir, executor) = executor();
        let mut req = request("/bin/sh", &["-c", BIG_OUTPUT]);
        req.on_large_output = OnLargeOutput::Error;
        let err = executor.execute(req).await.unwrap_err();

        assert_eq!(
            err,
            ExecError::OutputTooLarge {
                bytes: 100_000,
                lines: 10_000
            }
        );
        assert!(err.to_string().contains("100000 bytes"));
        assert!(err.to_string().contains("Use pagination or spill mode."));
    }

    #[tokio::test]
    async fn test_out_of_window_cursor_without_spill_makes_no_progress() {
        let (_dir, executor) = executor();
        let mut req = request("/bin/sh", &["-c", BIG_OUTPUT]);
        req.on_large_output = OnLargeOutput::Truncate;
        req.limit_bytes = 100;
        req.limit_lines = 100_000;
        req.max_output_bytes = 1_000;
        req.cursor_offset = 10;
        let outcome = executor.execute(req).await.unwrap();

        // 100000 bytes flowed through a 1000-byte window; offset 10 is gone.
        assert_eq!(outcome.bytes_start, 10);
        assert_eq!(outcome.bytes_end, 10);
        assert_eq!(outcome.stdout_chunk, "");
    }

    // ==================== Effective Limit Tests ====================

    #[test]
    fn test_effective_timeout_prefers_seconds() {
        assert_eq!(effective_timeout_ms(Some(5), Some(1), 300_000), 5_000);
        assert_eq!(effective_timeout_ms(None, Some(2_500), 300_000), 2_500);
        assert_eq!(effective_timeout_ms(None, None, 120_000), 120_000);
    }

    #[test]
    fn test_effective_timeout_clamps_then_caps() {
        assert_eq!(effective_timeout_ms(Some(0), None, 300_000), 1_000);
        assert_eq!(effective_timeout_ms(Some(10_000), None, 300_000), 300_000);
        assert_eq!(effective_timeout_ms(Some(300), None, 60_000), 60_000);
        assert_eq!(effective_timeout_ms(None, Some(900_000), 300_000), 300_000);
        assert_eq!(effective_timeout_ms(None, Some(0), 300_000), 1);
    }

    #[test]
    fn test_effective_max_output_bytes() {
        assert_eq!(effective_max_output_bytes(None, 5_000_000), 5_000_000);
        assert_eq!(effective_max_output_bytes(Some(10), 5_000_000), 1_000);
        assert_eq!(
            effective_max_output_bytes(Some(99_000_000), 5_000_000),
            5_000_000
        );
        assert_eq!(effective_max_output_bytes(Some(2_000), 5_000_000), 2_000);
    }

    // ==================== Assembly Tests ====================

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_assemble_direct_command() {
        let stripped = strip_env_prefix("git", &strings(&["status"])).unwrap();
        let wrapper = parse_wrapper(&stripped.cmd, &stripped.args).unwrap();
        let (program, args) = assemble_command(&stripped, &wrapper);

        assert_eq!(program, "git");
        assert_eq!(args, strings(&["status"]));
    }

    #[test]
    fn test_assemble_bash_wrapper_has_strict_flags() {
        let stripped = strip_env_prefix("bash", &strings(&["-lc", "echo hi"])).unwrap();
        let wrapper = parse_wrapper(&stripped.cmd, &stripped.args).unwrap();
        let (program, args) = assemble_command(&stripped, &wrapper);

        assert_eq!(program, "/bin/bash");
        assert_eq!(
            args,
            strings(&["-l", "-o", "pipefail", "-o", "errexit", "-c", "echo hi"])
        );
    }

    #[test]
    fn test_assemble_sh_wrapper_omits_pipefail() {
        let stripped = strip_env_prefix("sh", &strings(&["-c", "echo hi"])).unwrap();
        let wrapper = parse_wrapper(&stripped.cmd, &stripped.args).unwrap();
        let (program, args) = assemble_command(&stripped, &wrapper);

        assert_eq!(program, "/bin/sh");
        assert_eq!(args, strings(&["-e", "-c", "echo hi"]));
        assert!(!args.iter().any(|a| a.contains("pipefail")));
    }

    #[test]
    fn test_assemble_prepends_env_prefix_to_command_string() {
        let stripped =
            strip_env_prefix("FOO=bar", &strings(&["bash", "-c", "echo $FOO"])).unwrap();
        let wrapper = parse_wrapper(&stripped.cmd, &stripped.args).unwrap();
        let (program, args) = assemble_command(&stripped, &wrapper);

        assert_eq!(program, "/bin/bash");
        assert_eq!(
            args,
            strings(&["-o", "pipefail", "-o", "errexit", "-c", "FOO=bar echo $FOO"])
        );
    }

    #[test]
    fn test_assemble_keeps_trailing_positional_args() {
        let stripped = strip_env_prefix(
            "bash",
            &strings(&["-c", "echo \"$@\"", "--", "a b", "c"]),
        )
        .unwrap();
        let wrapper = parse_wrapper(&stripped.cmd, &stripped.args).unwrap();
        let (_, args) = assemble_command(&stripped, &wrapper);

        assert_eq!(
            args,
            strings(&["-o", "pipefail", "-o", "errexit", "-c", "echo \"$@\"", "--", "a b", "c"])
        );
    }

    #[test]
    fn test_assemble_shifts_trailing_args_past_env_prefix() {
        // The env token shifts the arg array by one; index bookkeeping must
        // still find the positional parameters.
        let stripped = strip_env_prefix(
            "FOO=bar",
            &strings(&["sh", "-c", "echo \"$@\"", "--", "x"]),
        )
        .unwrap();
        let wrapper = parse_wrapper(&stripped.cmd, &stripped.args).unwrap();
        let (_, args) = assemble_command(&stripped, &wrapper);

        assert_eq!(
            args,
            strings(&["-e", "-c", "FOO=bar echo \"$@\"", "--", "x"])
        );
    }

    #[test]
    fn test_build_child_env_intersects_allowlist() {
        std::env::set_var("SHEMCP_TEST_PRESENT", "yes");
        let allowlist = strings(&["SHEMCP_TEST_PRESENT", "SHEMCP_TEST_ABSENT"]);
        let assignments = vec![crate::command::EnvAssignment {
            name: "EXTRA".to_string(),
            value: "1".to_string(),
        }];

        let env = build_child_env(&allowlist, &assignments);
        assert_eq!(env.get("SHEMCP_TEST_PRESENT").map(String::as_str), Some("yes"));
        assert!(!env.contains_key("SHEMCP_TEST_ABSENT"));
        assert_eq!(env.get("EXTRA").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_assignment_overrides_allowlisted_value() {
        std::env::set_var("SHEMCP_TEST_OVERRIDE", "parent");
        let allowlist = strings(&["SHEMCP_TEST_OVERRIDE"]);
        let assignments = vec![crate::command::EnvAssignment {
            name: "SHEMCP_TEST_OVERRIDE".to_string(),
            value: "child".to_string(),
        }];

        let env = build_child_env(&allowlist, &assignments);
        assert_eq!(
            env.get("SHEMCP_TEST_OVERRIDE").map(String::as_str),
            Some("child")
        );
    }
}
