//! Execution engine.
//!
//! Runs one resolved invocation as a child process, enforces its timeout,
//! persists the captured streams and folds the outcome into a [`RunResult`].
//! A child that runs but misbehaves is a `fail` result, never an error.

use crate::report::ResultSink;
use crate::resolver::{ResolveContext, SpecError, resolve};
use crate::schema::{
    ExpectationDescriptor, InvocationDescriptor, RunResult, Status, TIMEOUT_EXIT_CODE,
};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Interval between `try_wait` polls while a child is running.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Error type for failures that prevent a case from being characterized.
#[derive(Debug)]
pub enum ExecError {
    /// The program could not be started.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Waiting on the child failed.
    Wait(std::io::Error),
    /// A log file could not be written.
    Log {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::Spawn { program, source } => write!(f, "failed to spawn {program}: {source}"),
            ExecError::Wait(e) => write!(f, "failed to wait for child: {e}"),
            ExecError::Log { path, source } => {
                write!(f, "failed to write log {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecError::Spawn { source, .. } | ExecError::Log { source, .. } => Some(source),
            ExecError::Wait(e) => Some(e),
        }
    }
}

/// Any hard error for a single case: a broken spec or a broken setup.
#[derive(Debug)]
pub enum CaseError {
    Spec(SpecError),
    Exec(ExecError),
}

impl std::fmt::Display for CaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaseError::Spec(e) => write!(f, "{e}"),
            CaseError::Exec(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CaseError {}

impl From<SpecError> for CaseError {
    fn from(e: SpecError) -> Self {
        CaseError::Spec(e)
    }
}

impl From<ExecError> for CaseError {
    fn from(e: ExecError) -> Self {
        CaseError::Exec(e)
    }
}

/// Resolve, execute and record one case.
///
/// The result is appended to `sink` before it is returned.
pub fn run_case(
    script: &str,
    case: &str,
    raw: &Value,
    ctx: &ResolveContext,
    output_root: &Path,
    sink: &ResultSink,
) -> Result<RunResult, CaseError> {
    let (invocation, expectation) = resolve(script, case, raw, ctx)?;
    let result = execute(script, case, &invocation, &expectation, output_root)?;
    sink.push(result.clone());
    Ok(result)
}

/// Deterministic log locations for a case.
///
/// `<output_root>/logs/<script>[.<case>].stdout.txt` and the `.stderr.txt`
/// sibling. An empty case name adds no suffix.
pub fn log_paths(output_root: &Path, script: &str, case: &str) -> (PathBuf, PathBuf) {
    let logs = output_root.join("logs");
    let stem = if case.is_empty() {
        script.to_string()
    } else {
        format!("{script}.{case}")
    };
    (
        logs.join(format!("{stem}.stdout.txt")),
        logs.join(format!("{stem}.stderr.txt")),
    )
}

fn write_log(path: &Path, contents: &str) -> Result<(), ExecError> {
    let log_err = |source| ExecError::Log {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(log_err)?;
    }
    std::fs::write(path, contents).map_err(log_err)
}

fn write_logs(
    output_root: &Path,
    script: &str,
    case: &str,
    stdout: &str,
    stderr: &str,
) -> Result<(PathBuf, PathBuf), ExecError> {
    let (stdout_path, stderr_path) = log_paths(output_root, script, case);
    write_log(&stdout_path, stdout)?;
    write_log(&stderr_path, stderr)?;
    Ok((stdout_path, stderr_path))
}

/// Execute a resolved invocation and evaluate it.
///
/// Writes exactly two log files. Timeouts and expectation mismatches come
/// back as `fail` results; only spawn, wait and log-write failures are errors.
pub fn execute(
    script: &str,
    case: &str,
    invocation: &InvocationDescriptor,
    expectation: &ExpectationDescriptor,
    output_root: &Path,
) -> Result<RunResult, ExecError> {
    let start = Instant::now();
    let outcome = run_command(invocation)?;
    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    let result = match outcome {
        Outcome::TimedOut => {
            warn!(script, case, timeout_secs = invocation.timeout_secs, "case timed out");
            let (stdout_path, stderr_path) = write_logs(output_root, script, case, "", "")?;
            RunResult {
                script: script.to_string(),
                case: case.to_string(),
                argv: invocation.argv.clone(),
                exit_code: TIMEOUT_EXIT_CODE,
                duration_ms,
                stdout_path,
                stderr_path,
                status: Status::Fail,
                note: Some(format!("timeout after {}s", invocation.timeout_secs)),
            }
        }
        Outcome::Completed(output) => {
            let (stdout_path, stderr_path) =
                write_logs(output_root, script, case, &output.stdout, &output.stderr)?;
            let (status, note) = evaluate(expectation, &output);
            RunResult {
                script: script.to_string(),
                case: case.to_string(),
                argv: invocation.argv.clone(),
                exit_code: output.exit_code,
                duration_ms,
                stdout_path,
                stderr_path,
                status,
                note,
            }
        }
    };

    debug!(stdout = %result.stdout_path.display(), stderr = %result.stderr_path.display(), "wrote logs");
    info!(
        script,
        case,
        status = %result.status,
        exit_code = result.exit_code,
        duration_ms,
        "case finished"
    );
    Ok(result)
}

/// Captured output of a child that ran to completion.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

enum Outcome {
    Completed(CommandOutput),
    TimedOut,
}

/// Check every expectation against a completed run.
///
/// All three checks always run so the note lists every violation.
pub fn evaluate(
    expectation: &ExpectationDescriptor,
    output: &CommandOutput,
) -> (Status, Option<String>) {
    let mut violations = Vec::new();

    if !expectation.exit_codes.contains(&output.exit_code) {
        violations.push(format!(
            "exit={} expected={:?}",
            output.exit_code, expectation.exit_codes
        ));
    }

    if let Some(re) = &expectation.stdout_regex
        && !re.is_match(&output.stdout)
    {
        violations.push("stdout_regex_mismatch".to_string());
    }

    if let Some(re) = &expectation.stderr_regex
        && !re.is_match(&output.stderr)
    {
        violations.push("stderr_regex_mismatch".to_string());
    }

    if violations.is_empty() {
        (Status::Pass, None)
    } else {
        (Status::Fail, Some(violations.join("; ")))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<Vec<u8>>> {
    pipe.map(|mut pipe| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
        rx
    })
}

/// Wait for a drained stream until `deadline`.
///
/// `None` means the pipe was still open at the deadline, which happens when
/// a grandchild inherited it and outlived the child.
fn collect(rx: Option<Receiver<Vec<u8>>>, deadline: Option<Instant>) -> Option<String> {
    let Some(rx) = rx else {
        return Some(String::new());
    };
    let received = match deadline {
        Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };
    match received {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(String::new()),
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    // Same convention as the shell for signal deaths.
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn run_command(invocation: &InvocationDescriptor) -> Result<Outcome, ExecError> {
    let (program, args) = invocation
        .argv
        .split_first()
        .ok_or_else(|| ExecError::Spawn {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
        })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&invocation.working_directory)
        .env_clear()
        .envs(&invocation.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: program.clone(),
        source,
    })?;

    // Drain both pipes concurrently so a chatty child never blocks on a
    // full pipe while we poll.
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    // Timeouts too large for a Duration (or an Instant) never expire.
    let timeout = Duration::try_from_secs_f64(invocation.timeout_secs).unwrap_or(Duration::MAX);
    let deadline = Instant::now().checked_add(timeout);
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = collect(stdout, deadline);
                let stderr = collect(stderr, deadline);
                let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
                    // Grandchildren still hold the pipes; their reader
                    // threads are left to finish on their own.
                    debug!("output pipes still open at deadline");
                    return Ok(Outcome::TimedOut);
                };
                return Ok(Outcome::Completed(CommandOutput {
                    exit_code: exit_code_of(status),
                    stdout,
                    stderr,
                }));
            }
            Ok(None) => {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    kill_and_reap(&mut child);
                    return Ok(Outcome::TimedOut);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(ExecError::Wait(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::compile_optional_regex;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn invocation(dir: &Path, argv: &[&str], timeout_secs: f64) -> InvocationDescriptor {
        let mut environment = BTreeMap::new();
        if let Ok(path) = std::env::var("PATH") {
            environment.insert("PATH".to_string(), path);
        }
        InvocationDescriptor {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            working_directory: dir.to_path_buf(),
            environment,
            timeout_secs,
        }
    }

    fn output(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    fn expect_stdout(pattern: &str) -> ExpectationDescriptor {
        ExpectationDescriptor {
            stdout_regex: compile_optional_regex(pattern).unwrap(),
            ..ExpectationDescriptor::default()
        }
    }

    // ==================== Evaluation ====================

    #[test]
    fn evaluate_pass_has_no_note() {
        let (status, note) = evaluate(&ExpectationDescriptor::default(), &output(0, "", ""));
        assert_eq!(status, Status::Pass);
        assert!(note.is_none());
    }

    #[test]
    fn evaluate_reports_every_violation() {
        let mut exp = expect_stdout("^READY$");
        exp.stderr_regex = compile_optional_regex("warn").unwrap();
        let (status, note) = evaluate(&exp, &output(1, "booting\n", ""));
        assert_eq!(status, Status::Fail);
        assert_eq!(
            note.as_deref(),
            Some("exit=1 expected=[0]; stdout_regex_mismatch; stderr_regex_mismatch")
        );
    }

    #[test]
    fn evaluate_lists_expected_codes() {
        let exp = ExpectationDescriptor {
            exit_codes: vec![0, 2],
            ..ExpectationDescriptor::default()
        };
        let (_, note) = evaluate(&exp, &output(3, "", ""));
        assert_eq!(note.as_deref(), Some("exit=3 expected=[0, 2]"));
        assert_eq!(evaluate(&exp, &output(2, "", "")).0, Status::Pass);
    }

    #[test]
    fn evaluate_regex_searches_per_line() {
        let exp = expect_stdout("^READY$");
        assert_eq!(evaluate(&exp, &output(0, "a\nREADY\nb\n", "")).0, Status::Pass);
    }

    #[test]
    fn absent_pattern_does_not_require_empty_stream() {
        let (status, _) = evaluate(
            &ExpectationDescriptor::default(),
            &output(0, "noise", "more noise"),
        );
        assert_eq!(status, Status::Pass);
    }

    // ==================== Log Paths ====================

    #[test]
    fn log_paths_with_and_without_case() {
        let root = Path::new("/out");
        let (out, err) = log_paths(root, "bin/tool.sh", "help");
        assert_eq!(out, PathBuf::from("/out/logs/bin/tool.sh.help.stdout.txt"));
        assert_eq!(err, PathBuf::from("/out/logs/bin/tool.sh.help.stderr.txt"));
        let (out, _) = log_paths(root, "tool", "");
        assert_eq!(out, PathBuf::from("/out/logs/tool.stdout.txt"));
    }

    // ==================== Execution ====================

    #[test]
    fn execute_captures_and_persists_streams() {
        let dir = TempDir::new().unwrap();
        let inv = invocation(dir.path(), &["sh", "-c", "echo out; echo err >&2"], 5.0);
        let result = execute("tool", "c", &inv, &ExpectationDescriptor::default(), dir.path()).unwrap();
        assert!(result.passed(), "note: {:?}", result.note);
        assert_eq!(result.exit_code, 0);
        assert_eq!(std::fs::read_to_string(&result.stdout_path).unwrap(), "out\n");
        assert_eq!(std::fs::read_to_string(&result.stderr_path).unwrap(), "err\n");
    }

    #[test]
    fn execute_writes_logs_on_failure() {
        let dir = TempDir::new().unwrap();
        let inv = invocation(dir.path(), &["sh", "-c", "echo booting; exit 1"], 5.0);
        let result = execute("tool", "c", &inv, &expect_stdout("^READY$"), dir.path()).unwrap();
        assert_eq!(result.status, Status::Fail);
        let note = result.note.unwrap();
        assert!(note.contains("exit=1 expected=[0]"));
        assert!(note.contains("stdout_regex_mismatch"));
        assert_eq!(std::fs::read_to_string(&result.stdout_path).unwrap(), "booting\n");
    }

    #[test]
    fn execute_timeout_yields_124_and_empty_logs() {
        let dir = TempDir::new().unwrap();
        let inv = invocation(dir.path(), &["sleep", "2"], 0.1);
        let result = execute("tool", "slow", &inv, &ExpectationDescriptor::default(), dir.path()).unwrap();
        assert_eq!(result.status, Status::Fail);
        assert_eq!(result.exit_code, 124);
        assert_eq!(result.note.as_deref(), Some("timeout after 0.1s"));
        assert!(result.duration_ms < 2000);
        assert_eq!(std::fs::read_to_string(&result.stdout_path).unwrap(), "");
        assert_eq!(std::fs::read_to_string(&result.stderr_path).unwrap(), "");
    }

    #[cfg(unix)]
    #[test]
    fn execute_timeout_covers_background_pipe_holders() {
        let dir = TempDir::new().unwrap();
        let inv = invocation(dir.path(), &["sh", "-c", "sleep 3 & echo started"], 0.5);
        let start = Instant::now();
        let result = execute("tool", "bg", &inv, &ExpectationDescriptor::default(), dir.path()).unwrap();
        assert!(start.elapsed() < Duration::from_millis(2500), "took {:?}", start.elapsed());
        assert_eq!(result.status, Status::Fail);
        assert_eq!(result.exit_code, 124);
        assert_eq!(result.note.as_deref(), Some("timeout after 0.5s"));
        assert_eq!(std::fs::read_to_string(&result.stdout_path).unwrap(), "");
    }

    #[test]
    fn execute_huge_timeout_never_expires() {
        let dir = TempDir::new().unwrap();
        let inv = invocation(dir.path(), &["sh", "-c", "sleep 0.2; echo ok"], 1e20);
        let result = execute("tool", "huge", &inv, &expect_stdout("^ok$"), dir.path()).unwrap();
        assert!(result.passed(), "note: {:?}", result.note);
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn execute_uses_only_the_given_environment() {
        let dir = TempDir::new().unwrap();
        let mut inv = invocation(dir.path(), &["sh", "-c", "echo \"[$SMOKE_A][$HOME]\""], 5.0);
        inv.environment.insert("SMOKE_A".to_string(), "a".to_string());
        let result = execute("tool", "env", &inv, &expect_stdout(r"^\[a\]\[\]$"), dir.path()).unwrap();
        assert!(result.passed(), "note: {:?}", result.note);
    }

    #[test]
    fn execute_runs_in_working_directory() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::write(work.join("marker"), "").unwrap();
        let inv = invocation(&work, &["ls"], 5.0);
        let result = execute("tool", "cwd", &inv, &expect_stdout("^marker$"), dir.path()).unwrap();
        assert!(result.passed(), "note: {:?}", result.note);
    }

    #[test]
    fn execute_spawn_failure_is_an_error() {
        let dir = TempDir::new().unwrap();
        let inv = invocation(dir.path(), &["definitely-not-a-real-binary-xyz"], 5.0);
        let err = execute("tool", "c", &inv, &ExpectationDescriptor::default(), dir.path()).unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn signal_death_maps_to_shell_convention() {
        let dir = TempDir::new().unwrap();
        let inv = invocation(dir.path(), &["sh", "-c", "kill -9 $$"], 5.0);
        let result = execute("tool", "sig", &inv, &ExpectationDescriptor::default(), dir.path()).unwrap();
        assert_eq!(result.exit_code, 137);
        assert_eq!(result.note.as_deref(), Some("exit=137 expected=[0]"));
    }

    #[test]
    fn repeated_runs_are_identical_apart_from_duration() {
        let dir = TempDir::new().unwrap();
        let inv = invocation(dir.path(), &["sh", "-c", "echo hi; exit 3"], 5.0);
        let exp = ExpectationDescriptor::default();
        let first = execute("tool", "c", &inv, &exp, dir.path()).unwrap();
        let mut second = execute("tool", "c", &inv, &exp, dir.path()).unwrap();
        second.duration_ms = first.duration_ms;
        assert_eq!(first, second);
    }

    // ==================== Full Case ====================

    #[cfg(unix)]
    #[test]
    fn run_case_resolves_executes_and_records() {
        let repo = TempDir::new().unwrap();
        std::fs::write(
            repo.path().join("hello.sh"),
            "#!/usr/bin/env -S sh -eu\necho \"hello $1\"\n",
        )
        .unwrap();
        let ctx = ResolveContext::new(repo.path(), crate::env::baseline_env(&BTreeMap::new()));
        let sink = ResultSink::new();
        let raw = json!({"args": ["world"], "expect": {"stdout_regex": "^hello world$"}});
        let out = repo.path().join("out");
        let result = run_case("hello.sh", "greet", &raw, &ctx, &out, &sink).unwrap();
        assert!(result.passed(), "note: {:?}", result.note);
        assert_eq!(result.argv[0], "sh");
        assert_eq!(result.argv[1], "-eu");
        assert!(result.stdout_path.ends_with("logs/hello.sh.greet.stdout.txt"));
        assert_eq!(sink.snapshot(), vec![result]);
    }

    #[test]
    fn run_case_spec_error_records_nothing() {
        let repo = TempDir::new().unwrap();
        std::fs::write(repo.path().join("t"), "#!/bin/sh\n").unwrap();
        let ctx = ResolveContext::new(repo.path(), BTreeMap::new());
        let sink = ResultSink::new();
        let raw = json!({"args": ["a"], "command": ["echo"]});
        let err = run_case("t", "c", &raw, &ctx, repo.path(), &sink).unwrap_err();
        assert!(matches!(err, CaseError::Spec(SpecError::Shape { .. })));
        assert!(sink.snapshot().is_empty());
        assert!(!repo.path().join("logs").exists());
    }
}
