//! External process execution.
//!
//! Everything the supervisor does to the outside world goes through the
//! [`ProcessRunner`] trait, so lifecycle logic can be driven by a scripted
//! runner in tests and by [`TokioProcessRunner`] in production.
//!
//! A non-zero exit code is never an error at this layer. Callers interpret
//! exit codes in context (`pkill` returning 1 means "nothing matched", not
//! "failed"). Only the inability to invoke a program at all is reported as
//! [`RunnerError`].

use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

/// How many output lines a tracked process keeps for diagnostics.
pub const DEFAULT_TAIL_LINES: usize = 200;

// ---------------------------------------------------------------------------
// Commands and results
// ---------------------------------------------------------------------------

/// A program plus its argument vector. No shell is involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// True when the argument vector contains `needle` verbatim.
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a command run to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Run that exited with `code` and printed `stderr`.
    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Short human-readable summary: trimmed stderr, or the exit code.
    pub fn diagnostics(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Transport-level failure: the OS could not run the program at all.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("`{program}` not found")]
    NotFound { program: String },

    #[error("failed to run `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran but reported that it could not do its job (as
    /// opposed to a negative answer). Raised by callers that know the
    /// program's exit-code conventions.
    #[error("`{program}` failed: {detail}")]
    Failed { program: String, detail: String },
}

impl RunnerError {
    fn from_io(program: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            RunnerError::NotFound {
                program: program.to_string(),
            }
        } else {
            RunnerError::Io {
                program: program.to_string(),
                source: err,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Process handles
// ---------------------------------------------------------------------------

/// How a long-running process should be launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// The program forks itself into the background and the foreground
    /// invocation exits. Run to completion; the PID is not known afterwards.
    Daemonizing,
    /// Keep the child attached, record its PID and reap it in the background.
    Tracked,
}

/// Outcome of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// Launched and the PID is known.
    Pid(u32),
    /// Launched but the PID is unknown. Liveness must come from an external
    /// probe (process table scan or PID file).
    Detached,
    /// The launch command itself reported failure.
    Failed,
}

/// Bounded buffer of a tracked process' recent output plus its exit status.
#[derive(Debug, Clone)]
pub struct OutputTail {
    inner: Arc<Mutex<TailInner>>,
}

#[derive(Debug)]
struct TailInner {
    lines: VecDeque<String>,
    capacity: usize,
    exited: Option<Option<i32>>,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TailInner {
                lines: VecDeque::with_capacity(capacity.min(64)),
                capacity: capacity.max(1),
                exited: None,
            })),
        }
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut TailInner) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn push(&self, line: impl Into<String>) {
        let line = line.into();
        self.with_inner(|t| {
            if t.lines.len() == t.capacity {
                t.lines.pop_front();
            }
            t.lines.push_back(line);
        });
    }

    /// Record that the process has been reaped.
    pub fn finish(&self, exit_code: Option<i32>) {
        self.with_inner(|t| t.exited = Some(exit_code));
    }

    /// `Some(code)` once the process has exited (`code` is `None` for a signal).
    pub fn exit_status(&self) -> Option<Option<i32>> {
        self.with_inner(|t| t.exited)
    }

    /// The last `n` lines, oldest first.
    pub fn recent(&self, n: usize) -> Vec<String> {
        self.with_inner(|t| {
            let skip = t.lines.len().saturating_sub(n);
            t.lines.iter().skip(skip).cloned().collect()
        })
    }
}

/// Handle to a launched process, exclusively owned by whoever launched it.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub launch: Launch,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    tail: Option<OutputTail>,
}

impl ProcessHandle {
    /// A child that is still attached and being reaped in the background.
    pub fn tracked(pid: u32, tail: OutputTail) -> Self {
        Self {
            launch: Launch::Pid(pid),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            tail: Some(tail),
        }
    }

    /// A daemonizing launch whose foreground invocation succeeded.
    pub fn detached(output: CommandOutput) -> Self {
        Self {
            launch: Launch::Detached,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            tail: None,
        }
    }

    pub fn failed(output: CommandOutput) -> Self {
        Self {
            launch: Launch::Failed,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            tail: None,
        }
    }

    /// Record a PID learned from an external probe (e.g. a PID file).
    pub fn with_pid(mut self, pid: u32) -> Self {
        if self.launch == Launch::Detached {
            self.launch = Launch::Pid(pid);
        }
        self
    }

    pub fn pid(&self) -> Option<u32> {
        match self.launch {
            Launch::Pid(pid) => Some(pid),
            Launch::Detached | Launch::Failed => None,
        }
    }

    pub fn is_launched(&self) -> bool {
        self.launch != Launch::Failed
    }

    /// Exit status of a tracked child, if it has already been reaped.
    pub fn exited(&self) -> Option<Option<i32>> {
        self.tail.as_ref().and_then(OutputTail::exit_status)
    }

    /// Recent output lines for diagnostics.
    pub fn recent_output(&self, n: usize) -> Vec<String> {
        if let Some(tail) = &self.tail {
            return tail.recent(n);
        }
        let lines: Vec<String> = self
            .stdout
            .lines()
            .chain(self.stderr.lines())
            .map(str::to_string)
            .collect();
        let skip = lines.len().saturating_sub(n);
        lines.into_iter().skip(skip).collect()
    }

    /// Short summary of why a launch failed.
    pub fn diagnostics(&self) -> String {
        let recent = self.recent_output(5);
        if let Some(last) = recent.iter().rev().find(|l| !l.trim().is_empty()) {
            return last.trim().to_string();
        }
        match self.exited().flatten().or(self.exit_code) {
            Some(code) => format!("exit code {code}"),
            None => "no output".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner trait and tokio implementation
// ---------------------------------------------------------------------------

/// Executes external programs.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion and capture output. Used for short-lived checks.
    async fn run_sync(&self, cmd: &CommandSpec) -> Result<CommandOutput, RunnerError>;

    /// Launch a long-running process and return without waiting for it.
    async fn spawn(&self, cmd: &CommandSpec, mode: SpawnMode)
    -> Result<ProcessHandle, RunnerError>;
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    tail_lines: usize,
}

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn build_command(spec: &CommandSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    cmd.stdin(Stdio::null());
    cmd
}

async fn pump_lines<R>(reader: R, tail: OutputTail)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tail.push(line);
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run_sync(&self, cmd: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        debug!(command = %cmd, "run");
        let output = build_command(cmd)
            .output()
            .await
            .map_err(|e| RunnerError::from_io(&cmd.program, e))?;
        Ok(CommandOutput::from(output))
    }

    async fn spawn(
        &self,
        cmd: &CommandSpec,
        mode: SpawnMode,
    ) -> Result<ProcessHandle, RunnerError> {
        match mode {
            SpawnMode::Daemonizing => {
                let output = self.run_sync(cmd).await?;
                if output.success() {
                    Ok(ProcessHandle::detached(output))
                } else {
                    Ok(ProcessHandle::failed(output))
                }
            }
            SpawnMode::Tracked => {
                debug!(command = %cmd, "spawn");
                let mut command = build_command(cmd);
                command.stdout(Stdio::piped());
                command.stderr(Stdio::piped());

                let mut child = command
                    .spawn()
                    .map_err(|e| RunnerError::from_io(&cmd.program, e))?;

                let tail = OutputTail::new(self.tail_lines);
                if let Some(stdout) = child.stdout.take() {
                    tokio::spawn(pump_lines(stdout, tail.clone()));
                }
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(pump_lines(stderr, tail.clone()));
                }

                let Some(pid) = child.id() else {
                    let status = child.wait().await.ok().and_then(|s| s.code());
                    return Ok(ProcessHandle::failed(CommandOutput {
                        exit_code: status,
                        ..CommandOutput::default()
                    }));
                };

                let reaper_tail = tail.clone();
                let program = cmd.program.clone();
                tokio::spawn(async move {
                    let code = child.wait().await.ok().and_then(|s| s.code());
                    debug!(%program, pid, exit_code = ?code, "child reaped");
                    reaper_tail.finish(code);
                });

                Ok(ProcessHandle::tracked(pid, tail))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_display_quotes_whitespace() {
        let cmd = CommandSpec::new("pkill")
            .arg("-f")
            .arg("qemu-system-x86_64.*-name desqemu");
        assert_eq!(cmd.to_string(), "pkill -f 'qemu-system-x86_64.*-name desqemu'");
    }

    #[test]
    fn output_tail_is_bounded() {
        let tail = OutputTail::new(3);
        for i in 0..5 {
            tail.push(format!("line {i}"));
        }
        assert_eq!(tail.recent(10), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(tail.recent(1), vec!["line 4"]);
        assert_eq!(tail.exit_status(), None);
        tail.finish(Some(1));
        assert_eq!(tail.exit_status(), Some(Some(1)));
    }

    #[test]
    fn detached_handle_learns_pid() {
        let handle = ProcessHandle::detached(CommandOutput::ok(""));
        assert_eq!(handle.pid(), None);
        assert!(handle.is_launched());
        let handle = handle.with_pid(4242);
        assert_eq!(handle.launch, Launch::Pid(4242));
    }

    #[test]
    fn failed_handle_never_gains_pid() {
        let handle = ProcessHandle::failed(CommandOutput::exit(1, "could not open disk"));
        assert!(!handle.is_launched());
        assert_eq!(handle.with_pid(7).pid(), None);
    }

    #[test]
    fn diagnostics_prefers_stderr() {
        let handle = ProcessHandle::failed(CommandOutput::exit(1, "  Failed to get write lock \n"));
        assert_eq!(handle.diagnostics(), "Failed to get write lock");
        let handle = ProcessHandle::failed(CommandOutput::exit(3, ""));
        assert_eq!(handle.diagnostics(), "exit code 3");
    }

    #[tokio::test]
    async fn run_sync_reports_missing_program() {
        let runner = TokioProcessRunner::new();
        let err = runner
            .run_sync(&CommandSpec::new("desqemu-definitely-not-a-real-binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NotFound { .. }), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_sync_captures_nonzero_exit() {
        let runner = TokioProcessRunner::new();
        let out = runner
            .run_sync(&CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .expect("sh should run");
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tracked_spawn_records_output_and_exit() {
        let runner = TokioProcessRunner::new();
        let handle = runner
            .spawn(
                &CommandSpec::new("sh").args(["-c", "echo hello; exit 0"]),
                SpawnMode::Tracked,
            )
            .await
            .expect("sh should spawn");
        assert!(handle.pid().is_some());

        for _ in 0..100 {
            if handle.exited().is_some() && !handle.recent_output(5).is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(handle.exited(), Some(Some(0)));
        assert_eq!(handle.recent_output(5), vec!["hello"]);
    }
}
