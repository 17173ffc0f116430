//! Liveness probes and best-effort kills.
//!
//! A process handle's own view of its child is never trusted for liveness:
//! daemonized launches have no child at all. These helpers ask the OS
//! instead (process table, PID file, listening socket) and treat "nothing
//! to kill" as success so that teardown stays idempotent.

use std::path::Path;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::vm::runner::{CommandSpec, ProcessRunner, RunnerError};

/// Result of a kill request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillOutcome {
    Killed,
    /// No matching process existed. Counts as success.
    NothingToKill,
    /// The kill tool ran but reported a problem (e.g. permission denied).
    Failed(String),
}

impl KillOutcome {
    pub fn killed(&self) -> bool {
        matches!(self, KillOutcome::Killed)
    }

    /// Merge two outcomes for the same target, keeping the most informative.
    pub fn merge(self, other: KillOutcome) -> KillOutcome {
        match (self, other) {
            (KillOutcome::Killed, _) | (_, KillOutcome::Killed) => KillOutcome::Killed,
            (KillOutcome::Failed(e), _) | (_, KillOutcome::Failed(e)) => KillOutcome::Failed(e),
            _ => KillOutcome::NothingToKill,
        }
    }
}

fn parse_pids(stdout: &str) -> Vec<u32> {
    stdout
        .split_whitespace()
        .filter_map(|s| s.parse().ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Process table
// ---------------------------------------------------------------------------

/// PIDs whose full command line matches `pattern` (`pgrep -f`).
pub async fn pids_matching(
    runner: &dyn ProcessRunner,
    pattern: &str,
) -> Result<Vec<u32>, RunnerError> {
    let out = runner
        .run_sync(&CommandSpec::new("pgrep").arg("-f").arg(pattern))
        .await?;
    match out.exit_code {
        Some(0) => Ok(parse_pids(&out.stdout)),
        // 1 is "no match"; 2 (bad pattern) and 3 (fatal) say nothing about
        // the process table.
        Some(1) => Ok(Vec::new()),
        _ => Err(RunnerError::Failed {
            program: "pgrep".to_string(),
            detail: out.diagnostics(),
        }),
    }
}

/// True when at least one process matches `pattern`.
pub async fn process_running(
    runner: &dyn ProcessRunner,
    pattern: &str,
) -> Result<bool, RunnerError> {
    Ok(!pids_matching(runner, pattern).await?.is_empty())
}

/// Signal 0: true when `pid` exists and we may signal it.
pub async fn pid_alive(runner: &dyn ProcessRunner, pid: u32) -> Result<bool, RunnerError> {
    let out = runner
        .run_sync(&CommandSpec::new("kill").arg("-0").arg(pid.to_string()))
        .await?;
    Ok(out.success())
}

/// Emulator liveness: process-table scan, falling back to the PID file when
/// `pgrep` itself is unavailable.
pub async fn emulator_running(
    runner: &dyn ProcessRunner,
    signature: &str,
    pid_file: Option<&Path>,
) -> Result<bool, RunnerError> {
    match process_running(runner, signature).await {
        Ok(running) => Ok(running),
        Err(RunnerError::NotFound { .. }) => {
            let Some(pid) = (match pid_file {
                Some(path) => read_pid_file(path).await,
                None => None,
            }) else {
                debug!("pgrep unavailable and no PID recorded");
                return Ok(false);
            };
            pid_alive(runner, pid).await
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// PID files
// ---------------------------------------------------------------------------

/// Read a PID written by `-pidfile`. Missing or malformed files yield `None`.
pub async fn read_pid_file(path: &Path) -> Option<u32> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    contents.trim().parse().ok()
}

/// Poll for a PID file to appear.
pub async fn wait_for_pid_file(path: &Path, attempts: u32, delay: Duration) -> Option<u32> {
    for attempt in 0..attempts.max(1) {
        if let Some(pid) = read_pid_file(path).await {
            return Some(pid);
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    None
}

/// Remove a PID file, ignoring "already gone".
pub async fn remove_pid_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed PID file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove PID file"),
    }
}

// ---------------------------------------------------------------------------
// Kills
// ---------------------------------------------------------------------------

/// `pkill -f pattern`. Exit 1 means nothing matched.
pub async fn kill_matching(
    runner: &dyn ProcessRunner,
    pattern: &str,
) -> Result<KillOutcome, RunnerError> {
    let out = runner
        .run_sync(&CommandSpec::new("pkill").arg("-f").arg(pattern))
        .await?;
    Ok(match out.exit_code {
        Some(0) => KillOutcome::Killed,
        Some(1) => KillOutcome::NothingToKill,
        _ => KillOutcome::Failed(out.diagnostics()),
    })
}

/// `kill <pid>` (SIGTERM). A vanished process is "nothing to kill".
pub async fn kill_pid(runner: &dyn ProcessRunner, pid: u32) -> Result<KillOutcome, RunnerError> {
    let out = runner
        .run_sync(&CommandSpec::new("kill").arg(pid.to_string()))
        .await?;
    if out.success() {
        return Ok(KillOutcome::Killed);
    }
    let stderr = out.stderr.to_ascii_lowercase();
    if stderr.contains("no such process") || stderr.is_empty() {
        Ok(KillOutcome::NothingToKill)
    } else {
        Ok(KillOutcome::Failed(out.diagnostics()))
    }
}

/// PIDs holding `path` open (`lsof -t`).
pub async fn pids_holding(
    runner: &dyn ProcessRunner,
    path: &Path,
) -> Result<Vec<u32>, RunnerError> {
    let out = runner
        .run_sync(
            &CommandSpec::new("lsof")
                .arg("-t")
                .arg(path.to_string_lossy().into_owned()),
        )
        .await?;
    Ok(parse_pids(&out.stdout))
}

// ---------------------------------------------------------------------------
// Sockets
// ---------------------------------------------------------------------------

/// True when a TCP connection to `host:port` succeeds within `timeout`.
pub async fn port_listening(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Poll `host:port` up to `attempts` times, `delay` apart.
pub async fn wait_for_port(host: &str, port: u16, attempts: u32, delay: Duration) -> bool {
    let connect_timeout = delay.clamp(Duration::from_millis(50), Duration::from_secs(2));
    for attempt in 1..=attempts.max(1) {
        if port_listening(host, port, connect_timeout).await {
            debug!(host, port, attempt, "port is listening");
            return true;
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::runner::{CommandOutput, ProcessHandle, SpawnMode};

    /// Answers every command with the same output.
    struct FixedRunner(CommandOutput);

    #[async_trait::async_trait]
    impl ProcessRunner for FixedRunner {
        async fn run_sync(&self, _cmd: &CommandSpec) -> Result<CommandOutput, RunnerError> {
            Ok(self.0.clone())
        }

        async fn spawn(
            &self,
            cmd: &CommandSpec,
            _mode: SpawnMode,
        ) -> Result<ProcessHandle, RunnerError> {
            Err(RunnerError::NotFound {
                program: cmd.program.clone(),
            })
        }
    }

    #[tokio::test]
    async fn pgrep_exit_codes() {
        let found = FixedRunner(CommandOutput::ok("4242\n"));
        assert!(process_running(&found, "qemu").await.unwrap());

        let none = FixedRunner(CommandOutput::exit(1, ""));
        assert!(!process_running(&none, "qemu").await.unwrap());

        let bad_pattern = FixedRunner(CommandOutput::exit(2, "pgrep: invalid regex"));
        assert!(matches!(
            process_running(&bad_pattern, "qemu(").await,
            Err(RunnerError::Failed { .. })
        ));
        let fatal = FixedRunner(CommandOutput::exit(3, "pgrep: out of memory"));
        assert!(pids_matching(&fatal, "qemu").await.is_err());
    }

    #[tokio::test]
    async fn broken_pgrep_is_not_a_dead_emulator() {
        let runner = FixedRunner(CommandOutput::exit(3, "pgrep: fatal"));
        assert!(emulator_running(&runner, "qemu", None).await.is_err());
    }

    /// A real process whose command line names a VM that shares our prefix.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn signature_ignores_vm_with_longer_name() {
        use crate::vm::emulator::signature;
        use crate::vm::runner::TokioProcessRunner;

        let ours = format!("desqemu-sig-{}", std::process::id());
        let other = format!("{ours}-other");
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30; :", "qemu-system-x86_64", "-name", &other])
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let runner = TokioProcessRunner::new();
        let theirs = signature("qemu-system-x86_64", &other);
        let mut seen = false;
        for _ in 0..50 {
            if process_running(&runner, &theirs).await.unwrap() {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen, "{other} never showed up in the process table");

        let mine = signature("qemu-system-x86_64", &ours);
        assert!(!process_running(&runner, &mine).await.unwrap());
        assert_eq!(
            kill_matching(&runner, &mine).await.unwrap(),
            KillOutcome::NothingToKill
        );
        assert!(process_running(&runner, &theirs).await.unwrap());

        child.kill().await.unwrap();
    }

    #[test]
    fn parse_pids_skips_garbage() {
        assert_eq!(parse_pids("123\n456\nabc\n"), vec![123, 456]);
        assert!(parse_pids("").is_empty());
    }

    #[test]
    fn kill_outcome_merge_prefers_killed() {
        assert_eq!(
            KillOutcome::NothingToKill.merge(KillOutcome::Killed),
            KillOutcome::Killed
        );
        assert_eq!(
            KillOutcome::Failed("denied".into()).merge(KillOutcome::NothingToKill),
            KillOutcome::Failed("denied".into())
        );
        assert_eq!(
            KillOutcome::NothingToKill.merge(KillOutcome::NothingToKill),
            KillOutcome::NothingToKill
        );
    }

    #[tokio::test]
    async fn pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.pid");
        assert_eq!(read_pid_file(&path).await, None);

        tokio::fs::write(&path, "4321\n").await.unwrap();
        assert_eq!(read_pid_file(&path).await, Some(4321));

        remove_pid_file(&path).await;
        assert!(!path.exists());
        // Second removal is a no-op.
        remove_pid_file(&path).await;
    }

    #[tokio::test]
    async fn wait_for_port_sees_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(wait_for_port("127.0.0.1", port, 3, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn wait_for_port_gives_up() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!wait_for_port("127.0.0.1", port, 2, Duration::from_millis(10)).await);
    }
}
