//! VNC-to-WebSocket display bridge.
//!
//! Browser viewers cannot speak raw VNC, so a `websockify` process forwards
//! a local WebSocket port to the emulator's VNC port. The bridge is tracked
//! (never daemonized) so its PID and recent output are available.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::config::BridgeConfig;
use crate::vm::probe::{self, KillOutcome};
use crate::vm::runner::{CommandSpec, ProcessHandle, ProcessRunner, RunnerError, SpawnMode};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("bridge failed to launch: {0}")]
    LaunchFailed(String),

    #[error("bridge exited early ({}): {output}", exit_label(.exit_code))]
    ExitedEarly {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("invalid viewer URL: {0}")]
    Endpoint(#[from] url::ParseError),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "signal".to_string(),
    }
}

/// Where a viewer connects.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DisplayEndpoint {
    pub host: String,
    pub listen_port: u16,
    pub target_port: u16,
    /// noVNC page served by the bridge.
    pub viewer_url: Url,
    pub websocket_url: Url,
}

impl DisplayEndpoint {
    pub fn new(host: &str, listen_port: u16, target_port: u16) -> Result<Self, BridgeError> {
        let mut viewer_url = Url::parse(&format!("http://{host}:{listen_port}/vnc.html"))?;
        viewer_url
            .query_pairs_mut()
            .append_pair("host", host)
            .append_pair("port", &listen_port.to_string());
        let websocket_url = Url::parse(&format!("ws://{host}:{listen_port}/websockify"))?;
        Ok(Self {
            host: host.to_string(),
            listen_port,
            target_port,
            viewer_url,
            websocket_url,
        })
    }
}

/// A running bridge, exclusively owned by the supervisor session.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    pub endpoint: DisplayEndpoint,
    process: ProcessHandle,
}

impl BridgeHandle {
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn recent_output(&self, n: usize) -> Vec<String> {
        self.process.recent_output(n)
    }
}

/// Starts and stops the bridge process.
pub struct DisplayBridge {
    runner: Arc<dyn ProcessRunner>,
    config: BridgeConfig,
    grace: Duration,
}

impl DisplayBridge {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: BridgeConfig, grace: Duration) -> Self {
        Self {
            runner,
            config,
            grace,
        }
    }

    pub fn listen_port(&self) -> u16 {
        self.config.listen_port
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// `websockify [--web <dir>] [extra..] <listen> <host>:<target>`
    pub fn command(&self, target_port: u16, listen_port: u16) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.config.binary);
        if let Some(web) = &self.config.web_dir {
            cmd = cmd.arg("--web").arg(web.to_string_lossy().into_owned());
        }
        cmd.args(self.config.extra_args.iter().cloned())
            .arg(listen_port.to_string())
            .arg(format!("{}:{}", self.config.host, target_port))
    }

    /// Process-table pattern for a bridge listening on `listen_port`.
    pub fn pattern(&self, listen_port: u16) -> String {
        let base = Path::new(&self.config.binary)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.config.binary.clone());
        format!("{base}.* {listen_port}( |$)")
    }

    pub fn endpoint(&self, target_port: u16, listen_port: u16) -> Result<DisplayEndpoint, BridgeError> {
        DisplayEndpoint::new(&self.config.host, listen_port, target_port)
    }

    /// Launch the bridge, wait the grace delay and confirm it is still up.
    pub async fn start(&self, target_port: u16, listen_port: u16) -> Result<BridgeHandle, BridgeError> {
        let endpoint = self.endpoint(target_port, listen_port)?;

        // A bridge left over from a previous session would hold the port.
        match probe::kill_matching(self.runner.as_ref(), &self.pattern(listen_port)).await {
            Ok(KillOutcome::Killed) => info!(listen_port, "killed leftover display bridge"),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "could not sweep leftover bridges"),
        }

        let cmd = self.command(target_port, listen_port);
        info!(command = %cmd, "starting display bridge");
        let process = self.runner.spawn(&cmd, SpawnMode::Tracked).await?;
        if !process.is_launched() {
            return Err(BridgeError::LaunchFailed(process.diagnostics()));
        }

        tokio::time::sleep(self.grace).await;

        for line in process.recent_output(10) {
            debug!(target: "desqemu::bridge", "{line}");
        }
        if let Some(exit_code) = process.exited() {
            return Err(BridgeError::ExitedEarly {
                exit_code,
                output: process.recent_output(20).join("\n"),
            });
        }

        info!(pid = ?process.pid(), url = %endpoint.viewer_url, "display bridge running");
        Ok(BridgeHandle { endpoint, process })
    }

    /// Kill the bridge by PID when known, and by pattern in any case.
    /// Idempotent: a bridge that is already gone is `NothingToKill`.
    pub async fn stop(&self, handle: Option<&BridgeHandle>) -> KillOutcome {
        let listen_port = handle
            .map(|h| h.endpoint.listen_port)
            .unwrap_or(self.config.listen_port);

        let mut outcome = KillOutcome::NothingToKill;
        if let Some(pid) = handle.and_then(BridgeHandle::pid) {
            // A reaped child has nothing left to signal.
            let reaped = handle.is_some_and(|h| h.process.exited().is_some());
            if !reaped {
                outcome = match probe::kill_pid(self.runner.as_ref(), pid).await {
                    Ok(o) => o,
                    Err(e) => KillOutcome::Failed(e.to_string()),
                };
            }
        }
        let swept = match probe::kill_matching(self.runner.as_ref(), &self.pattern(listen_port)).await {
            Ok(o) => o,
            Err(e) => KillOutcome::Failed(e.to_string()),
        };
        let outcome = outcome.merge(swept);
        match &outcome {
            KillOutcome::Killed => info!(listen_port, "display bridge stopped"),
            KillOutcome::NothingToKill => debug!(listen_port, "no display bridge running"),
            KillOutcome::Failed(e) => warn!(listen_port, error = %e, "failed to stop display bridge"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::runner::TokioProcessRunner;

    fn bridge(config: BridgeConfig) -> DisplayBridge {
        DisplayBridge::new(
            Arc::new(TokioProcessRunner::new()),
            config,
            Duration::from_millis(10),
        )
    }

    #[test]
    fn command_line() {
        let b = bridge(BridgeConfig::default());
        assert_eq!(
            b.command(5901, 6901).to_string(),
            "websockify 6901 localhost:5901"
        );

        let b = bridge(BridgeConfig {
            web_dir: Some("/usr/share/novnc".into()),
            ..BridgeConfig::default()
        });
        assert_eq!(
            b.command(5900, 6900).to_string(),
            "websockify --web /usr/share/novnc 6900 localhost:5900"
        );
    }

    #[test]
    fn endpoint_urls() {
        let ep = DisplayEndpoint::new("localhost", 6901, 5901).unwrap();
        assert_eq!(
            ep.viewer_url.as_str(),
            "http://localhost:6901/vnc.html?host=localhost&port=6901"
        );
        assert_eq!(ep.websocket_url.as_str(), "ws://localhost:6901/websockify");
    }

    #[test]
    fn pattern_targets_listen_port() {
        let b = bridge(BridgeConfig {
            binary: "/usr/bin/websockify".into(),
            ..BridgeConfig::default()
        });
        assert_eq!(b.pattern(6900), "websockify.* 6900( |$)");
    }

    #[test]
    fn exited_early_message() {
        let err = BridgeError::ExitedEarly {
            exit_code: Some(1),
            output: "Address already in use".into(),
        };
        assert_eq!(
            err.to_string(),
            "bridge exited early (exit code 1): Address already in use"
        );
    }
}
