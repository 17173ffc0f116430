//! Error taxonomy for the supervisor.
//!
//! Fatal kinds abort the current lifecycle operation and move the VM into
//! `Error`. Transient kinds never surface as `Err`: they are collected as
//! [`TransientWarning`]s, logged, and the operation carries on.

use std::path::PathBuf;

use crate::vm::VmState;
use crate::vm::bridge::BridgeError;
use crate::vm::locator::LocateError;
use crate::vm::runner::RunnerError;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Coarse classification used by the GUI to pick a severity and message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ResourceNotFound,
    LaunchFailure,
    DependencyMissing,
    TransientWarning,
    /// The intent was not valid in the current state (or another one was running).
    Usage,
}

/// Errors returned by [`crate::vm::VmSupervisor`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// No candidate, archive or placeholder produced the artifact.
    #[error("{kind} not found (searched {} locations)", searched.len())]
    ResourceNotFound { kind: String, searched: Vec<PathBuf> },

    /// The emulator could not be started, even after the scratch-copy relaunch.
    #[error("emulator launch failed: {0}")]
    LaunchFailure(String),

    /// The emulator binary is absent from the system.
    #[error("emulator binary `{binary}` is not available. {hint}")]
    DependencyMissing { binary: String, hint: String },

    #[error("cannot {op} while the VM is {state}")]
    InvalidTransition { op: &'static str, state: VmState },

    /// Another start/stop/restart holds the lifecycle lock.
    #[error("another lifecycle operation is in progress")]
    Busy,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::ResourceNotFound { .. } => ErrorKind::ResourceNotFound,
            SupervisorError::LaunchFailure(_) => ErrorKind::LaunchFailure,
            SupervisorError::DependencyMissing { .. } => ErrorKind::DependencyMissing,
            SupervisorError::InvalidTransition { .. }
            | SupervisorError::Busy
            | SupervisorError::Config(_) => ErrorKind::Usage,
            SupervisorError::Runner(RunnerError::NotFound { .. }) => ErrorKind::DependencyMissing,
            SupervisorError::Runner(_) | SupervisorError::Io(_) => ErrorKind::LaunchFailure,
        }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        SupervisorError::Config(msg.into())
    }

    /// Create a launch failure.
    pub fn launch(msg: impl Into<String>) -> Self {
        SupervisorError::LaunchFailure(msg.into())
    }
}

impl From<LocateError> for SupervisorError {
    fn from(err: LocateError) -> Self {
        match err {
            LocateError::NotFound { kind, searched } => SupervisorError::ResourceNotFound {
                kind: kind.to_string(),
                searched,
            },
            LocateError::InvalidCandidates(msg) => SupervisorError::Config(msg),
            err @ LocateError::PlaceholderTooLarge(_) => SupervisorError::Config(err.to_string()),
            LocateError::Io(e) => SupervisorError::Io(e),
        }
    }
}

/// Non-fatal problems met during a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TransientWarning {
    /// Killing leftover emulator processes did not go cleanly.
    #[error("stale emulator cleanup: {0}")]
    StaleProcess(String),

    /// Detecting or clearing the disk image lock failed.
    #[error("image lock: {0}")]
    LockClear(String),

    #[error("display port {port} not reachable after {attempts} attempts")]
    LivenessProbe { port: u16, attempts: u32 },

    #[error("display bridge: {0}")]
    BridgeStart(String),

    /// The image came from a development placeholder, not a packaged artifact.
    #[error("using development placeholder {}", .0.display())]
    Placeholder(PathBuf),
}

impl From<BridgeError> for TransientWarning {
    fn from(err: BridgeError) -> Self {
        TransientWarning::BridgeStart(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_follow_taxonomy() {
        assert_eq!(
            SupervisorError::launch("boom").kind(),
            ErrorKind::LaunchFailure
        );
        assert_eq!(SupervisorError::Busy.kind(), ErrorKind::Usage);
        assert_eq!(
            SupervisorError::DependencyMissing {
                binary: "qemu-system-x86_64".into(),
                hint: String::new(),
            }
            .kind(),
            ErrorKind::DependencyMissing
        );
        assert_eq!(
            SupervisorError::Runner(RunnerError::NotFound {
                program: "pgrep".into()
            })
            .kind(),
            ErrorKind::DependencyMissing
        );
    }

    #[test]
    fn resource_not_found_counts_searched_paths() {
        let err = SupervisorError::ResourceNotFound {
            kind: "disk image".into(),
            searched: vec![PathBuf::from("/a"), PathBuf::from("/b")],
        };
        assert_eq!(err.to_string(), "disk image not found (searched 2 locations)");
    }

    #[test]
    fn invalid_transition_names_state() {
        let err = SupervisorError::InvalidTransition {
            op: "start",
            state: VmState::Running,
        };
        assert_eq!(err.to_string(), "cannot start while the VM is running");
    }

    #[test]
    fn liveness_warning_message() {
        let w = TransientWarning::LivenessProbe {
            port: 5901,
            attempts: 10,
        };
        assert_eq!(
            w.to_string(),
            "display port 5901 not reachable after 10 attempts"
        );
    }
}
