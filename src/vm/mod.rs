//! VM lifecycle supervision for desqemu.
//!
//! Locates the disk image, launches the QEMU emulator, supervises the
//! VNC-to-WebSocket display bridge and reconciles recorded state against
//! the OS process table.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub mod bridge;
pub mod emulator;
pub mod image;
pub mod locator;
pub mod poller;
pub mod probe;
pub mod runner;
pub mod supervisor;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Observed lifecycle state of the guest VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// The last start failed fatally. Only `stop()` leaves this state.
    Error,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Stopped => "stopped",
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Stopping => "stopping",
            VmState::Error => "error",
        };
        f.write_str(s)
    }
}

/// How the guest display is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// A local window opened by the emulator itself.
    LocalFramebuffer,
    /// A VNC server on `port` (5900 + display number).
    NetworkVnc { port: u16, password: bool },
}

impl DisplayMode {
    pub fn vnc_port(&self) -> Option<u16> {
        match self {
            DisplayMode::NetworkVnc { port, .. } => Some(*port),
            DisplayMode::LocalFramebuffer => None,
        }
    }
}

/// Everything needed to launch the emulator once.
///
/// Built fresh for every launch attempt (the scratch-copy relaunch gets its
/// own) and never mutated after it is handed to the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// VM name, passed as `-name` and used in the process signature.
    pub name: String,
    pub image_path: PathBuf,
    pub image_format: image::ImageFormat,
    pub memory_mb: u32,
    pub cpu_count: u32,
    pub display_mode: DisplayMode,
    /// Host port -> guest port, user-mode networking.
    pub port_forwards: BTreeMap<u16, u16>,
    pub daemonize: bool,
    pub pid_file: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use bridge::{BridgeHandle, DisplayBridge, DisplayEndpoint};
pub use locator::{BaseDirs, Located, ResourceKind, ResourceLocator, ResourceSource};
pub use poller::{PollerHandle, spawn_status_poller};
pub use runner::{
    CommandOutput, CommandSpec, Launch, ProcessHandle, ProcessRunner, SpawnMode,
    TokioProcessRunner,
};
pub use supervisor::{
    EmulatorInfo, Reconciliation, StartReport, StopReport, VmStatus, VmSupervisor,
};
