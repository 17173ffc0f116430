//! desqemu: QEMU VM lifecycle supervisor.
//!
//! Locates a disk image, launches the emulator, exposes its display through
//! a VNC-to-WebSocket bridge and keeps the recorded VM state honest against
//! the OS process table. The desktop shell drives everything through
//! [`vm::VmSupervisor`].

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod paths;
pub mod state_machine;
pub mod vm;

pub use config::SupervisorConfig;
pub use error::{ErrorKind, Result, SupervisorError, TransientWarning};
pub use events::{LogEntry, LogLevel, SupervisorEvent};
pub use vm::{VmState, VmSupervisor};
