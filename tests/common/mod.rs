//! Shared fixtures for the supervisor tests.
//!
//! `ScriptedRunner` stands in for the OS: it answers `pgrep`, `pkill`,
//! `kill`, `qemu-img`, `lsof` and the emulator/bridge launches from a small
//! amount of shared state, so lifecycle logic can be exercised without QEMU.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use desqemu::config::{LocatorConfig, SupervisorConfig, TimingConfig};
use desqemu::vm::runner::{
    CommandOutput, CommandSpec, OutputTail, ProcessHandle, ProcessRunner, RunnerError, SpawnMode,
};
use desqemu::vm::{BaseDirs, VmSupervisor};

pub const EMULATOR_PID: u32 = 4242;
pub const BRIDGE_PID: u32 = 5151;
pub const LOCK_HOLDER_PID: u32 = 777;

// ---------------------------------------------------------------------------
// Scripted runner
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedRunner {
    pub emulator_alive: AtomicBool,
    pub bridge_alive: AtomicBool,
    /// Emulator launches that still have to fail.
    pub launch_failures: AtomicUsize,
    pub emulator_missing: AtomicBool,
    pub bridge_exits_early: AtomicBool,
    pub image_locked: AtomicBool,
    /// Delay applied to every emulator launch.
    pub launch_delay: Mutex<Duration>,
    pub calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Emulator launch commands seen so far.
    pub fn emulator_launches(&self) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == "qemu-system-x86_64" && !c.has_arg("--version"))
            .collect()
    }

    pub fn ran(&self, program: &str, args: &[&str]) -> bool {
        self.calls()
            .iter()
            .any(|c| c.program == program && c.args == args)
    }

    fn kill(&self, pid: &str) -> CommandOutput {
        let flag = match pid.parse::<u32>() {
            Ok(EMULATOR_PID) => &self.emulator_alive,
            Ok(BRIDGE_PID) => &self.bridge_alive,
            Ok(LOCK_HOLDER_PID) => return CommandOutput::ok(""),
            _ => return CommandOutput::exit(1, format!("kill: ({pid}) - No such process")),
        };
        if flag.swap(false, Ordering::SeqCst) {
            CommandOutput::ok("")
        } else {
            CommandOutput::exit(1, format!("kill: ({pid}) - No such process"))
        }
    }
}

fn status(alive: bool) -> CommandOutput {
    if alive {
        CommandOutput::ok("")
    } else {
        CommandOutput::exit(1, "")
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run_sync(&self, cmd: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        self.calls.lock().unwrap().push(cmd.clone());
        let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();
        let out = match (cmd.program.as_str(), args.as_slice()) {
            ("qemu-system-x86_64", ["--version"]) => {
                if self.emulator_missing.load(Ordering::SeqCst) {
                    return Err(RunnerError::NotFound {
                        program: cmd.program.clone(),
                    });
                }
                CommandOutput::ok("QEMU emulator version 8.2.2\n")
            }
            ("pgrep", ["-f", pattern]) if pattern.starts_with("qemu") => {
                if self.emulator_alive.load(Ordering::SeqCst) {
                    CommandOutput::ok(format!("{EMULATOR_PID}\n"))
                } else {
                    CommandOutput::exit(1, "")
                }
            }
            ("pkill", ["-f", pattern]) if pattern.starts_with("qemu") => {
                status(self.emulator_alive.swap(false, Ordering::SeqCst))
            }
            ("pkill", ["-f", pattern]) if pattern.starts_with("websockify") => {
                status(self.bridge_alive.swap(false, Ordering::SeqCst))
            }
            ("kill", ["-0", pid]) => match pid.parse::<u32>() {
                Ok(EMULATOR_PID) => status(self.emulator_alive.load(Ordering::SeqCst)),
                Ok(BRIDGE_PID) => status(self.bridge_alive.load(Ordering::SeqCst)),
                _ => CommandOutput::exit(1, ""),
            },
            ("kill", [pid]) => self.kill(pid),
            ("qemu-img", ["info", "-U", _]) => CommandOutput::ok(
                "file format: qcow2\nvirtual size: 2 GiB (2147483648 bytes)\ndisk size: 4 KiB\n",
            ),
            ("qemu-img", ["info", _]) => {
                if self.image_locked.swap(false, Ordering::SeqCst) {
                    CommandOutput::exit(1, "qemu-img: Failed to get shared \"write\" lock")
                } else {
                    CommandOutput::ok("file format: qcow2\n")
                }
            }
            ("lsof", ["-t", _]) => CommandOutput::ok(format!("{LOCK_HOLDER_PID}\n")),
            _ => CommandOutput::exit(127, format!("unexpected command: {cmd}")),
        };
        Ok(out)
    }

    async fn spawn(&self, cmd: &CommandSpec, mode: SpawnMode) -> Result<ProcessHandle, RunnerError> {
        self.calls.lock().unwrap().push(cmd.clone());
        match cmd.program.as_str() {
            "qemu-system-x86_64" => {
                let delay = *self.launch_delay.lock().unwrap();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let fail = self
                    .launch_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if fail {
                    return Ok(ProcessHandle::failed(CommandOutput::exit(
                        1,
                        "qemu-system-x86_64: Could not open image",
                    )));
                }
                self.emulator_alive.store(true, Ordering::SeqCst);
                if let Some(pos) = cmd.args.iter().position(|a| a == "-pidfile") {
                    if let Some(path) = cmd.args.get(pos + 1) {
                        std::fs::write(path, format!("{EMULATOR_PID}\n")).unwrap();
                    }
                }
                match mode {
                    SpawnMode::Daemonizing => Ok(ProcessHandle::detached(CommandOutput::ok(""))),
                    SpawnMode::Tracked => {
                        Ok(ProcessHandle::tracked(EMULATOR_PID, OutputTail::new(16)))
                    }
                }
            }
            "websockify" => {
                let tail = OutputTail::new(16);
                if self.bridge_exits_early.load(Ordering::SeqCst) {
                    tail.push("socket.error: [Errno 98] Address already in use");
                    tail.finish(Some(1));
                } else {
                    tail.push("WebSocket server settings:");
                    self.bridge_alive.store(true, Ordering::SeqCst);
                }
                Ok(ProcessHandle::tracked(BRIDGE_PID, tail))
            }
            other => Err(RunnerError::NotFound {
                program: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor fixture
// ---------------------------------------------------------------------------

/// A port nothing listens on (bound once, then released).
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    assert!(port >= 5900, "ephemeral port {port} below the VNC range");
    port
}

pub fn locator_config() -> LocatorConfig {
    LocatorConfig {
        image_name: "alpine.qcow2".to_string(),
        candidates: vec![
            "{app}/resources/{dir}/{name}".to_string(),
            "{cwd}/resources/{dir}/{name}".to_string(),
        ],
        archives: Vec::new(),
        dev_sources: Vec::new(),
        extract_dir: None,
        placeholder_dir: None,
        allow_placeholder: false,
        placeholder_size_mb: 1,
    }
}

pub struct Fixture {
    pub tmp: TempDir,
    pub base: BaseDirs,
    pub work_dir: PathBuf,
    pub runner: Arc<ScriptedRunner>,
    pub supervisor: Arc<VmSupervisor>,
    /// Keeps the VNC port reachable when present.
    pub vnc_listener: Option<std::net::TcpListener>,
}

impl Fixture {
    pub fn image_path(&self) -> PathBuf {
        self.base.cwd.join("resources/qcow2/alpine.qcow2")
    }
}

pub struct FixtureOptions {
    pub with_image: bool,
    pub vnc_reachable: bool,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            with_image: true,
            vnc_reachable: true,
        }
    }
}

pub fn fixture() -> Fixture {
    fixture_with(FixtureOptions::default(), |_| {})
}

pub fn fixture_with(
    options: FixtureOptions,
    customize: impl FnOnce(&mut SupervisorConfig),
) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let base = BaseDirs::new(tmp.path().join("app"), tmp.path().join("cwd"));
    let work_dir = tmp.path().join("run");
    std::fs::create_dir_all(&work_dir).unwrap();

    if options.with_image {
        write_file(&base.cwd.join("resources/qcow2/alpine.qcow2"), b"QFI\xfb");
    }

    let vnc_listener = options
        .vnc_reachable
        .then(|| std::net::TcpListener::bind("127.0.0.1:0").unwrap());
    let vnc_port = match &vnc_listener {
        Some(l) => l.local_addr().unwrap().port(),
        None => free_port(),
    };

    let mut config = SupervisorConfig::default();
    config.vm.vnc_port = vnc_port;
    config.bridge.host = "127.0.0.1".to_string();
    config.bridge.listen_port = if vnc_port == 6901 { 6902 } else { 6901 };
    config.timing = TimingConfig::immediate(5);
    config.locator = locator_config();
    customize(&mut config);

    let runner = ScriptedRunner::new();
    let supervisor = VmSupervisor::new(
        config,
        Arc::clone(&runner) as Arc<dyn ProcessRunner>,
        base.clone(),
        &work_dir,
    )
    .unwrap();

    Fixture {
        tmp,
        base,
        work_dir,
        runner,
        supervisor: Arc::new(supervisor),
        vnc_listener,
    }
}

pub fn write_file(path: &Path, contents: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}
