//! VM lifecycle orchestration.
//!
//! `VmSupervisor` owns the lifecycle state machine, the session resources
//! (resolved image, emulator handle, bridge handle) and the event log.
//!
//! Concurrency: one async operation lock serializes start/stop/restart and
//! reconciliation. `start()` and `restart()` refuse to queue (`Busy`),
//! `stop()` waits its turn, and the poller skips a tick instead of
//! interleaving with an in-flight transition. The state machine and the
//! session live behind short-lived `std::sync::Mutex`es that are never held
//! across an await.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError, TransientWarning};
use crate::events::{EventLog, LogEntry, SupervisorEvent};
use crate::state_machine::vm_sm::{VmEvent, VmLifecycle};
use crate::vm::bridge::{BridgeHandle, DisplayBridge, DisplayEndpoint};
use crate::vm::image::{self, ImageFormat, ImageInfo, LockStatus};
use crate::vm::locator::{BaseDirs, Located, ResourceKind, ResourceLocator, ResourceSource};
use crate::vm::probe::{self, KillOutcome};
use crate::vm::runner::{CommandOutput, ProcessHandle, ProcessRunner, RunnerError, SpawnMode};
use crate::vm::{LaunchSpec, VmState, emulator};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of `check_status()`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EmulatorInfo {
    pub binary: String,
    /// Resolved location on `PATH`, when it could be determined.
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

/// Result of a successful `start()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StartReport {
    /// Image the emulator was actually launched with.
    pub image: PathBuf,
    pub source: ResourceSource,
    /// True when the first launch failed and the scratch copy was used.
    pub used_fallback: bool,
    pub emulator_pid: Option<u32>,
    pub display: Option<DisplayEndpoint>,
    pub warnings: Vec<TransientWarning>,
}

/// Result of `stop()`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StopReport {
    pub emulator: KillOutcome,
    pub bridge: KillOutcome,
}

impl StopReport {
    /// True when neither the emulator nor the bridge was running.
    pub fn nothing_to_kill(&self) -> bool {
        self.emulator == KillOutcome::NothingToKill && self.bridge == KillOutcome::NothingToKill
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Unchanged,
    /// An emulator we did not start was found: Stopped -> Running.
    Promoted,
    /// The emulator disappeared: Running -> Stopped.
    Demoted,
    /// A lifecycle operation was in flight.
    Skipped,
}

/// Point-in-time view for the GUI.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VmStatus {
    pub state: VmState,
    /// Reason for the `Error` state.
    pub error: Option<String>,
    pub emulator_pid: Option<u32>,
    pub image: Option<PathBuf>,
    pub display: Option<DisplayEndpoint>,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Session {
    image: Option<PathBuf>,
    emulator: Option<ProcessHandle>,
    bridge: Option<BridgeHandle>,
}

pub struct VmSupervisor {
    config: SupervisorConfig,
    runner: Arc<dyn ProcessRunner>,
    locator: ResourceLocator,
    base: BaseDirs,
    bridge: DisplayBridge,
    signature: String,
    pid_file: PathBuf,
    scratch_dir: PathBuf,
    op: tokio::sync::Mutex<()>,
    machine: Mutex<VmLifecycle>,
    session: Mutex<Session>,
    state_tx: watch::Sender<VmState>,
    events: EventLog,
}

impl VmSupervisor {
    /// Build a supervisor.
    ///
    /// `base` anchors the resource search; `work_dir` receives the PID file,
    /// extracted archives, placeholders and the fallback image copy unless
    /// the configuration names explicit locations.
    pub fn new(
        config: SupervisorConfig,
        runner: Arc<dyn ProcessRunner>,
        base: BaseDirs,
        work_dir: &Path,
    ) -> Result<Self> {
        config.validate()?;
        let locator = ResourceLocator::from_config(&config.locator, work_dir)?;
        let bridge = DisplayBridge::new(
            Arc::clone(&runner),
            config.bridge.clone(),
            config.timing.bridge_grace(),
        );
        let (state_tx, _) = watch::channel(VmState::Stopped);
        Ok(Self {
            signature: emulator::signature(&config.emulator.binary, &config.vm.name),
            pid_file: config.pid_file(work_dir),
            scratch_dir: config
                .scratch_dir
                .clone()
                .unwrap_or_else(|| work_dir.to_path_buf()),
            locator,
            base,
            bridge,
            runner,
            config,
            op: tokio::sync::Mutex::new(()),
            machine: Mutex::new(VmLifecycle::new()),
            session: Mutex::new(Session::default()),
            state_tx,
            events: EventLog::default(),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Process-table pattern for this VM's emulator.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    pub fn state(&self) -> VmState {
        self.with_machine(|m| m.state())
    }

    pub fn status(&self) -> VmStatus {
        let (state, error) = self.with_machine(|m| (m.state(), m.error_reason()));
        self.with_session(|s| VmStatus {
            state,
            error,
            emulator_pid: s.emulator.as_ref().and_then(ProcessHandle::pid),
            image: s.image.clone(),
            display: s.bridge.as_ref().map(|b| b.endpoint.clone()),
        })
    }

    /// Viewer endpoint of the running bridge, if any.
    pub fn display_endpoint(&self) -> Option<DisplayEndpoint> {
        self.with_session(|s| s.bridge.as_ref().map(|b| b.endpoint.clone()))
    }

    /// Viewer endpoint only if the VM is running and something accepts
    /// connections on the bridge port. Works for VMs adopted by
    /// `reconcile()`, which have no bridge handle of their own.
    pub async fn reachable_display(&self) -> Result<Option<DisplayEndpoint>> {
        if self.state() != VmState::Running || !self.bridge.enabled() {
            return Ok(None);
        }
        let Some(vnc_port) = self.config.vm.display_mode().vnc_port() else {
            return Ok(None);
        };
        let endpoint = match self.display_endpoint() {
            Some(endpoint) => endpoint,
            None => self
                .bridge
                .endpoint(vnc_port, self.bridge.listen_port())
                .map_err(|e| SupervisorError::config(e.to_string()))?,
        };
        let listening = probe::port_listening(
            &endpoint.host,
            endpoint.listen_port,
            self.config.timing.liveness_delay().max(Duration::from_millis(200)),
        )
        .await;
        if listening {
            Ok(Some(endpoint))
        } else {
            debug!(port = endpoint.listen_port, "display bridge is not listening");
            Ok(None)
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<VmState> {
        self.state_tx.subscribe()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.events.entries()
    }

    pub fn clear_logs(&self) {
        self.events.clear();
    }

    /// Check that the emulator binary is installed and report its version.
    pub async fn check_status(&self) -> Result<EmulatorInfo> {
        let binary = &self.config.emulator.binary;
        match self.runner.run_sync(&emulator::version_command(binary)).await {
            Ok(out) => {
                let info = EmulatorInfo {
                    binary: binary.clone(),
                    path: emulator::find_on_path(binary),
                    version: emulator::parse_version(&out.stdout),
                };
                match &info.version {
                    Some(v) => self.events.success(format!("QEMU is installed (version {v})")),
                    None => self.events.warning(format!(
                        "{binary} is installed but its version could not be read"
                    )),
                }
                Ok(info)
            }
            Err(RunnerError::NotFound { .. }) => {
                let err = SupervisorError::DependencyMissing {
                    binary: binary.clone(),
                    hint: emulator::install_hint().to_string(),
                };
                self.events.error(err.to_string());
                Err(err)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve an artifact without starting anything.
    pub async fn locate(&self, kind: ResourceKind) -> Result<Located> {
        let locator = self.locator.clone();
        let base = self.base.clone();
        tokio::task::spawn_blocking(move || locator.locate(&kind, &base))
            .await
            .map_err(|e| SupervisorError::launch(format!("resource lookup task failed: {e}")))?
            .map_err(SupervisorError::from)
    }

    pub async fn locate_image(&self) -> Result<Located> {
        self.locate(ResourceKind::DiskImage).await
    }

    /// Size information for the resolved disk image.
    pub async fn image_info(&self) -> Result<ImageInfo> {
        let located = self.locate_image().await?;
        let info = image::image_info(
            self.runner.as_ref(),
            &self.config.emulator.img_binary,
            &located.path,
        )
        .await?;
        Ok(info)
    }

    // -----------------------------------------------------------------------
    // Lifecycle intents
    // -----------------------------------------------------------------------

    /// Start the VM. Only valid from `Stopped`.
    pub async fn start(&self) -> Result<StartReport> {
        let _op = self.op.try_lock().map_err(|_| SupervisorError::Busy)?;
        self.start_locked().await
    }

    /// Stop the VM. Waits for any in-flight operation, always ends in
    /// `Stopped`, and is safe to call repeatedly.
    pub async fn stop(&self) -> Result<StopReport> {
        let _op = self.op.lock().await;
        Ok(self.stop_locked().await)
    }

    /// Stop, settle, start. Ends in `Running` or `Error`.
    pub async fn restart(&self) -> Result<StartReport> {
        let _op = self.op.try_lock().map_err(|_| SupervisorError::Busy)?;
        self.events.info("Restarting VM...");
        self.stop_locked().await;
        tokio::time::sleep(self.config.timing.restart_settle()).await;
        self.start_locked().await
    }

    /// Compare recorded state with the process table and correct drift.
    pub async fn reconcile(&self) -> Reconciliation {
        let Ok(_op) = self.op.try_lock() else {
            return Reconciliation::Skipped;
        };
        let recorded = self.state();
        if !matches!(recorded, VmState::Running | VmState::Stopped) {
            return Reconciliation::Unchanged;
        }

        let observed = match probe::emulator_running(
            self.runner.as_ref(),
            &self.signature,
            Some(&self.pid_file),
        )
        .await
        {
            Ok(running) => running,
            Err(e) => {
                debug!(error = %e, "liveness probe unavailable");
                return Reconciliation::Unchanged;
            }
        };

        match (recorded, observed) {
            (VmState::Running, false) => {
                self.events.warning("VM stopped unexpectedly");
                let bridge = self.with_session(|s| {
                    s.emulator = None;
                    s.bridge.take()
                });
                if bridge.is_some() || self.config.bridge.enabled {
                    self.bridge.stop(bridge.as_ref()).await;
                }
                probe::remove_pid_file(&self.pid_file).await;
                self.dispatch(VmEvent::CrashDetected);
                Reconciliation::Demoted
            }
            (VmState::Stopped, true) => {
                let pid = probe::read_pid_file(&self.pid_file).await;
                let handle = ProcessHandle::detached(CommandOutput::default());
                let handle = match pid {
                    Some(pid) => handle.with_pid(pid),
                    None => handle,
                };
                self.with_session(|s| s.emulator = Some(handle));
                self.events.info("Detected a running VM started outside this session");
                self.dispatch(VmEvent::ExternalStartDetected);
                Reconciliation::Promoted
            }
            _ => Reconciliation::Unchanged,
        }
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    async fn start_locked(&self) -> Result<StartReport> {
        let state = self.state();
        if state != VmState::Stopped {
            return Err(SupervisorError::InvalidTransition { op: "start", state });
        }
        self.dispatch(VmEvent::Start);
        self.events.info("Starting VM...");

        let mut warnings = Vec::new();
        match self.launch_session(&mut warnings).await {
            Ok(report) => {
                self.dispatch(VmEvent::Launched);
                match &report.display {
                    Some(d) => self
                        .events
                        .success(format!("VM started. Display available at {}", d.viewer_url)),
                    None => self.events.success("VM started"),
                }
                Ok(report)
            }
            Err(err) => {
                self.events.error(format!("Failed to start VM: {err}"));
                self.teardown().await;
                self.dispatch(VmEvent::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    async fn launch_session(&self, warnings: &mut Vec<TransientWarning>) -> Result<StartReport> {
        self.check_status().await?;
        self.kill_stale(warnings).await;

        let located = self.locate_image().await?;
        if !located.is_production() {
            self.warn(warnings, TransientWarning::Placeholder(located.path.clone()));
        }
        self.events
            .info(format!("Using disk image {}", located.path.display()));
        self.with_session(|s| s.image = Some(located.path.clone()));

        self.clear_image_lock(&located.path, warnings).await;

        let spec = self.launch_spec(&located.path);
        let (spec, handle, used_fallback) = match self.launch_once(&spec).await {
            Ok(handle) => (spec, handle, false),
            Err(first) => {
                self.events
                    .warning(format!("Emulator launch failed: {first}. Retrying with a copy of the image"));
                let copy = self
                    .fallback_copy(&located.path)
                    .await
                    .map_err(|e| {
                        SupervisorError::launch(format!("{first}; fallback copy failed: {e}"))
                    })?;
                self.with_session(|s| s.image = Some(copy.clone()));
                let spec = self.launch_spec(&copy);
                match self.launch_once(&spec).await {
                    Ok(handle) => (spec, handle, true),
                    Err(second) => {
                        return Err(SupervisorError::launch(format!(
                            "first attempt: {first}; fallback attempt: {second}"
                        )));
                    }
                }
            }
        };

        let handle = match (handle.pid(), spec.daemonize) {
            (None, true) => match probe::wait_for_pid_file(
                &self.pid_file,
                self.config.timing.pid_file_attempts,
                self.config.timing.liveness_delay(),
            )
            .await
            {
                Some(pid) => handle.with_pid(pid),
                None => {
                    debug!(pid_file = %self.pid_file.display(), "no PID recorded by the emulator");
                    handle
                }
            },
            _ => handle,
        };
        let emulator_pid = handle.pid();
        info!(pid = ?emulator_pid, image = %spec.image_path.display(), "emulator launched");
        self.with_session(|s| s.emulator = Some(handle));

        let mut display = None;
        if let Some(vnc_port) = spec.display_mode.vnc_port() {
            self.await_display(vnc_port, warnings).await;
            if self.bridge.enabled() {
                display = self.start_bridge(vnc_port, warnings).await;
            }
        }

        Ok(StartReport {
            image: spec.image_path,
            source: located.source,
            used_fallback,
            emulator_pid,
            display,
            warnings: std::mem::take(warnings),
        })
    }

    fn launch_spec(&self, image_path: &Path) -> LaunchSpec {
        let vm = &self.config.vm;
        LaunchSpec {
            name: vm.name.clone(),
            image_path: image_path.to_path_buf(),
            image_format: ImageFormat::from_path(image_path),
            memory_mb: vm.memory_mb,
            cpu_count: vm.cpu_count,
            display_mode: vm.display_mode(),
            port_forwards: vm.port_forward_map(),
            daemonize: vm.daemonize,
            pid_file: Some(self.pid_file.clone()),
            extra_args: vm.extra_args.clone(),
        }
    }

    /// One launch attempt. `Err` carries the diagnostic for the log.
    async fn launch_once(&self, spec: &LaunchSpec) -> std::result::Result<ProcessHandle, String> {
        let cmd = emulator::build_command(&self.config.emulator.binary, spec);
        let mode = if spec.daemonize {
            SpawnMode::Daemonizing
        } else {
            SpawnMode::Tracked
        };
        info!(command = %cmd, "launching emulator");

        let handle = self
            .runner
            .spawn(&cmd, mode)
            .await
            .map_err(|e| e.to_string())?;
        if !handle.is_launched() {
            return Err(handle.diagnostics());
        }
        if mode == SpawnMode::Tracked {
            tokio::time::sleep(self.config.timing.launch_grace()).await;
            if handle.exited().is_some() {
                return Err(handle.diagnostics());
            }
        }
        Ok(handle)
    }

    async fn fallback_copy(&self, image: &Path) -> std::io::Result<PathBuf> {
        let dir = self.scratch_dir.join("fallback");
        tokio::fs::create_dir_all(&dir).await?;
        let file_name = image
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "disk.img".into());
        let dest = dir.join(file_name);
        tokio::fs::copy(image, &dest).await?;
        info!(from = %image.display(), to = %dest.display(), "copied image for fallback launch");
        Ok(dest)
    }

    async fn kill_stale(&self, warnings: &mut Vec<TransientWarning>) {
        match probe::kill_matching(self.runner.as_ref(), &self.signature).await {
            Ok(KillOutcome::Killed) => {
                self.events.info("Killed leftover emulator processes");
                tokio::time::sleep(self.config.timing.liveness_delay()).await;
            }
            Ok(KillOutcome::NothingToKill) => debug!("no stale emulator processes"),
            Ok(KillOutcome::Failed(e)) => self.warn(warnings, TransientWarning::StaleProcess(e)),
            Err(e) => self.warn(warnings, TransientWarning::StaleProcess(e.to_string())),
        }
        probe::remove_pid_file(&self.pid_file).await;
    }

    async fn clear_image_lock(&self, image: &Path, warnings: &mut Vec<TransientWarning>) {
        let img_binary = &self.config.emulator.img_binary;
        let message = match image::check_lock(self.runner.as_ref(), img_binary, image).await {
            Ok(LockStatus::Unlocked) => return,
            Ok(LockStatus::Unknown(msg)) => {
                debug!(%msg, "image lock state unknown");
                return;
            }
            Ok(LockStatus::Locked(msg)) => msg,
            Err(e) => {
                self.warn(
                    warnings,
                    TransientWarning::LockClear(format!("could not check lock: {e}")),
                );
                return;
            }
        };

        self.events
            .warning(format!("Disk image is locked, clearing: {message}"));
        match probe::pids_holding(self.runner.as_ref(), image).await {
            Ok(pids) => {
                for pid in pids {
                    let outcome = probe::kill_pid(self.runner.as_ref(), pid)
                        .await
                        .unwrap_or_else(|e| KillOutcome::Failed(e.to_string()));
                    match outcome {
                        KillOutcome::Killed => info!(pid, "killed process holding the image"),
                        KillOutcome::NothingToKill => {}
                        KillOutcome::Failed(e) => self.warn(
                            warnings,
                            TransientWarning::LockClear(format!("could not kill holder {pid}: {e}")),
                        ),
                    }
                }
            }
            Err(e) => self.warn(
                warnings,
                TransientWarning::LockClear(format!("could not list lock holders: {e}")),
            ),
        }

        let sidecar = image::lock_sidecar(image);
        match tokio::fs::remove_file(&sidecar).await {
            Ok(()) => info!(path = %sidecar.display(), "removed lock file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => self.warn(
                warnings,
                TransientWarning::LockClear(format!("{}: {e}", sidecar.display())),
            ),
        }
    }

    async fn await_display(&self, vnc_port: u16, warnings: &mut Vec<TransientWarning>) {
        let attempts = self.config.timing.liveness_attempts;
        let up = probe::wait_for_port(
            &self.config.bridge.host,
            vnc_port,
            attempts,
            self.config.timing.liveness_delay(),
        )
        .await;
        if up {
            info!(vnc_port, "VNC server is listening");
        } else {
            self.warn(
                warnings,
                TransientWarning::LivenessProbe {
                    port: vnc_port,
                    attempts,
                },
            );
        }
    }

    async fn start_bridge(
        &self,
        vnc_port: u16,
        warnings: &mut Vec<TransientWarning>,
    ) -> Option<DisplayEndpoint> {
        let timeout = self.config.timing.bridge_timeout();
        let started = tokio::time::timeout(
            timeout,
            self.bridge.start(vnc_port, self.bridge.listen_port()),
        )
        .await;
        match started {
            Ok(Ok(handle)) => {
                let endpoint = handle.endpoint.clone();
                self.with_session(|s| s.bridge = Some(handle));
                Some(endpoint)
            }
            Ok(Err(e)) => {
                self.warn(warnings, e.into());
                None
            }
            Err(_) => {
                self.warn(
                    warnings,
                    TransientWarning::BridgeStart(format!(
                        "not ready after {}ms",
                        timeout.as_millis()
                    )),
                );
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------------

    async fn stop_locked(&self) -> StopReport {
        let state = self.state();
        let active = matches!(state, VmState::Running | VmState::Error);
        if active {
            self.dispatch(VmEvent::Stop);
            self.events.info("Stopping VM...");
        }

        let report = self.teardown().await;

        if active {
            self.dispatch(VmEvent::Halted);
            self.events.success("VM stopped");
        } else if report.nothing_to_kill() {
            self.events.info("VM is not running");
        } else {
            self.events.info("Cleaned up leftover VM processes");
        }
        report
    }

    /// Kill the emulator and the bridge and forget the session. Best effort.
    async fn teardown(&self) -> StopReport {
        let session = self.with_session(std::mem::take);

        let mut emulator = KillOutcome::NothingToKill;
        if let Some(pid) = session.emulator.as_ref().and_then(ProcessHandle::pid) {
            emulator = probe::kill_pid(self.runner.as_ref(), pid)
                .await
                .unwrap_or_else(|e| KillOutcome::Failed(e.to_string()));
        }
        let swept = probe::kill_matching(self.runner.as_ref(), &self.signature)
            .await
            .unwrap_or_else(|e| KillOutcome::Failed(e.to_string()));
        let emulator = emulator.merge(swept);
        if let KillOutcome::Failed(e) = &emulator {
            self.events.warning(format!("Failed to kill emulator: {e}"));
        }
        probe::remove_pid_file(&self.pid_file).await;

        let bridge = self.bridge.stop(session.bridge.as_ref()).await;
        if let KillOutcome::Failed(e) = &bridge {
            self.events.warning(format!("Failed to stop display bridge: {e}"));
        }

        StopReport { emulator, bridge }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn dispatch(&self, event: VmEvent) -> VmState {
        let (from, to) = self.with_machine(|m| m.dispatch(event));
        if from != to {
            self.state_tx.send_replace(to);
            self.events.state_changed(from, to);
        }
        to
    }

    fn warn(&self, warnings: &mut Vec<TransientWarning>, warning: TransientWarning) {
        warn!(%warning, "transient problem during start");
        self.events.warning(warning.to_string());
        warnings.push(warning);
    }

    fn with_machine<T>(&self, f: impl FnOnce(&mut VmLifecycle) -> T) -> T {
        let mut guard = self.machine.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> T) -> T {
        let mut guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}
