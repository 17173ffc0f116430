//! Supervisor configuration.
//!
//! Every tunable lives in a single `SupervisorConfig` tree that can be
//! serialized to/from TOML. Each section is `#[serde(default)]`, so a
//! config file only needs the keys it changes and a missing file means
//! "all defaults". Port numbers are configuration, never protocol
//! constants.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SupervisorError};
use crate::vm::DisplayMode;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Root configuration container.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub vm: VmConfig,
    pub emulator: EmulatorConfig,
    pub bridge: BridgeConfig,
    pub locator: LocatorConfig,
    pub timing: TimingConfig,
    /// Scratch space for the fallback image copy. Defaults to the runtime dir.
    pub scratch_dir: Option<PathBuf>,
}

/// Guest shape and launch flags.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct VmConfig {
    /// Passed as `-name`; identifies this VM's processes.
    pub name: String,
    pub memory_mb: u32,
    pub cpu_count: u32,
    pub display: DisplayKind,
    /// VNC TCP port. Must be >= 5900 (display `:N` is `port - 5900`).
    pub vnc_port: u16,
    pub vnc_password: bool,
    pub daemonize: bool,
    /// Defaults to `<runtime dir>/desqemu-vm.pid`.
    pub pid_file: Option<PathBuf>,
    pub port_forwards: Vec<PortForward>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayKind {
    Vnc,
    Local,
}

/// One `hostfwd=tcp::<host>-:<guest>` rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct PortForward {
    pub host: u16,
    pub guest: u16,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub binary: String,
    /// `qemu-img`, used for lock detection and image info.
    pub img_binary: String,
}

/// VNC-to-WebSocket proxy.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub binary: String,
    /// Host the bridge forwards to and viewers connect to.
    pub host: String,
    pub listen_port: u16,
    /// Static web root served by the bridge (noVNC checkout), if any.
    pub web_dir: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

/// Artifact search. See [`crate::vm::locator`] for the template syntax.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct LocatorConfig {
    pub image_name: String,
    pub candidates: Vec<String>,
    pub archives: Vec<String>,
    pub dev_sources: Vec<String>,
    pub extract_dir: Option<PathBuf>,
    pub placeholder_dir: Option<PathBuf>,
    pub allow_placeholder: bool,
    pub placeholder_size_mb: u64,
}

/// Fixed delays and retry budgets, in milliseconds.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct TimingConfig {
    pub liveness_attempts: u32,
    pub liveness_delay_ms: u64,
    /// A tracked emulator that exits within this window counts as a failed launch.
    pub launch_grace_ms: u64,
    pub pid_file_attempts: u32,
    pub bridge_grace_ms: u64,
    pub bridge_timeout_ms: u64,
    pub restart_settle_ms: u64,
    pub poll_interval_ms: u64,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "desqemu".to_string(),
            memory_mb: 1024,
            cpu_count: 2,
            display: DisplayKind::Vnc,
            vnc_port: 5901,
            vnc_password: false,
            daemonize: true,
            pid_file: None,
            port_forwards: Vec::new(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".to_string(),
            img_binary: "qemu-img".to_string(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "websockify".to_string(),
            host: "localhost".to_string(),
            listen_port: 6901,
            web_dir: None,
            extra_args: Vec::new(),
        }
    }
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            image_name: "alpine-bootable.qcow2".to_string(),
            candidates: vec![
                "{app}/resources/{dir}/{name}".to_string(),
                "{app}/../Resources/{dir}/{name}".to_string(),
                "{app}/../share/desqemu/{dir}/{name}".to_string(),
                "{cwd}/resources/{dir}/{name}".to_string(),
                "{cwd}/{name}".to_string(),
            ],
            archives: vec![
                "{app}/resources.tar.gz".to_string(),
                "{cwd}/resources.tar.gz".to_string(),
            ],
            dev_sources: vec![
                "{cwd}/desqemu-desktop/resources/{dir}/{name}".to_string(),
                "{cwd}/../desqemu-desktop/resources/{dir}/{name}".to_string(),
            ],
            extract_dir: None,
            placeholder_dir: None,
            allow_placeholder: true,
            placeholder_size_mb: 64,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            liveness_attempts: 10,
            liveness_delay_ms: 1000,
            launch_grace_ms: 1500,
            pid_file_attempts: 10,
            bridge_grace_ms: 1000,
            bridge_timeout_ms: 10_000,
            restart_settle_ms: 2000,
            poll_interval_ms: 5000,
        }
    }
}

// ---------------------------------------------------------------------------
// Helper methods
// ---------------------------------------------------------------------------

impl TimingConfig {
    pub fn liveness_delay(&self) -> Duration {
        Duration::from_millis(self.liveness_delay_ms)
    }

    pub fn launch_grace(&self) -> Duration {
        Duration::from_millis(self.launch_grace_ms)
    }

    pub fn bridge_grace(&self) -> Duration {
        Duration::from_millis(self.bridge_grace_ms)
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_timeout_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Every delay set to `ms` and retry budgets shrunk to fit.
    pub fn immediate(ms: u64) -> Self {
        Self {
            liveness_attempts: 2,
            liveness_delay_ms: ms,
            launch_grace_ms: ms,
            pid_file_attempts: 2,
            bridge_grace_ms: ms,
            bridge_timeout_ms: ms.saturating_mul(200).max(500),
            restart_settle_ms: ms,
            poll_interval_ms: ms.max(1),
        }
    }
}

impl VmConfig {
    pub fn display_mode(&self) -> DisplayMode {
        match self.display {
            DisplayKind::Vnc => DisplayMode::NetworkVnc {
                port: self.vnc_port,
                password: self.vnc_password,
            },
            DisplayKind::Local => DisplayMode::LocalFramebuffer,
        }
    }

    pub fn port_forward_map(&self) -> BTreeMap<u16, u16> {
        self.port_forwards
            .iter()
            .map(|pf| (pf.host, pf.guest))
            .collect()
    }
}

impl SupervisorConfig {
    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Deserialize from a TOML string.
    pub fn from_toml(s: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let config = Self::from_toml(&text)
            .map_err(|e| SupervisorError::config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the emulator or the bridge cannot work with.
    pub fn validate(&self) -> Result<()> {
        let name_ok = !self.vm.name.is_empty()
            && self
                .vm
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !name_ok {
            return Err(SupervisorError::config(format!(
                "vm.name {:?} must be non-empty and use only letters, digits, '-', '_' or '.'",
                self.vm.name
            )));
        }
        if self.vm.memory_mb == 0 {
            return Err(SupervisorError::config("vm.memory_mb must be positive"));
        }
        if self.vm.cpu_count == 0 {
            return Err(SupervisorError::config("vm.cpu_count must be positive"));
        }
        if self.vm.display == DisplayKind::Vnc && self.vm.vnc_port < 5900 {
            return Err(SupervisorError::config(format!(
                "vm.vnc_port {} is below 5900",
                self.vm.vnc_port
            )));
        }
        if self.bridge.enabled && self.bridge.listen_port == self.vm.vnc_port {
            return Err(SupervisorError::config(
                "bridge.listen_port must differ from vm.vnc_port",
            ));
        }
        let timing = &self.timing;
        if timing.poll_interval_ms == 0 {
            return Err(SupervisorError::config("timing.poll_interval_ms must be positive"));
        }
        if timing.liveness_attempts == 0 {
            return Err(SupervisorError::config("timing.liveness_attempts must be positive"));
        }
        if timing.pid_file_attempts == 0 {
            return Err(SupervisorError::config("timing.pid_file_attempts must be positive"));
        }
        let mut hosts = std::collections::BTreeSet::new();
        for pf in &self.vm.port_forwards {
            if !hosts.insert(pf.host) {
                return Err(SupervisorError::config(format!(
                    "host port {} forwarded twice",
                    pf.host
                )));
            }
        }
        Ok(())
    }

    /// PID file path, falling back to `<runtime_dir>/desqemu-vm.pid`.
    pub fn pid_file(&self, runtime_dir: &Path) -> PathBuf {
        self.vm
            .pid_file
            .clone()
            .unwrap_or_else(|| runtime_dir.join("desqemu-vm.pid"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SupervisorConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = SupervisorConfig::from_toml(
            r#"
            [vm]
            memory_mb = 2048

            [[vm.port_forwards]]
            host = 2222
            guest = 22

            [bridge]
            listen_port = 6900
            "#,
        )
        .unwrap();
        assert_eq!(cfg.vm.memory_mb, 2048);
        assert_eq!(cfg.vm.cpu_count, 2);
        assert_eq!(cfg.bridge.listen_port, 6900);
        assert_eq!(cfg.bridge.binary, "websockify");
        assert_eq!(cfg.vm.port_forward_map().get(&2222), Some(&22));
        assert_eq!(cfg.timing.poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn toml_round_trip() {
        let cfg = SupervisorConfig::default();
        let back = SupervisorConfig::from_toml(&cfg.to_toml()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn rejects_low_vnc_port() {
        let mut cfg = SupervisorConfig::default();
        cfg.vm.vnc_port = 80;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn local_display_ignores_vnc_port() {
        let mut cfg = SupervisorConfig::default();
        cfg.vm.display = DisplayKind::Local;
        cfg.vm.vnc_port = 80;
        cfg.validate().unwrap();
        assert_eq!(cfg.vm.display_mode(), DisplayMode::LocalFramebuffer);
    }

    #[test]
    fn rejects_duplicate_forward() {
        let mut cfg = SupervisorConfig::default();
        cfg.vm.port_forwards = vec![
            PortForward { host: 8080, guest: 80 },
            PortForward { host: 8080, guest: 8080 },
        ];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_timing_counts() {
        let mut cfg = SupervisorConfig::default();
        cfg.timing.poll_interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SupervisorConfig::default();
        cfg.timing.liveness_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SupervisorConfig::default();
        cfg.timing.pid_file_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_rejects_zero_poll_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("desqemu.toml");
        std::fs::write(&path, "[timing]\npoll_interval_ms = 0\n").unwrap();
        assert!(SupervisorConfig::load(&path).is_err());
    }

    #[test]
    fn vm_name_charset() {
        let mut cfg = SupervisorConfig::default();
        for good in ["desqemu", "alpine-3.19", "vm_2"] {
            cfg.vm.name = good.to_string();
            cfg.validate().unwrap();
        }
        for bad in ["", "my vm", "vm+1", "vm(a)", "a,process=x"] {
            cfg.vm.name = bad.to_string();
            assert!(cfg.validate().is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn load_missing_file_is_default() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = SupervisorConfig::load(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(cfg, SupervisorConfig::default());
    }

    #[test]
    fn pid_file_defaults_to_runtime_dir() {
        let cfg = SupervisorConfig::default();
        assert_eq!(
            cfg.pid_file(Path::new("/run/user/1000/desqemu")),
            PathBuf::from("/run/user/1000/desqemu/desqemu-vm.pid")
        );
    }
}
