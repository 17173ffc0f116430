//! End-to-end lifecycle against a real QEMU installation.
//!
//! Boots a guest from an actual disk image with the real process runner,
//! checks the VNC port comes up, then stops it and checks nothing is left
//! behind in the process table. Needs `qemu-system-x86_64`, `qemu-img`,
//! `pgrep`/`pkill` and a bootable image, so it is gated behind the
//! `emulator-integration-tests` feature.
//!
//! # Running
//!
//! ```bash
//! DESQEMU_TEST_IMAGE=/path/to/alpine.qcow2 \
//!     cargo test --features emulator-integration-tests --test emulator_integration
//! ```
//!
//! The display bridge is disabled unless `DESQEMU_TEST_BRIDGE=1`, since
//! websockify is usually not installed on CI hosts.

#![cfg(all(feature = "emulator-integration-tests", target_os = "linux"))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use desqemu::config::{LocatorConfig, SupervisorConfig};
use desqemu::vm::{BaseDirs, TokioProcessRunner, VmState, VmSupervisor, probe};

fn test_image() -> PathBuf {
    std::env::var("DESQEMU_TEST_IMAGE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .join("tests")
                .join("fixtures")
                .join("alpine.qcow2")
        })
}

fn test_vnc_port() -> u16 {
    std::env::var("DESQEMU_TEST_VNC_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5977)
}

/// A supervisor whose only candidate directory holds the test image.
fn supervisor(tmp: &tempfile::TempDir) -> Arc<VmSupervisor> {
    let image = test_image();
    assert!(
        image.is_file(),
        "test image {} is missing, set DESQEMU_TEST_IMAGE",
        image.display()
    );
    let dir = image.parent().unwrap().to_path_buf();
    let name = image.file_name().unwrap().to_string_lossy().into_owned();

    let mut config = SupervisorConfig::default();
    config.vm.name = format!("desqemu-it-{}", std::process::id());
    config.vm.memory_mb = 256;
    config.vm.cpu_count = 1;
    config.vm.vnc_port = test_vnc_port();
    config.bridge.enabled = std::env::var("DESQEMU_TEST_BRIDGE").as_deref() == Ok("1");
    config.bridge.host = "127.0.0.1".to_string();
    config.bridge.listen_port = test_vnc_port() + 1000;
    config.locator = LocatorConfig {
        image_name: name,
        candidates: vec!["{app}/{name}".to_string(), "{cwd}/{name}".to_string()],
        archives: Vec::new(),
        dev_sources: Vec::new(),
        allow_placeholder: false,
        ..LocatorConfig::default()
    };

    let base = BaseDirs::new(&dir, &dir);
    let work_dir = tmp.path().join("run");
    std::fs::create_dir_all(&work_dir).unwrap();
    Arc::new(
        VmSupervisor::new(config, Arc::new(TokioProcessRunner::new()), base, &work_dir).unwrap(),
    )
}

/// Stops the guest even when an assertion fails part-way.
struct Cleanup(Arc<VmSupervisor>);

impl Drop for Cleanup {
    fn drop(&mut self) {
        let sig = self.0.signature();
        let _ = std::process::Command::new("pkill").args(["-f", sig]).status();
    }
}

#[tokio::test]
async fn boots_and_stops_a_real_guest() {
    let tmp = tempfile::tempdir().unwrap();
    let sup = supervisor(&tmp);
    let _cleanup = Cleanup(Arc::clone(&sup));

    let info = sup.check_status().await.expect("qemu is not installed");
    assert!(info.version.is_some());

    let report = sup.start().await.expect("start failed");
    assert_eq!(sup.state(), VmState::Running);
    assert!(report.image.is_file());
    assert!(report.emulator_pid.is_some());
    assert!(probe::port_listening("127.0.0.1", test_vnc_port(), Duration::from_secs(1)).await);

    let stop = sup.stop().await.unwrap();
    assert!(!stop.nothing_to_kill());
    assert_eq!(sup.state(), VmState::Stopped);
    assert!(!sup.pid_file().exists());
}

#[tokio::test]
async fn reconcile_tracks_an_externally_killed_guest() {
    let tmp = tempfile::tempdir().unwrap();
    let sup = supervisor(&tmp);
    let _cleanup = Cleanup(Arc::clone(&sup));

    sup.start().await.expect("start failed");
    let status = std::process::Command::new("pkill")
        .args(["-f", sup.signature()])
        .status()
        .unwrap();
    assert!(status.success());
    tokio::time::sleep(Duration::from_millis(500)).await;

    sup.reconcile().await;
    assert_eq!(sup.state(), VmState::Stopped);
}
