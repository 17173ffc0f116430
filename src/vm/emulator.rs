//! Emulator binary discovery and command-line construction.

use std::path::{Path, PathBuf};

use crate::vm::runner::CommandSpec;
use crate::vm::{DisplayMode, LaunchSpec};

/// `<binary> --version`, used both as the dependency check and for display.
pub fn version_command(binary: &str) -> CommandSpec {
    CommandSpec::new(binary).arg("--version")
}

/// Pull the version out of `--version` output
/// (`QEMU emulator version 8.2.2 (Debian 1:8.2.2+ds-0ubuntu1)`).
pub fn parse_version(stdout: &str) -> Option<String> {
    const MARKER: &str = "emulator version";
    stdout.lines().find_map(|line| {
        let idx = line.find(MARKER)?;
        line[idx + MARKER.len()..]
            .split_whitespace()
            .next()
            .map(str::to_string)
    })
}

/// Resolve `binary` the way a shell would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn find_on_path(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|p| p.is_file())
}

/// Platform install instructions shown with `DependencyMissing`.
pub fn install_hint() -> &'static str {
    install_hint_for(std::env::consts::OS)
}

pub fn install_hint_for(os: &str) -> &'static str {
    match os {
        "macos" => "Install it with: brew install qemu",
        "linux" => "Install it with: sudo apt install qemu-system-x86 (or your distribution's equivalent)",
        "windows" => "Download it from https://www.qemu.org/download/#windows",
        _ => "See https://www.qemu.org/download/",
    }
}

/// Extended regex identifying this VM's emulator processes (`pgrep -f` /
/// `pkill -f`).
///
/// Matches the binary's file name followed by `-name <vm>`, where the name
/// must end at a space, a comma (QEMU suboptions) or the end of the command
/// line. `desqemu` therefore never matches a VM called `desqemu-other`.
pub fn signature(binary: &str, vm_name: &str) -> String {
    let base = Path::new(binary)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| binary.to_string());
    format!(
        "{}.*-name {}( |,|$)",
        escape_ere(&base),
        escape_ere(vm_name)
    )
}

/// Backslash-escape POSIX extended regex metacharacters.
fn escape_ere(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '\\' | '.' | '^' | '$' | '|' | '?' | '*' | '+' | '(' | ')' | '[' | ']' | '{' | '}'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Build the full emulator command line for one launch attempt.
pub fn build_command(binary: &str, spec: &LaunchSpec) -> CommandSpec {
    let mut cmd = CommandSpec::new(binary)
        .arg("-name")
        .arg(&spec.name)
        .arg("-m")
        .arg(format!("{}M", spec.memory_mb))
        .arg("-smp")
        .arg(spec.cpu_count.to_string())
        .arg("-drive")
        .arg(format!(
            "file={},format={},if=virtio",
            spec.image_path.display(),
            spec.image_format
        ));

    cmd = match spec.display_mode {
        DisplayMode::NetworkVnc { port, password } => {
            let display = port.saturating_sub(5900);
            let mut vnc = format!(":{display}");
            if password {
                vnc.push_str(",password=on");
            }
            cmd.arg("-vnc").arg(vnc)
        }
        DisplayMode::LocalFramebuffer => cmd.arg("-display").arg("default"),
    };

    if !spec.port_forwards.is_empty() {
        let forwards: Vec<String> = spec
            .port_forwards
            .iter()
            .map(|(host, guest)| format!("hostfwd=tcp::{host}-:{guest}"))
            .collect();
        cmd = cmd
            .arg("-netdev")
            .arg(format!("user,id=net0,{}", forwards.join(",")))
            .arg("-device")
            .arg("e1000,netdev=net0");
    }

    if spec.daemonize {
        cmd = cmd.arg("-daemonize");
    }
    if let Some(pid_file) = &spec.pid_file {
        cmd = cmd.arg("-pidfile").arg(pid_file.to_string_lossy().into_owned());
    }

    cmd.args(spec.extra_args.iter().cloned())
}
