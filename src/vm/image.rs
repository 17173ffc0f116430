//! Disk image helpers: format detection, size reporting and lock detection.
//!
//! Image contents are opaque. Everything here either looks at the file name
//! and size or shells out to `qemu-img`.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::vm::runner::{CommandOutput, CommandSpec, ProcessRunner, RunnerError};

/// Disk image format passed to `-drive format=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Qcow2,
    Vmdk,
    Vdi,
    Raw,
}

impl ImageFormat {
    /// Guess the format from the file extension. Unknown extensions are raw.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("qcow2") | Some("qcow") => ImageFormat::Qcow2,
            Some("vmdk") => ImageFormat::Vmdk,
            Some("vdi") => ImageFormat::Vdi,
            _ => ImageFormat::Raw,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Vdi => "vdi",
            ImageFormat::Raw => "raw",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable size with binary units and one decimal, e.g. `1.5 GB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 10.0).round() / 10.0;
    if rounded.fract() == 0.0 {
        format!("{} {}", rounded as u64, UNITS[unit])
    } else {
        format!("{:.1} {}", rounded, UNITS[unit])
    }
}

// ---------------------------------------------------------------------------
// qemu-img info
// ---------------------------------------------------------------------------

/// Size information for a disk image.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ImageInfo {
    pub path: PathBuf,
    pub format: ImageFormat,
    pub file_size: u64,
    /// `virtual size` as reported by `qemu-img info`, when available.
    pub virtual_size: Option<String>,
    /// `disk size` as reported by `qemu-img info`, when available.
    pub disk_size: Option<String>,
}

fn field_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line.trim().strip_prefix(key)?.trim();
    // "virtual size: 2 GiB (2147483648 bytes)" -> "2 GiB"
    let value = rest.split(" (").next().unwrap_or(rest).trim();
    (!value.is_empty()).then_some(value)
}

/// Extract `(virtual size, disk size)` from `qemu-img info` output.
pub fn parse_qemu_img_info(stdout: &str) -> (Option<String>, Option<String>) {
    let mut virtual_size = None;
    let mut disk_size = None;
    for line in stdout.lines() {
        if let Some(v) = field_after(line, "virtual size:") {
            virtual_size = Some(v.to_string());
        } else if let Some(v) = field_after(line, "disk size:") {
            disk_size = Some(v.to_string());
        }
    }
    (virtual_size, disk_size)
}

/// Gather size information. `qemu-img` problems only drop the optional fields.
pub async fn image_info(
    runner: &dyn ProcessRunner,
    img_binary: &str,
    path: &Path,
) -> std::io::Result<ImageInfo> {
    let meta = tokio::fs::metadata(path).await?;
    let (virtual_size, disk_size) = match runner
        .run_sync(&info_command(img_binary, path, true))
        .await
    {
        Ok(out) if out.success() => parse_qemu_img_info(&out.stdout),
        _ => (None, None),
    };
    Ok(ImageInfo {
        path: path.to_path_buf(),
        format: ImageFormat::from_path(path),
        file_size: meta.len(),
        virtual_size,
        disk_size,
    })
}

fn info_command(img_binary: &str, path: &Path, force_share: bool) -> CommandSpec {
    let mut cmd = CommandSpec::new(img_binary).arg("info");
    if force_share {
        // Read even when a running emulator holds the write lock.
        cmd = cmd.arg("-U");
    }
    cmd.arg(path.to_string_lossy().into_owned())
}

// ---------------------------------------------------------------------------
// Lock detection
// ---------------------------------------------------------------------------

/// Whether another process holds the image lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    /// `qemu-img` reported a lock; carries its message.
    Locked(String),
    /// `qemu-img` failed for some other reason; carries its message.
    Unknown(String),
}

/// True when `qemu-img` output mentions an image lock.
pub fn lock_reported(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_ascii_lowercase();
    stderr.contains("lock")
}

/// Probe the image lock by opening it without `-U`.
pub async fn check_lock(
    runner: &dyn ProcessRunner,
    img_binary: &str,
    path: &Path,
) -> Result<LockStatus, RunnerError> {
    let out = runner.run_sync(&info_command(img_binary, path, false)).await?;
    if out.success() {
        Ok(LockStatus::Unlocked)
    } else if lock_reported(&out) {
        Ok(LockStatus::Locked(out.diagnostics()))
    } else {
        Ok(LockStatus::Unknown(out.diagnostics()))
    }
}

/// Sidecar lock file some tooling leaves next to an image (`<image>.lock`).
pub fn lock_sidecar(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}
