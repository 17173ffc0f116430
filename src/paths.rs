//! Application directory structure for desqemu.
//!
//! Provides a single `DesqemuPaths` struct that resolves all standard
//! directories and ensures they exist on first launch. Follows macOS
//! conventions there:
//!
//! - Config:    `~/.config/desqemu/`  (human-editable, XDG-style)
//! - Cache:     `~/Library/Caches/io.desqemu.desktop/`
//! - Logs:      `~/Library/Logs/desqemu/`
//! - Runtime:   `$TMPDIR/desqemu/`
//!
//! On non-macOS, falls back to XDG paths (`XDG_RUNTIME_DIR` for runtime).

use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
const BUNDLE_ID: &str = "io.desqemu.desktop";
const APP_NAME: &str = "desqemu";

/// All resolved application directory paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesqemuPaths {
    /// Human-editable config: `~/.config/desqemu/`
    pub config: PathBuf,
    /// Extracted resource bundles and placeholders
    pub cache: PathBuf,
    pub logs: PathBuf,
    /// PID file and the fallback image copy
    pub runtime: PathBuf,
}

impl DesqemuPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::under_home(&home))
    }

    fn under_home(home: &Path) -> Self {
        Self {
            config: resolve_config_dir(home),
            cache: resolve_cache_dir(home),
            logs: resolve_log_dir(home),
            runtime: resolve_runtime_dir(),
        }
    }

    /// Everything under one root. Used by tests and `--state-dir`.
    pub fn rooted(root: &Path) -> Self {
        Self {
            config: root.join("config"),
            cache: root.join("cache"),
            logs: root.join("logs"),
            runtime: root.join("run"),
        }
    }

    /// Default config file location.
    pub fn config_file(&self) -> PathBuf {
        self.config.join("desqemu.toml")
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        let dirs = [
            &self.config,
            &self.cache,
            &self.logs,
            &self.runtime,
        ];
        for dir in &dirs {
            std::fs::create_dir_all(dir)?;
            debug!("ensured directory: {}", dir.display());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_cache_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Caches").join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_cache_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".cache").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
pub(crate) fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
pub(crate) fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("state").join(APP_NAME).join("logs")
    }
}

fn resolve_runtime_dir() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir).join(APP_NAME),
        _ => std::env::temp_dir().join(APP_NAME),
    }
}
