//! Resource resolution across packaged and development layouts.
//!
//! A packaged app and a development checkout disagree on both the working
//! directory and the resource root, so artifacts are searched for through
//! an explicit, ordered list of path templates:
//!
//! ```text
//! candidates (first regular file wins)
//!     └─► archives   (.tar.gz bundle, extract matching entry)
//!             └─► placeholders (dev copy, else minimal stand-in)
//!                     └─► NotFound { searched }
//! ```
//!
//! Templates may use `{app}` (directory of the executable), `{cwd}`
//! (process working directory), `{dir}` (per-kind subdirectory) and
//! `{name}` (artifact file name). The same templates in the same order
//! always produce the same answer for the same filesystem.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

use crate::config::LocatorConfig;

/// What is being looked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    /// The VM disk image. The file name comes from configuration.
    DiskImage,
    /// A helper script with the given file name.
    Script(String),
}

impl ResourceKind {
    /// Subdirectory substituted for `{dir}`.
    pub fn dir(&self) -> &'static str {
        match self {
            ResourceKind::DiskImage => "qcow2",
            ResourceKind::Script(_) => "scripts",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::DiskImage => f.write_str("disk image"),
            ResourceKind::Script(name) => write!(f, "script `{name}`"),
        }
    }
}

/// Roots substituted into the candidate templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseDirs {
    /// Directory containing the running executable.
    pub app: PathBuf,
    /// Process working directory.
    pub cwd: PathBuf,
}

impl BaseDirs {
    pub fn new(app: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            app: app.into(),
            cwd: cwd.into(),
        }
    }

    /// Resolve from the current executable and working directory.
    pub fn detect() -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        let app = exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            app,
            cwd: std::env::current_dir()?,
        })
    }
}

/// How a placeholder artifact was produced.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderOrigin {
    /// Copied from a known development location.
    DevCopy(PathBuf),
    /// Synthesized: a sparse raw image or a no-op script.
    StandIn,
}

/// Which strategy produced the artifact.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ResourceSource {
    /// Found at the candidate with this index.
    Candidate { index: usize },
    /// Extracted from a packaged archive.
    Archive { archive: PathBuf },
    /// Development fallback, never a production artifact.
    Placeholder { origin: PlaceholderOrigin },
}

/// A resolved artifact.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Located {
    pub path: PathBuf,
    pub source: ResourceSource,
}

impl Located {
    /// False for placeholders.
    pub fn is_production(&self) -> bool {
        !matches!(self.source, ResourceSource::Placeholder { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("{kind} not found in {} locations", searched.len())]
    NotFound {
        kind: ResourceKind,
        searched: Vec<PathBuf>,
    },

    #[error("invalid candidate list: {0}")]
    InvalidCandidates(String),

    #[error("placeholder size of {0} MB is too large")]
    PlaceholderTooLarge(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordered, multi-strategy artifact search.
#[derive(Debug, Clone)]
pub struct ResourceLocator {
    image_name: String,
    candidates: Vec<String>,
    archives: Vec<String>,
    dev_sources: Vec<String>,
    extract_dir: PathBuf,
    placeholder_dir: PathBuf,
    allow_placeholder: bool,
    placeholder_bytes: u64,
}

fn expand(template: &str, base: &BaseDirs, kind: &ResourceKind, name: &str) -> PathBuf {
    PathBuf::from(
        template
            .replace("{app}", &base.app.to_string_lossy())
            .replace("{cwd}", &base.cwd.to_string_lossy())
            .replace("{dir}", kind.dir())
            .replace("{name}", name),
    )
}

impl ResourceLocator {
    /// Build a locator from configuration.
    ///
    /// `work_dir` receives extracted archives and placeholders unless the
    /// configuration names explicit directories.
    pub fn from_config(config: &LocatorConfig, work_dir: &Path) -> Result<Self, LocateError> {
        let has_app = config.candidates.iter().any(|c| c.contains("{app}"));
        let has_cwd = config.candidates.iter().any(|c| c.contains("{cwd}"));
        if !has_app || !has_cwd {
            return Err(LocateError::InvalidCandidates(
                "candidates need at least one {app} and one {cwd} template".to_string(),
            ));
        }
        if config.image_name.trim().is_empty() {
            return Err(LocateError::InvalidCandidates(
                "image_name is empty".to_string(),
            ));
        }
        let placeholder_bytes = config
            .placeholder_size_mb
            .checked_mul(1024 * 1024)
            .ok_or(LocateError::PlaceholderTooLarge(config.placeholder_size_mb))?;

        Ok(Self {
            image_name: config.image_name.clone(),
            candidates: config.candidates.clone(),
            archives: config.archives.clone(),
            dev_sources: config.dev_sources.clone(),
            extract_dir: config
                .extract_dir
                .clone()
                .unwrap_or_else(|| work_dir.join("extracted")),
            placeholder_dir: config
                .placeholder_dir
                .clone()
                .unwrap_or_else(|| work_dir.join("placeholders")),
            allow_placeholder: config.allow_placeholder,
            placeholder_bytes,
        })
    }

    pub fn file_name<'a>(&'a self, kind: &'a ResourceKind) -> &'a str {
        match kind {
            ResourceKind::DiskImage => &self.image_name,
            ResourceKind::Script(name) => name,
        }
    }

    /// The candidate paths for `kind`, in search order.
    pub fn candidate_paths(&self, kind: &ResourceKind, base: &BaseDirs) -> Vec<PathBuf> {
        let name = self.file_name(kind);
        self.candidates
            .iter()
            .map(|t| expand(t, base, kind, name))
            .collect()
    }

    /// Resolve `kind`, trying candidates, archives and placeholders in turn.
    pub fn locate(&self, kind: &ResourceKind, base: &BaseDirs) -> Result<Located, LocateError> {
        let name = self.file_name(kind);
        let mut searched = Vec::new();

        for (index, path) in self.candidate_paths(kind, base).into_iter().enumerate() {
            if path.is_file() {
                debug!(%kind, index, path = %path.display(), "found candidate");
                return Ok(Located {
                    path,
                    source: ResourceSource::Candidate { index },
                });
            }
            searched.push(path);
        }

        for template in &self.archives {
            let archive = expand(template, base, kind, name);
            searched.push(archive.clone());
            if !archive.is_file() {
                continue;
            }
            match self.extract_from_archive(&archive, kind, name) {
                Ok(Some(path)) => {
                    info!(%kind, archive = %archive.display(), path = %path.display(), "extracted from archive");
                    return Ok(Located {
                        path,
                        source: ResourceSource::Archive { archive },
                    });
                }
                Ok(None) => debug!(archive = %archive.display(), "archive has no matching entry"),
                Err(e) => warn!(archive = %archive.display(), error = %e, "archive extraction failed"),
            }
        }

        if self.allow_placeholder {
            return self.placeholder(kind, base, name, searched);
        }

        Err(LocateError::NotFound {
            kind: kind.clone(),
            searched,
        })
    }

    fn extract_from_archive(
        &self,
        archive: &Path,
        kind: &ResourceKind,
        name: &str,
    ) -> std::io::Result<Option<PathBuf>> {
        let wanted = Path::new(kind.dir()).join(name);
        let dest = self.extract_dir.join(kind.dir()).join(name);

        if is_fresh(&dest, archive) {
            return Ok(Some(dest));
        }

        let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive)?));
        for entry in tar.entries()? {
            let mut entry = entry?;
            if !entry.path()?.ends_with(&wanted) {
                continue;
            }
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&dest)?;
            return Ok(Some(dest));
        }
        Ok(None)
    }

    fn placeholder(
        &self,
        kind: &ResourceKind,
        base: &BaseDirs,
        name: &str,
        mut searched: Vec<PathBuf>,
    ) -> Result<Located, LocateError> {
        let dir = self.placeholder_dir.join(kind.dir());

        for template in &self.dev_sources {
            let source = expand(template, base, kind, name);
            if !source.is_file() {
                searched.push(source);
                continue;
            }
            let dest = dir.join(name);
            if !is_fresh(&dest, &source) {
                std::fs::create_dir_all(&dir)?;
                std::fs::copy(&source, &dest)?;
            }
            warn!(%kind, from = %source.display(), path = %dest.display(), "using development copy");
            return Ok(Located {
                path: dest,
                source: ResourceSource::Placeholder {
                    origin: PlaceholderOrigin::DevCopy(source),
                },
            });
        }

        let dest = match kind {
            ResourceKind::DiskImage => {
                let stem = Path::new(name)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "disk".to_string());
                dir.join(format!("{stem}-standin.img"))
            }
            ResourceKind::Script(_) => dir.join(name),
        };
        if !dest.is_file() {
            std::fs::create_dir_all(&dir)?;
            match kind {
                ResourceKind::DiskImage => {
                    let file = File::create(&dest)?;
                    file.set_len(self.placeholder_bytes)?;
                }
                ResourceKind::Script(_) => write_noop_script(&dest)?,
            }
        }
        if dest.is_file() {
            warn!(%kind, path = %dest.display(), "using synthesized stand-in");
            return Ok(Located {
                path: dest,
                source: ResourceSource::Placeholder {
                    origin: PlaceholderOrigin::StandIn,
                },
            });
        }

        searched.push(dest);
        Err(LocateError::NotFound {
            kind: kind.clone(),
            searched,
        })
    }
}

/// True when `dest` exists and is not older than `source`.
fn is_fresh(dest: &Path, source: &Path) -> bool {
    let (Ok(d), Ok(s)) = (std::fs::metadata(dest), std::fs::metadata(source)) else {
        return false;
    };
    match (d.modified(), s.modified()) {
        (Ok(dm), Ok(sm)) => dm >= sm,
        _ => false,
    }
}

fn write_noop_script(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, "#!/bin/sh\n# desqemu placeholder\nexit 0\n")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
