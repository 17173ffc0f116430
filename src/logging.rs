//! Logging initialisation for desqemu.
//!
//! When the `DESQEMU_LOG` environment variable is set to `1`, structured
//! logs are also written to the OS log directory as `desqemu.log`.
//! Otherwise only stderr output (filtered by `RUST_LOG`) is enabled.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::PathBuf;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// `verbose` raises the default stderr filter to `debug` when `RUST_LOG`
/// is unset. Call once from `main` and keep the returned `LogGuard` alive.
pub fn init(verbose: bool) -> LogGuard {
    let default_level = if verbose { "debug" } else { "warn" };

    let file_guard = if std::env::var("DESQEMU_LOG").as_deref() == Ok("1") {
        let dir = log_dir().unwrap_or_else(std::env::temp_dir);
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(dir, "desqemu.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(if verbose { "debug" } else { "info" })
            }))
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}

fn log_dir() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(crate::paths::resolve_log_dir(&PathBuf::from(home)))
}
