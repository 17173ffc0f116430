//! desqemu: command-line front end for the VM lifecycle supervisor.
//!
//! Issues the same intents the desktop shell does (check, start, stop,
//! restart, open display) and can stay in the foreground supervising the
//! VM until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use desqemu::config::SupervisorConfig;
use desqemu::error::SupervisorError;
use desqemu::paths::DesqemuPaths;
use desqemu::vm::image::format_bytes;
use desqemu::vm::{BaseDirs, ResourceKind, TokioProcessRunner, VmSupervisor, spawn_status_poller};

/// QEMU VM lifecycle supervisor
#[derive(Parser, Debug)]
#[command(name = "desqemu", version, about = "Run and supervise the desqemu VM")]
struct Args {
    /// Config file (defaults to <config dir>/desqemu.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Keep config, cache, logs and runtime files under this directory
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Guest memory in MB
    #[arg(long, global = true)]
    memory: Option<u32>,

    /// Guest CPU count
    #[arg(long, global = true)]
    cpus: Option<u32>,

    /// Disk image file name to look for
    #[arg(long, global = true)]
    image: Option<String>,

    /// Fail instead of falling back to development placeholders
    #[arg(long, global = true)]
    strict: bool,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug-level logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the emulator installation and show the VM state
    Status,
    /// Start the VM and return
    Start,
    /// Stop the VM and its display bridge
    Stop,
    /// Stop, wait, start
    Restart,
    /// Start the VM and supervise it until Ctrl-C, then stop it
    Run,
    /// Print the browser viewer URL
    Display,
    /// Show where the disk image (or a script) would be taken from
    Locate {
        /// Look up a helper script instead of the disk image
        #[arg(long)]
        script: Option<String>,
    },
    /// Show disk image size information
    ImageInfo,
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = desqemu::logging::init(args.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;

    runtime.block_on(run(args))
}

fn load_config(args: &Args, paths: &DesqemuPaths) -> Result<SupervisorConfig> {
    let path = args.config.clone().unwrap_or_else(|| paths.config_file());
    let mut config = SupervisorConfig::load(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    if let Some(memory) = args.memory {
        config.vm.memory_mb = memory;
    }
    if let Some(cpus) = args.cpus {
        config.vm.cpu_count = cpus;
    }
    if let Some(image) = &args.image {
        config.locator.image_name = image.clone();
    }
    if args.strict {
        config.locator.allow_placeholder = false;
    }
    if config.locator.extract_dir.is_none() {
        config.locator.extract_dir = Some(paths.cache.join("extracted"));
    }
    if config.locator.placeholder_dir.is_none() {
        config.locator.placeholder_dir = Some(paths.cache.join("placeholders"));
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let paths = match &args.state_dir {
        Some(root) => DesqemuPaths::rooted(root),
        None => DesqemuPaths::resolve().context("HOME is not set")?,
    };
    paths.ensure().context("failed to create application directories")?;

    let config = load_config(&args, &paths)?;
    if let Command::Config = args.command {
        print!("{}", config.to_toml());
        return Ok(());
    }

    let base = BaseDirs::detect().context("failed to resolve executable directory")?;
    let supervisor = Arc::new(
        VmSupervisor::new(
            config,
            Arc::new(TokioProcessRunner::new()),
            base,
            &paths.runtime,
        )
        .context("failed to set up the supervisor")?,
    );
    info!(runtime = %paths.runtime.display(), "supervisor ready");

    match args.command {
        Command::Status => {
            let installed = match supervisor.check_status().await {
                Ok(info) => Some(info),
                Err(e @ SupervisorError::DependencyMissing { .. }) => {
                    eprintln!("{e}");
                    None
                }
                Err(e) => return Err(e.into()),
            };
            // A fresh process has no session; ask the process table.
            supervisor.reconcile().await;
            let status = supervisor.status();
            if args.json {
                let out = serde_json::json!({ "emulator": installed, "vm": status });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                if let Some(info) = &installed {
                    println!(
                        "emulator: {} {}",
                        info.path
                            .as_deref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| info.binary.clone()),
                        info.version.as_deref().unwrap_or("(unknown version)")
                    );
                }
                println!("vm:       {}", status.state);
                if let Some(pid) = status.emulator_pid {
                    println!("pid:      {pid}");
                }
            }
        }
        Command::Start => {
            let report = supervisor.start().await.context("failed to start the VM")?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("VM started from {}", report.image.display());
                if let Some(display) = &report.display {
                    println!("Display: {}", display.viewer_url);
                }
                for warning in &report.warnings {
                    eprintln!("warning: {warning}");
                }
            }
        }
        Command::Stop => {
            let report = supervisor.stop().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.nothing_to_kill() {
                println!("VM was not running");
            } else {
                println!("VM stopped");
            }
        }
        Command::Restart => {
            let report = supervisor.restart().await.context("failed to restart the VM")?;
            println!("VM restarted from {}", report.image.display());
            if let Some(display) = &report.display {
                println!("Display: {}", display.viewer_url);
            }
        }
        Command::Run => {
            let report = supervisor.start().await.context("failed to start the VM")?;
            if let Some(display) = &report.display {
                println!("Display: {}", display.viewer_url);
            }
            for warning in &report.warnings {
                eprintln!("warning: {warning}");
            }
            let mut events = supervisor.subscribe();
            let poller = spawn_status_poller(
                Arc::clone(&supervisor),
                supervisor.config().timing.poll_interval(),
            );
            println!("Supervising VM, press Ctrl-C to stop");

            loop {
                tokio::select! {
                    signal = tokio::signal::ctrl_c() => {
                        signal.context("failed to listen for Ctrl-C")?;
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(desqemu::SupervisorEvent::Log(entry)) => println!("{entry}"),
                        Ok(desqemu::SupervisorEvent::StateChanged { to, .. }) => {
                            if to == desqemu::VmState::Stopped {
                                println!("VM is no longer running");
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            poller.shutdown().await;
            supervisor.stop().await?;
            println!("VM stopped");
        }
        Command::Display => {
            supervisor.reconcile().await;
            if supervisor.state() != desqemu::VmState::Running {
                anyhow::bail!("the VM is not running");
            }
            let Some(endpoint) = supervisor.reachable_display().await? else {
                let bridge = &supervisor.config().bridge;
                anyhow::bail!(
                    "no display bridge is listening on {}:{}",
                    bridge.host,
                    bridge.listen_port
                );
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(&endpoint)?);
            } else {
                println!("{}", endpoint.viewer_url);
            }
        }
        Command::Locate { script } => {
            let kind = match script {
                Some(name) => ResourceKind::Script(name),
                None => ResourceKind::DiskImage,
            };
            let located = supervisor.locate(kind).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&located)?);
            } else {
                println!("{}", located.path.display());
                if !located.is_production() {
                    eprintln!("warning: development placeholder");
                }
            }
        }
        Command::ImageInfo => {
            let info = supervisor.image_info().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("path:         {}", info.path.display());
                println!("format:       {}", info.format);
                println!("file size:    {}", format_bytes(info.file_size));
                if let Some(v) = &info.virtual_size {
                    println!("virtual size: {v}");
                }
                if let Some(d) = &info.disk_size {
                    println!("disk size:    {d}");
                }
            }
        }
        Command::Config => {}
    }

    Ok(())
}
