//! mount.nfs-fuse - mount an NFS export through FUSE.
//!
//! Usage: mount.nfs-fuse <host:/export> <dir> [-r|-w] [-v..] [-f] [-n] [-o opts] [-t vers]
//!
//! Without `-f` the mount runs in a background session and this process
//! exits once the mount point is live.

#![deny(unsafe_code)]

// Use mimalloc for reduced allocation latency (enabled by default).
// Disable with `--no-default-features` if debugging allocator issues.
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nfsfuse_core::LoopbackConnector;
use nfsfuse_fuse::backend::{self, MOUNT_TIMEOUT};
use nfsfuse_fuse::exit_code;
use nfsfuse_fuse::session::{self, MountArgs, MountPlan};
use nfsfuse_mount::daemon::{self, Readiness};
use nfsfuse_mount::{LocalFlags, ShutdownSignal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the foreground loop checks that the mount is still there.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "mount.nfs-fuse")]
#[command(version, about = "Mount an NFS export through FUSE")]
struct Cli {
    /// Remote export, host:/path ([addr]:/path for IPv6)
    target: String,

    /// Directory to mount on
    mountpoint: PathBuf,

    /// Mount read-only (overrides -o)
    #[arg(short = 'r', long = "read-only", visible_alias = "ro", conflicts_with = "read_write")]
    read_only: bool,

    /// Mount read-write (overrides -o)
    #[arg(short = 'w', long = "read-write", visible_alias = "rw")]
    read_write: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Stay in the foreground
    #[arg(short, long)]
    foreground: bool,

    /// Do not update the mount table
    #[arg(short = 'n', long = "no-mtab")]
    no_mtab: bool,

    /// Comma-separated mount options
    #[arg(short, long, value_name = "OPTS")]
    options: Option<String>,

    /// Protocol version (3 or 4); overrides vers= in -o
    #[arg(short = 't', long = "nfs-version", value_name = "VERS", value_parser = parse_version)]
    nfs_version: Option<u32>,

    /// Internal flag: this process is the daemon child (don't spawn again)
    #[arg(long, hide = true)]
    internal_daemon_child: bool,
}

impl Cli {
    fn mount_args(&self) -> MountArgs {
        let read_only = if self.read_only {
            Some(true)
        } else if self.read_write {
            Some(false)
        } else {
            None
        };
        MountArgs {
            target: self.target.clone(),
            mountpoint: self.mountpoint.clone(),
            options: self.options.clone(),
            read_only,
            version: self.nfs_version,
            local: LocalFlags {
                no_mtab: self.no_mtab,
                foreground: self.foreground,
            },
            debug_mount: self.verbose >= 2,
        }
    }
}

/// Accepts `4` as well as `4.1`; only the major number matters.
fn parse_version(s: &str) -> Result<u32, String> {
    let major = s.split('.').next().unwrap_or(s);
    major
        .parse()
        .map_err(|_| format!("invalid protocol version '{s}'"))
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are not errors.
            let code = if e.use_stderr() {
                exit_code::USAGE
            } else {
                exit_code::SUCCESS
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("mount.nfs-fuse: {e:#}");
            exit_code::SYSTEM_ERROR
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<i32> {
    let plan = match MountPlan::from_args(&cli.mount_args()) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("mount.nfs-fuse: {e}");
            return Ok(e.exit_code());
        }
    };

    if !cli.foreground && !cli.internal_daemon_child {
        return spawn_background(&plan.mountpoint);
    }
    run_foreground(&plan, cli.internal_daemon_child)
}

/// Re-executes this binary in its own session and waits for the mount.
fn spawn_background(mountpoint: &Path) -> Result<i32> {
    let exe = std::env::current_exe().context("Failed to locate own executable")?;
    let initial_dev = std::fs::metadata(mountpoint)
        .with_context(|| format!("Failed to stat {}", mountpoint.display()))?
        .dev();

    let mut command = Command::new(exe);
    command
        .args(std::env::args_os().skip(1))
        .arg("--foreground")
        .arg("--internal-daemon-child");
    let mut child = daemon::spawn_as_daemon(&mut command).context("Failed to spawn daemon")?;

    // Allow for the handshake on top of the kernel mount itself.
    let timeout = MOUNT_TIMEOUT * 2;
    let outcome = daemon::wait_until_ready(&mut child, timeout, || {
        std::fs::metadata(mountpoint).is_ok_and(|m| m.dev() != initial_dev)
    })
    .context("Failed to wait for daemon")?;

    match outcome {
        Readiness::Ready => {
            info!(pid = child.id(), mountpoint = %mountpoint.display(), "mounted in background");
            Ok(exit_code::SUCCESS)
        }
        Readiness::Exited(status) => Ok(status.code().unwrap_or(exit_code::SYSTEM_ERROR)),
        Readiness::TimedOut => {
            warn!(timeout = ?timeout, "background mount did not become ready, stopping it");
            let _ = child.kill();
            let _ = child.wait();
            eprintln!("mount.nfs-fuse: mount did not become ready within {timeout:?}");
            Ok(exit_code::SYSTEM_ERROR)
        }
    }
}

fn run_foreground(plan: &MountPlan, detach: bool) -> Result<i32> {
    let shutdown = ShutdownSignal::new();
    shutdown
        .install()
        .context("Failed to install signal handlers")?;

    let connector = LoopbackConnector::new();
    let active = match session::mount(plan, &connector, plan.registry()) {
        Ok(active) => active,
        Err(e) => {
            error!(error = %e, "mount failed");
            eprintln!("mount.nfs-fuse: {e}");
            return Ok(e.exit_code());
        }
    };

    if detach && let Err(e) = daemon::detach_stdio() {
        warn!(error = %e, "failed to detach from terminal");
    }

    while !shutdown.wait_timeout(LIVENESS_INTERVAL) {
        if !backend::is_mounted(active.mountpoint()) {
            info!("mount point was unmounted externally");
            break;
        }
    }

    active.shutdown();
    Ok(exit_code::SUCCESS)
}
