//! Background mounts.
//!
//! The parent re-executes itself in a new session (`setsid`) and waits
//! until either the mount point goes live or the child exits. The child
//! keeps stderr until it has mounted so that handshake failures still reach
//! the user, then calls [`detach_stdio`].

use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

const READY_POLL: Duration = Duration::from_millis(50);

/// Spawns `command` as a session leader with stdin and stdout on /dev/null.
pub fn spawn_as_daemon(command: &mut Command) -> io::Result<Child> {
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());

    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        command.pre_exec(|| nix::unistd::setsid().map(drop).map_err(io::Error::from));
    }

    let child = command.spawn()?;
    debug!(pid = child.id(), "spawned background mount");
    Ok(child)
}

/// How a background child settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The readiness check succeeded; the child keeps running.
    Ready,
    /// The child exited before becoming ready.
    Exited(ExitStatus),
    TimedOut,
}

/// Polls `ready` until it holds, `child` exits or `timeout` passes.
pub fn wait_until_ready(
    child: &mut Child,
    timeout: Duration,
    mut ready: impl FnMut() -> bool,
) -> io::Result<Readiness> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Readiness::Exited(status));
        }
        if ready() {
            return Ok(Readiness::Ready);
        }
        if start.elapsed() > timeout {
            return Ok(Readiness::TimedOut);
        }
        std::thread::sleep(READY_POLL);
    }
}

/// Points stdin, stdout and stderr at /dev/null.
pub fn detach_stdio() -> io::Result<()> {
    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(null.as_raw_fd(), fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
