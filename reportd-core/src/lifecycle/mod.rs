//! Process lifecycle for daemon mode
//!
//! Opening a [`DaemonContext`] takes the pidfile lock and then, unless the
//! collector runs in the foreground, detaches from the controlling terminal:
//!
//! 1. Lock the pidfile (a held lock fails here, in the invoking process)
//! 2. `fork`; the parent exits immediately
//! 3. `setsid`, `chdir("/")`, stdio to `/dev/null`
//! 4. Record the child's pid in the still-locked pidfile
//!
//! The lock is inherited across `fork` because flock locks belong to the open
//! file description, not the process.

mod pidfile;

pub use pidfile::PidLock;

use crate::config::DaemonConfig;
use crate::error::ReportingError;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

/// How the collector should run as a daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    /// Exclusive lock file holding the collector's pid
    pub pidfile: PathBuf,
    /// Fork into the background after taking the lock
    pub detach: bool,
}

impl DaemonSettings {
    /// Settings for daemon mode, or `None` when daemon mode is off
    pub fn from_config(config: &DaemonConfig) -> Option<Self> {
        config.enabled.then(|| Self {
            pidfile: config.pidfile.clone(),
            detach: !config.foreground,
        })
    }
}

/// Daemon state owned by the collector for the life of the process.
#[derive(Debug)]
pub struct DaemonContext {
    pidfile: PidLock,
    detached: bool,
}

impl DaemonContext {
    /// Lock the pidfile and (optionally) detach.
    pub fn open(settings: &DaemonSettings) -> Result<Self, ReportingError> {
        let mut pidfile = PidLock::acquire(&settings.pidfile)?;

        if settings.detach {
            detach().map_err(ReportingError::Daemonize)?;
            pidfile
                .write_pid(std::process::id())
                .map_err(ReportingError::Daemonize)?;
        }

        Ok(Self {
            pidfile,
            detached: settings.detach,
        })
    }

    pub fn pidfile(&self) -> &PidLock {
        &self.pidfile
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }
}

/// Fork into the background and start a new session.
///
/// Only the child returns. The parent leaves through `_exit` so that no
/// destructors run there: dropping its copy of the pidfile lock would delete
/// the file the child now owns.
fn detach() -> io::Result<()> {
    // SAFETY: the collector calls this before starting any threads of its own.
    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        // SAFETY: _exit never returns and is async-signal-safe.
        _ => unsafe { libc::_exit(0) },
    }

    // SAFETY: plain syscall without pointer arguments.
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }

    std::env::set_current_dir("/")?;
    redirect_stdio()
}

/// Point stdin, stdout and stderr at `/dev/null`.
fn redirect_stdio() -> io::Result<()> {
    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    let fd = devnull.as_raw_fd();

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are open for the duration of the call.
        if unsafe { libc::dup2(fd, target) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
