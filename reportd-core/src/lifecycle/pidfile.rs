//! Exclusive pidfile lock.
//!
//! The lock is an advisory OS file lock (flock) on the pidfile itself, held
//! for the lifetime of the [`PidLock`]. A second collector pointed at the same
//! path fails immediately instead of waiting.

use crate::error::PidFileError;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Held pidfile lock. Dropping it unlocks and removes the file.
#[derive(Debug)]
pub struct PidLock {
    file: File,
    path: PathBuf,
}

impl PidLock {
    /// Take the lock at `path` and record the current pid in it.
    pub fn acquire(path: &Path) -> Result<Self, PidFileError> {
        let io_err = |source: io::Error| PidFileError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        match lock_file_nonblocking(&file) {
            Ok(()) => {}
            Err(e) if is_lock_busy(&e) => {
                return Err(PidFileError::Locked {
                    path: path.to_path_buf(),
                    owner: read_pid(&mut file),
                });
            }
            Err(e) => return Err(io_err(e)),
        }

        let mut lock = PidLock {
            file,
            path: path.to_path_buf(),
        };
        lock.write_pid(std::process::id()).map_err(io_err)?;
        Ok(lock)
    }

    /// Replace the recorded pid (after forking, the child owns the lock).
    pub fn write_pid(&mut self, pid: u32) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{pid}")?;
        self.file.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

/// Read the pid recorded by the current lock holder, if it is readable.
fn read_pid(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn is_lock_busy(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock || error.raw_os_error() == Some(libc::EAGAIN)
}

fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn unlock_file(file: &File) -> io::Result<()> {
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
