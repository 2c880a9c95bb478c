//! Detaching from the terminal.

use super::constants::MOUNT_READY;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::stat;
use nix::unistd::{self, fork, ForkResult};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;

/// Detaches the mount process from its terminal.
///
/// The original standard error is duplicated before the standard
/// descriptors are pointed at `/dev/null`, so late diagnostics about a
/// failed mount can still reach the user who started it. The launching
/// process stays around until the daemon reports, through a pipe, whether
/// the mount came up, and exits with a status to match.
pub struct Daemon {
    work_dir: PathBuf,
}

/// What the surviving daemon process keeps from its launcher.
pub struct Detached {
    /// The launcher's standard error.
    pub stderr: File,
    /// Releases the launcher once the mount is up.
    pub ready: ReadyNotice,
}

/// Write end of the launcher's readiness pipe.
///
/// Dropping it without calling [`ReadyNotice::signal`] tells the launcher
/// the mount failed.
#[derive(Debug)]
pub struct ReadyNotice {
    pipe: File,
}

impl ReadyNotice {
    /// Tells the launcher that the filesystem is mounted.
    pub fn signal(mut self) {
        if let Err(e) = self.pipe.write_all(&[MOUNT_READY]) {
            warn!("unable to notify the launching process: {}", e);
        }
    }
}

/// Read end of the readiness pipe, held by the launcher.
#[derive(Debug)]
pub struct ReadyWaiter {
    pipe: File,
}

impl ReadyWaiter {
    /// Blocks until the daemon reports. True only if the mount came up.
    pub fn wait(mut self) -> bool {
        let mut byte = [0u8; 1];
        loop {
            match self.pipe.read(&mut byte) {
                Ok(1) => return byte[0] == MOUNT_READY,
                Ok(_) => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("readiness pipe failed: {}", e);
                    return false;
                }
            }
        }
    }
}

/// Creates the readiness pipe shared between launcher and daemon.
pub fn ready_pipe() -> Result<(ReadyWaiter, ReadyNotice)> {
    let (read_fd, write_fd) = unistd::pipe().context("unable to create readiness pipe")?;
    // SAFETY: both descriptors were just returned by pipe and are owned by nobody else.
    let (read_end, write_end) = unsafe { (File::from_raw_fd(read_fd), File::from_raw_fd(write_fd)) };
    // helpers spawned by the daemon must not keep the launcher waiting
    close_on_exec(read_end.as_raw_fd())?;
    close_on_exec(write_end.as_raw_fd())?;
    Ok((
        ReadyWaiter { pipe: read_end },
        ReadyNotice { pipe: write_end },
    ))
}

fn close_on_exec(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).context("unable to set FD_CLOEXEC")?;
    Ok(())
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Daemon {
    /// Creates a daemon that settles in `/`.
    pub fn new() -> Self {
        Self {
            work_dir: PathBuf::from("/"),
        }
    }

    /// Settles the daemon in `work_dir` instead of `/`.
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// Performs the double fork and returns, in the surviving grandchild,
    /// the original standard error and the readiness notice.
    ///
    /// # Returns
    ///
    /// * `Ok(Detached)` in the daemon process. The launcher exits with 0
    ///   once the notice is signalled, or with 1 if it is dropped unsignalled
    /// * `Err` if saving stderr, forking or the environment setup failed
    pub fn start(&self) -> Result<Detached> {
        let saved = unistd::dup(libc::STDERR_FILENO).context("unable to save stderr")?;
        // SAFETY: `saved` was just returned by dup and is owned by nobody else.
        let saved_stderr = unsafe { File::from_raw_fd(saved) };
        let (waiter, notice) = ready_pipe()?;

        // First fork: leave the foreground process group
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child: _ }) => {
                drop(notice);
                let code = if waiter.wait() { 0 } else { 1 };
                std::process::exit(code);
            }
            Ok(ForkResult::Child) => {
                drop(waiter);
                unistd::setsid().context("setsid failed")?;

                // Second fork: never reacquire a controlling terminal
                match unsafe { fork() } {
                    Ok(ForkResult::Parent { child: _ }) => {
                        std::process::exit(0);
                    }
                    Ok(ForkResult::Child) => {
                        stat::umask(stat::Mode::empty());
                        std::env::set_current_dir(&self.work_dir).with_context(|| {
                            format!("unable to change directory to {}", self.work_dir.display())
                        })?;
                        Self::detach_standard_streams()?;

                        info!("Daemon started, pid {}", std::process::id());
                        Ok(Detached {
                            stderr: saved_stderr,
                            ready: notice,
                        })
                    }
                    Err(err) => {
                        error!("Second fork failed: {}", err);
                        Err(err.into())
                    }
                }
            }
            Err(err) => {
                error!("First fork failed: {}", err);
                Err(err.into())
            }
        }
    }

    fn detach_standard_streams() -> Result<()> {
        let null_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")
            .context("unable to open /dev/null")?;
        let null_fd = null_file.as_raw_fd();

        for fd in 0..3 {
            unistd::dup2(null_fd, fd)?;
        }
        Ok(())
    }
}
