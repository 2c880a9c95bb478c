//! Unmounting a running filesystem.

use super::context::Unmounter;
use super::driver::ServeStatus;
use anyhow::{Context, Result};
use log::error;
use std::io::Write;

/// Unmounts through the platform's own facilities.
///
/// On Linux the setuid `fusermount` helpers are tried first so that
/// unprivileged users can detach their own mounts; the raw `umount`
/// syscall is the fallback when no helper is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUnmounter;

impl Unmounter for SystemUnmounter {
    fn unmount(&self, mount_point: &str) -> Result<()> {
        unmount_fs(mount_point)
    }
}

#[cfg(target_os = "linux")]
fn unmount_fs(mount_point: &str) -> Result<()> {
    use std::process::Command;

    for helper in ["fusermount3", "fusermount"] {
        match Command::new(helper).arg("-u").arg(mount_point).output() {
            Ok(output) if output.status.success() => {
                log::debug!("{} -u {} succeeded", helper, mount_point);
                return Ok(());
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                anyhow::bail!("{} -u {} failed: {}", helper, mount_point, stderr.trim());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("{} not installed", helper);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("unable to run {}", helper));
            }
        }
    }

    nix::mount::umount(mount_point).with_context(|| format!("umount {} failed", mount_point))
}

#[cfg(target_os = "macos")]
fn unmount_fs(mount_point: &str) -> Result<()> {
    use nix::mount::MntFlags;

    nix::mount::unmount(mount_point, MntFlags::MNT_FORCE)
        .with_context(|| format!("unmount {} failed", mount_point))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn unmount_fs(mount_point: &str) -> Result<()> {
    Err(anyhow::anyhow!("unmounting {} is not supported on this platform", mount_point))
}

/// The `--unmount` action: unmount a previously mounted filesystem and
/// exit without mounting anything.
pub struct UnmountCommand<'a> {
    mount_point: &'a str,
}

impl<'a> UnmountCommand<'a> {
    /// Targets the filesystem mounted at `mount_point`.
    pub fn new(mount_point: &'a str) -> Self {
        Self { mount_point }
    }

    /// Unmounts through `unmounter`, reporting progress and errors to `out`.
    pub fn run(&self, unmounter: &dyn Unmounter, out: &mut dyn Write) -> ServeStatus {
        let _ = writeln!(out, "Filesystem unmounting: {}", self.mount_point);
        let _ = out.flush();

        match unmounter.unmount(self.mount_point) {
            Ok(()) => ServeStatus::Success,
            Err(e) => {
                let e = e.context(format!("Unable to unmount {}", self.mount_point));
                error!("{:#}", e);
                let _ = writeln!(out, "{:#}", e);
                ServeStatus::Failure
            }
        }
    }
}
