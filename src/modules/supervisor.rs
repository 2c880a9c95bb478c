//! Idle supervision for auto-unmount.

use super::constants::ACTIVITY_CHECK_SECS;
use super::context::MountContext;
use super::operations::RootNode;
use log::{debug, info};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Number of check cycles that make up an idle timeout of `idle_minutes`.
pub fn timeout_cycles(idle_minutes: u32) -> u32 {
    idle_minutes.saturating_mul(60) / ACTIVITY_CHECK_SECS
}

/// Background worker that unmounts the filesystem once it has been idle
/// for the configured number of minutes.
pub struct IdleSupervisor<N: RootNode> {
    ctx: Arc<MountContext<N>>,
    timeout_cycles: u32,
}

impl<N: RootNode> IdleSupervisor<N> {
    /// Prepares a supervisor for `ctx`; nothing runs until it is spawned.
    pub fn new(ctx: Arc<MountContext<N>>) -> Self {
        let timeout_cycles = timeout_cycles(ctx.config().idle_timeout);
        Self {
            ctx,
            timeout_cycles,
        }
    }

    /// Runs the supervisor on its own thread.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("idle-monitor".to_string())
            .spawn(move || self.run())
    }

    /// Runs the check loop until the filesystem is unmounted for
    /// inactivity or the context stops running.
    pub fn run(self) {
        let mount_point = self.ctx.config().opts.unmount_point.clone();
        info!("Filesystem mounted: {}", mount_point);

        let (lock, wakeup) = self.ctx.wakeup_pair();
        let mut running = lock.lock();
        let mut unmounted = false;

        while *running {
            if self.ctx.usage_and_unmount(self.timeout_cycles) {
                unmounted = true;
                break;
            }

            let deadline = Instant::now() + self.ctx.poll_interval();
            while *running && Instant::now() < deadline {
                if wakeup.wait_until(&mut running, deadline).timed_out() {
                    break;
                }
            }
        }
        drop(running);

        if !unmounted {
            info!("Filesystem unmounted: {}", mount_point);
        }
        debug!("Idle monitoring thread exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::context::Unmounter;
    use crate::modules::operations::{DirEntry, OpResult};
    use crate::modules::options::Config;
    use anyhow::Result;
    use fuser::FileAttr;
    use libc::ENOENT;
    use parking_lot::Mutex;
    use std::ffi::OsStr;
    use std::time::Duration;

    struct NullRoot;

    impl RootNode for NullRoot {
        fn lookup(&self, _parent: u64, _name: &OsStr) -> OpResult<FileAttr> {
            Err(ENOENT)
        }

        fn getattr(&self, _ino: u64) -> OpResult<FileAttr> {
            Err(ENOENT)
        }

        fn readdir(&self, _ino: u64) -> OpResult<Vec<DirEntry>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct CountingUnmounter {
        calls: Mutex<u32>,
    }

    impl Unmounter for CountingUnmounter {
        fn unmount(&self, _mount_point: &str) -> Result<()> {
            *self.calls.lock() += 1;
            Ok(())
        }
    }

    fn context(
        idle_minutes: u32,
        interval: Duration,
        unmounter: Arc<CountingUnmounter>,
    ) -> Arc<MountContext<NullRoot>> {
        let mut config = Config::defaults("encmount");
        config.idle_timeout = idle_minutes;
        config.opts.unmount_point = "/d/mnt".to_string();
        let ctx = MountContext::new(Arc::new(config), unmounter).with_poll_interval(interval);
        ctx.attach_root(NullRoot).unwrap();
        Arc::new(ctx)
    }

    #[test]
    fn test_timeout_cycles() {
        assert_eq!(timeout_cycles(1), 6);
        assert_eq!(timeout_cycles(10), 60);
        assert_eq!(timeout_cycles(0), 0);
        assert_eq!(timeout_cycles(u32::MAX), u32::MAX / ACTIVITY_CHECK_SECS);
    }

    #[test]
    fn test_supervisor_unmounts_idle_filesystem() {
        let unmounter = Arc::new(CountingUnmounter::default());
        let ctx = context(1, Duration::from_millis(2), unmounter.clone());
        ctx.set_running(true);

        let handle = IdleSupervisor::new(ctx.clone()).spawn().unwrap();
        handle.join().unwrap();

        assert_eq!(*unmounter.calls.lock(), 1);
    }

    #[test]
    fn test_supervisor_wakes_early_on_stop() {
        let unmounter = Arc::new(CountingUnmounter::default());
        let ctx = context(1, Duration::from_secs(60), unmounter.clone());
        ctx.set_running(true);

        let handle = IdleSupervisor::new(ctx.clone()).spawn().unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        {
            let (lock, wakeup) = ctx.wakeup_pair();
            *lock.lock() = false;
            wakeup.notify_one();
        }
        handle.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(*unmounter.calls.lock(), 0);
    }

    #[test]
    fn test_supervisor_exits_immediately_when_not_running() {
        let unmounter = Arc::new(CountingUnmounter::default());
        let ctx = context(1, Duration::from_secs(60), unmounter.clone());

        IdleSupervisor::new(ctx).run();
        assert_eq!(*unmounter.calls.lock(), 0);
    }
}
