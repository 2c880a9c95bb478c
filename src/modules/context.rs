//! Shared state for the lifetime of one mount.
//!
//! A [`MountContext`] owns the root node handle, the configuration, the
//! `running` flag with its wakeup condition variable, and the idle
//! supervisor thread. The serve driver creates it before the engine loop
//! starts and tears it down, supervisor first, after the loop returns.

use super::constants::ACTIVITY_CHECK_INTERVAL;
use super::operations::RootNode;
use super::options::Config;
use super::supervisor::IdleSupervisor;
use anyhow::{bail, Result};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Asks the operating system to detach a mounted filesystem.
pub trait Unmounter: Send + Sync {
    /// Unmounts the filesystem mounted at `mount_point`.
    fn unmount(&self, mount_point: &str) -> Result<()>;
}

type MountNotice = Box<dyn FnOnce() + Send>;

/// Starts the idle supervisor thread.
pub type SupervisorSpawner<N> = fn(IdleSupervisor<N>) -> io::Result<JoinHandle<()>>;

#[derive(Debug, Default)]
struct Activity {
    usage_count: u64,
    idle_cycles: u32,
    open_files: usize,
}

/// Shared runtime state for one mount.
pub struct MountContext<N: RootNode> {
    config: Arc<Config>,
    root: RwLock<Option<N>>,
    running: Mutex<bool>,
    wakeup: Condvar,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    spawner: SupervisorSpawner<N>,
    mount_notice: Mutex<Option<MountNotice>>,
    activity: Mutex<Activity>,
    unmounter: Arc<dyn Unmounter>,
    poll_interval: Duration,
}

impl<N: RootNode> MountContext<N> {
    /// Creates a context with no root attached and the supervisor stopped.
    pub fn new(config: Arc<Config>, unmounter: Arc<dyn Unmounter>) -> Self {
        Self {
            config,
            root: RwLock::new(None),
            running: Mutex::new(false),
            wakeup: Condvar::new(),
            supervisor: Mutex::new(None),
            spawner: IdleSupervisor::spawn,
            mount_notice: Mutex::new(None),
            activity: Mutex::new(Activity::default()),
            unmounter,
            poll_interval: ACTIVITY_CHECK_INTERVAL,
        }
    }

    /// Overrides how long the supervisor sleeps between idle checks.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Replaces the function that starts the supervisor thread.
    pub fn with_supervisor_spawner(mut self, spawner: SupervisorSpawner<N>) -> Self {
        self.spawner = spawner;
        self
    }

    /// The configuration this mount was started with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// How long the supervisor sleeps between idle checks.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Hands the root node to the context. Only one root may ever be attached.
    pub fn attach_root(&self, root: N) -> Result<()> {
        let mut slot = self.root.write();
        if slot.is_some() {
            bail!("a root node is already attached to this mount");
        }
        *slot = Some(root);
        Ok(())
    }

    /// Read access to the root node, `None` before attach or after release.
    pub fn root(&self) -> RwLockReadGuard<'_, Option<N>> {
        self.root.read()
    }

    /// Detaches the root node so the caller can drop it.
    pub fn release_root(&self) -> Option<N> {
        self.root.write().take()
    }

    /// Sets the flag the supervisor loops on.
    pub fn set_running(&self, running: bool) {
        *self.running.lock() = running;
    }

    /// True while the supervisor is meant to keep running.
    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }

    pub(crate) fn wakeup_pair(&self) -> (&Mutex<bool>, &Condvar) {
        (&self.running, &self.wakeup)
    }

    /// Notes that the filesystem served a request.
    pub fn record_activity(&self) {
        self.activity.lock().usage_count += 1;
    }

    /// Counts a newly opened file; open files hold off the idle unmount.
    pub fn file_opened(&self) {
        self.activity.lock().open_files += 1;
    }

    /// Counts a released file.
    pub fn file_released(&self) {
        let mut activity = self.activity.lock();
        activity.open_files = activity.open_files.saturating_sub(1);
    }

    /// Number of files currently open through the mount.
    pub fn open_files(&self) -> usize {
        self.activity.lock().open_files
    }

    /// Closes one idle-accounting cycle and unmounts when the mount has been
    /// idle for `timeout_cycles` cycles with no open files.
    ///
    /// # Returns
    ///
    /// * `true` if the filesystem was found idle and has just been unmounted
    /// * `false` otherwise, including when the unmount request failed
    pub fn usage_and_unmount(&self, timeout_cycles: u32) -> bool {
        if self.root.read().is_none() {
            return false;
        }

        {
            let mut activity = self.activity.lock();
            if activity.usage_count == 0 {
                activity.idle_cycles += 1;
            } else {
                activity.idle_cycles = 0;
            }
            activity.usage_count = 0;
            debug!(
                "idle cycle count: {}, timeout at {}",
                activity.idle_cycles, timeout_cycles
            );

            if activity.idle_cycles < timeout_cycles {
                return false;
            }

            if activity.open_files > 0 {
                if timeout_cycles == 0 || activity.idle_cycles % timeout_cycles == 0 {
                    warn!(
                        "Filesystem inactive, but {} files opened: {}",
                        activity.open_files, self.config.opts.unmount_point
                    );
                }
                return false;
            }
        }

        let mount_point = &self.config.opts.unmount_point;
        info!("Filesystem inactive, unmounting: {}", mount_point);
        match self.unmounter.unmount(mount_point) {
            Ok(()) => true,
            Err(e) => {
                error!("Unable to unmount {}: {:#}", mount_point, e);
                false
            }
        }
    }

    /// Registers a callback that runs once, when the filesystem comes up.
    pub fn on_mounted(&self, notify: impl FnOnce() + Send + 'static) {
        *self.mount_notice.lock() = Some(Box::new(notify));
    }

    /// Drops a mount callback that never ran. Returns true if there was one.
    pub fn discard_mount_notice(&self) -> bool {
        self.mount_notice.lock().take().is_some()
    }

    /// Called by the engine once the filesystem is up: runs the mount
    /// callback and starts idle supervision.
    pub fn mounted(self: &Arc<Self>) {
        let notice = self.mount_notice.lock().take();
        if let Some(notify) = notice {
            notify();
        }
        self.start_supervisor();
    }

    /// Starts the idle supervisor if an idle timeout is configured.
    ///
    /// A failure to create the thread is logged and the mount continues
    /// unsupervised.
    pub fn start_supervisor(self: &Arc<Self>) {
        if self.config.idle_timeout == 0 {
            return;
        }

        let mut slot = self.supervisor.lock();
        if slot.is_some() {
            warn!("idle monitoring thread already running");
            return;
        }

        debug!("starting idle monitoring thread");
        self.set_running(true);
        match (self.spawner)(IdleSupervisor::new(Arc::clone(self))) {
            Ok(handle) => *slot = Some(handle),
            Err(e) => {
                error!("error starting idle monitor thread: {}", e);
                self.set_running(false);
            }
        }
    }

    /// True while a supervisor thread is attached.
    pub fn has_supervisor(&self) -> bool {
        self.supervisor.lock().is_some()
    }

    /// Stops the idle supervisor and waits for its thread to exit.
    pub fn stop_supervisor(&self) {
        let Some(handle) = self.supervisor.lock().take() else {
            self.set_running(false);
            return;
        };

        debug!("waking up monitoring thread");
        {
            let mut running = self.running.lock();
            *running = false;
            self.wakeup.notify_one();
        }

        debug!("joining with idle monitoring thread");
        if handle.join().is_err() {
            error!("idle monitoring thread panicked");
        }
        debug!("join done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::operations::{DirEntry, OpResult};
    use crate::modules::options::Config;
    use anyhow::anyhow;
    use fuser::FileAttr;
    use libc::ENOENT;
    use std::ffi::OsStr;

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
    struct RecordingUnmounter {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Unmounter for RecordingUnmounter {
        fn unmount(&self, mount_point: &str) -> Result<()> {
            self.calls.lock().push(mount_point.to_string());
            if self.fail {
                return Err(anyhow!("device busy"));
            }
            Ok(())
        }
    }

    fn test_config(idle_timeout: u32) -> Arc<Config> {
        let mut config = Config::defaults("encmount");
        config.idle_timeout = idle_timeout;
        config.opts.unmount_point = "/d/mnt".to_string();
        Arc::new(config)
    }

    fn context(idle: u32, unmounter: Arc<RecordingUnmounter>) -> MountContext<NullRoot> {
        MountContext::new(test_config(idle), unmounter)
    }

    #[test]
    fn test_root_attaches_once_and_releases_once() {
        let ctx = context(0, Arc::default());
        assert!(ctx.root().is_none());

        ctx.attach_root(NullRoot).unwrap();
        assert!(ctx.attach_root(NullRoot).is_err());
        assert!(ctx.root().is_some());

        assert!(ctx.release_root().is_some());
        assert!(ctx.release_root().is_none());
    }

    #[test]
    fn test_idle_check_without_root_never_unmounts() {
        let unmounter = Arc::new(RecordingUnmounter::default());
        let ctx = context(1, unmounter.clone());

        for _ in 0..5 {
            assert!(!ctx.usage_and_unmount(1));
        }
        assert!(unmounter.calls.lock().is_empty());
    }

    #[test]
    fn test_unmounts_after_enough_idle_cycles() {
        let unmounter = Arc::new(RecordingUnmounter::default());
        let ctx = context(1, unmounter.clone());
        ctx.attach_root(NullRoot).unwrap();

        assert!(!ctx.usage_and_unmount(3));
        assert!(!ctx.usage_and_unmount(3));
        assert!(ctx.usage_and_unmount(3));
        assert_eq!(unmounter.calls.lock().as_slice(), ["/d/mnt"]);
    }

    #[test]
    fn test_activity_resets_idle_count() {
        let unmounter = Arc::new(RecordingUnmounter::default());
        let ctx = context(1, unmounter.clone());
        ctx.attach_root(NullRoot).unwrap();

        assert!(!ctx.usage_and_unmount(2));
        ctx.record_activity();
        assert!(!ctx.usage_and_unmount(2));
        assert!(!ctx.usage_and_unmount(2));
        assert!(ctx.usage_and_unmount(2));
    }

    #[test]
    fn test_open_files_block_unmount() {
        let unmounter = Arc::new(RecordingUnmounter::default());
        let ctx = context(1, unmounter.clone());
        ctx.attach_root(NullRoot).unwrap();

        ctx.file_opened();
        for _ in 0..4 {
            assert!(!ctx.usage_and_unmount(2));
        }
        assert!(unmounter.calls.lock().is_empty());

        ctx.file_released();
        assert_eq!(ctx.open_files(), 0);
        assert!(ctx.usage_and_unmount(2));
    }

    #[test]
    fn test_failed_unmount_reports_false() {
        let unmounter = Arc::new(RecordingUnmounter {
            fail: true,
            ..Default::default()
        });
        let ctx = context(1, unmounter.clone());
        ctx.attach_root(NullRoot).unwrap();

        assert!(!ctx.usage_and_unmount(1));
        assert_eq!(unmounter.calls.lock().len(), 1);
    }

    #[test]
    fn test_no_supervisor_without_idle_timeout() {
        let ctx = Arc::new(context(0, Arc::default()));
        ctx.start_supervisor();
        assert!(!ctx.has_supervisor());
        assert!(!ctx.is_running());
        ctx.stop_supervisor();
    }

    fn refuse_thread(_supervisor: IdleSupervisor<NullRoot>) -> io::Result<JoinHandle<()>> {
        Err(io::Error::new(io::ErrorKind::WouldBlock, "thread limit reached"))
    }

    #[test]
    fn test_supervisor_spawn_failure_leaves_mount_serving() {
        let unmounter = Arc::new(RecordingUnmounter::default());
        let ctx = Arc::new(context(5, unmounter.clone()).with_supervisor_spawner(refuse_thread));
        ctx.attach_root(NullRoot).unwrap();

        ctx.mounted();
        assert!(!ctx.has_supervisor());
        assert!(!ctx.is_running());
        assert!(ctx.root().is_some());

        ctx.record_activity();
        ctx.stop_supervisor();
        assert!(ctx.release_root().is_some());
        assert!(unmounter.calls.lock().is_empty());
    }

    #[test]
    fn test_mount_notice_runs_once_on_mount() {
        let ctx = Arc::new(context(0, Arc::default()));
        let fired = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&fired);
        ctx.on_mounted(move || *counter.lock() += 1);

        ctx.mounted();
        ctx.mounted();
        assert_eq!(*fired.lock(), 1);
        assert!(!ctx.discard_mount_notice());
    }

    #[test]
    fn test_unfired_mount_notice_can_be_discarded() {
        let ctx = context(0, Arc::default());
        ctx.on_mounted(|| {});
        assert!(ctx.discard_mount_notice());
        assert!(!ctx.discard_mount_notice());
    }

    #[test]
    fn test_supervisor_starts_once_and_stops() {
        let ctx = Arc::new(context(5, Arc::default()));
        ctx.attach_root(NullRoot).unwrap();

        ctx.start_supervisor();
        ctx.start_supervisor();
        assert!(ctx.has_supervisor());
        assert!(ctx.is_running());

        ctx.stop_supervisor();
        assert!(!ctx.has_supervisor());
        assert!(!ctx.is_running());
    }
}
