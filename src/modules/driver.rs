//! The serve driver.
//!
//! Runs one mount from start to finish:
//!
//! 1. checks that the engine argument vector fits the engine's limit
//! 2. builds the [`MountContext`] and attaches the root node returned by the
//!    encryption engine
//! 3. optionally daemonizes, keeping the original stderr for annotations and
//!    late diagnostics; the launching process waits until the mount is up
//! 4. assembles the [`OperationTable`] and blocks in the [`Transport`]
//! 5. tears down in order: idle supervisor stopped and joined, root node
//!    released, context dropped
//!
//! A panic escaping the serve loop is caught, logged and turned into a
//! failure status; teardown still runs.

use super::constants::{ACTIVITY_CHECK_INTERVAL, QUICK_FAILURE_WINDOW};
use super::constants::{STATUS_MAIN_END, STATUS_MAIN_START};
use super::context::{MountContext, Unmounter};
use super::daemon::{Daemon, ReadyNotice};
use super::operations::{OperationTable, RootNode};
use super::options::Config;
use super::transport::Transport;
use anyhow::Result;
use log::{debug, error, info, warn};
use std::any::Any;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of a mount or unmount run, mapped onto the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeStatus {
    /// Exit status 0.
    Success,
    /// Non-zero exit status.
    Failure,
}

impl From<ServeStatus> for ExitCode {
    fn from(status: ServeStatus) -> Self {
        match status {
            ServeStatus::Success => ExitCode::SUCCESS,
            ServeStatus::Failure => ExitCode::FAILURE,
        }
    }
}

const QUICK_FAILURE_HINT: &str = "fuse failed.  Common problems:\n \
- fuse kernel module not installed (modprobe fuse)\n \
- invalid options -- see usage message\n";

/// Drives one mount through the transport `T`.
pub struct ServeDriver<T: Transport> {
    config: Arc<Config>,
    transport: T,
    unmounter: Arc<dyn Unmounter>,
    poll_interval: Duration,
    daemon: Option<Daemon>,
    ready: Option<ReadyNotice>,
    diagnostics: Box<dyn Write + Send>,
    status: Box<dyn Write + Send>,
}

impl<T: Transport> ServeDriver<T> {
    /// Creates a driver that serves in the calling process.
    pub fn new(config: Config, transport: T, unmounter: Arc<dyn Unmounter>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            unmounter,
            poll_interval: ACTIVITY_CHECK_INTERVAL,
            daemon: None,
            ready: None,
            diagnostics: Box::new(io::sink()),
            status: Box::new(io::stderr()),
        }
    }

    /// Detaches from the terminal before serving when the configuration asks
    /// for it.
    pub fn daemonize_with(mut self, daemon: Daemon) -> Self {
        self.daemon = Some(daemon);
        self
    }

    /// Signals `notice` once the engine reports the filesystem is up. Set
    /// by daemonizing; a notice dropped unsignalled reports a failed mount.
    pub fn with_ready_notice(mut self, notice: ReadyNotice) -> Self {
        self.ready = Some(notice);
        self
    }

    /// Where the quick-failure hint goes in daemon mode. Replaced by the
    /// saved stderr once the process has daemonized.
    pub fn with_diagnostics(mut self, out: Box<dyn Write + Send>) -> Self {
        self.diagnostics = out;
        self
    }

    /// Where `$STATUS$` annotation lines go.
    pub fn with_status_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.status = out;
        self
    }

    /// Overrides the idle check interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Mounts and serves the filesystem.
    ///
    /// `acquire_root` is the encryption engine's initialisation; it runs once,
    /// before any daemonisation, and its root node lives until teardown.
    pub fn run<N, F>(mut self, acquire_root: F) -> ServeStatus
    where
        N: RootNode,
        F: FnOnce(&Config) -> Result<N>,
    {
        let argv = match self.config.engine_args.checked() {
            Ok(argv) => argv.to_vec(),
            Err(e) => {
                error!("{}", e);
                return ServeStatus::Failure;
            }
        };

        let ctx = Arc::new(
            MountContext::new(Arc::clone(&self.config), Arc::clone(&self.unmounter))
                .with_poll_interval(self.poll_interval),
        );

        let root = match acquire_root(&self.config) {
            Ok(root) => root,
            Err(e) => {
                error!("Unable to initialize the filesystem: {:#}", e);
                return ServeStatus::Failure;
            }
        };
        if let Err(e) = ctx.attach_root(root) {
            error!("{:#}", e);
            return ServeStatus::Failure;
        }

        if warns_single_threaded_idle(&self.config) {
            warn!("Note: requested single-threaded mode, but an idle timeout was specified.");
            warn!("The filesystem will operate single-threaded, but threads will still be used to implement idle checking.");
        }

        if self.config.daemonize {
            if let Some(daemon) = self.daemon.take() {
                match daemon.start() {
                    Ok(detached) => {
                        match detached.stderr.try_clone() {
                            Ok(status) => self.status = Box::new(status),
                            Err(e) => warn!("annotations unavailable after daemonizing: {}", e),
                        }
                        self.diagnostics = Box::new(detached.stderr);
                        self.ready = Some(detached.ready);
                    }
                    Err(e) => {
                        error!("Unable to daemonize: {:#}", e);
                        Self::teardown(&ctx);
                        return ServeStatus::Failure;
                    }
                }
            }
        }

        let status = self.serve(&ctx, &argv);
        Self::teardown(&ctx);
        status
    }

    fn serve<N: RootNode>(&mut self, ctx: &Arc<MountContext<N>>, argv: &[String]) -> ServeStatus {
        let table = OperationTable::assemble(Arc::clone(ctx));
        if let Some(notice) = self.ready.take() {
            ctx.on_mounted(move || notice.signal());
        }

        self.annotate(STATUS_MAIN_START);
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.transport.serve(argv, table)));
        let elapsed = started.elapsed();
        self.annotate(STATUS_MAIN_END);

        let status = match outcome {
            Ok(Ok(())) => ServeStatus::Success,
            Ok(Err(e)) => {
                error!("fuse main loop failed: {}", e);
                if self.config.daemonize && elapsed <= QUICK_FAILURE_WINDOW {
                    let _ = self.diagnostics.write_all(QUICK_FAILURE_HINT.as_bytes());
                    let _ = self.diagnostics.flush();
                }
                ServeStatus::Failure
            }
            Err(payload) => {
                error!(
                    "Internal error: Caught exception from main loop: {}",
                    panic_message(payload.as_ref())
                );
                ServeStatus::Failure
            }
        };

        // the launcher exits once the notice is gone, so after the hint
        if ctx.discard_mount_notice() {
            debug!("filesystem never came up");
        }
        status
    }

    fn annotate(&mut self, line: &str) {
        if self.config.opts.annotate {
            let _ = writeln!(self.status, "{}", line);
            let _ = self.status.flush();
        }
    }

    fn teardown<N: RootNode>(ctx: &MountContext<N>) {
        ctx.stop_supervisor();
        if ctx.release_root().is_some() {
            debug!("root node released");
        }
        info!("Filesystem shutdown complete: {}", ctx.config().opts.unmount_point);
    }
}

// Idle checking needs its own thread even when requests are served on one.
fn warns_single_threaded_idle(config: &Config) -> bool {
    !config.threaded && config.idle_timeout > 0
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
