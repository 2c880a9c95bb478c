//! The FUSE engine seam.
//!
//! The serve driver hands a [`Transport`] the engine argument vector built by
//! option processing together with an assembled [`OperationTable`]. The
//! production transport, [`FuseTransport`], translates that vector into
//! `fuser` mount options and blocks in the session loop until the
//! filesystem is unmounted.

use super::context::Unmounter;
use super::operations::{OperationTable, RootNode};
use fuser::MountOption;
use libc::{SIGHUP, SIGINT, SIGTERM};
use log::{debug, error, info};
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Runs the filesystem event loop for one mount.
pub trait Transport {
    /// Serves requests until the filesystem is unmounted.
    ///
    /// `args[0]` names the program and `args[1]` is the mount point; the rest
    /// are engine flags. An `Err` means the mount never came up or the loop
    /// failed.
    fn serve<N: RootNode>(&self, args: &[String], table: OperationTable<N>) -> io::Result<()>;
}

/// Engine settings decoded from the argument vector.
#[derive(Debug, PartialEq, Eq)]
pub struct MountSettings {
    /// Where the filesystem is mounted.
    pub mount_point: PathBuf,
    /// Options passed on to the kernel mount.
    pub options: Vec<MountOption>,
    /// `-f` was given.
    pub foreground: bool,
    /// `-s` was given.
    pub single_threaded: bool,
    /// `-d` was given; implies `foreground`.
    pub debug: bool,
    /// `attr_timeout=` in seconds, the last one given wins.
    pub attr_timeout: Option<Duration>,
    /// `entry_timeout=` in seconds, the last one given wins.
    pub entry_timeout: Option<Duration>,
}

impl MountSettings {
    /// Decodes `args`, rejecting flags and stray words the engine does not
    /// understand.
    pub fn parse(args: &[String]) -> io::Result<Self> {
        let program = args.first().map(String::as_str).unwrap_or_default();
        let mount_point = match args.get(1) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => return Err(invalid("missing mount point")),
        };

        let mut settings = Self {
            mount_point,
            options: Vec::new(),
            foreground: false,
            single_threaded: false,
            debug: false,
            attr_timeout: None,
            entry_timeout: None,
        };
        let mut named = false;

        let mut rest = args[2..].iter();
        while let Some(arg) = rest.next() {
            match arg.as_str() {
                "-f" => settings.foreground = true,
                "-s" => settings.single_threaded = true,
                "-d" => {
                    settings.debug = true;
                    settings.foreground = true;
                }
                "-o" => {
                    let list = rest
                        .next()
                        .ok_or_else(|| invalid("option -o requires an argument"))?;
                    named |= settings.push_options(list)?;
                }
                other if other.starts_with("-o") => {
                    named |= settings.push_options(&other[2..])?;
                }
                other if other.starts_with('-') => {
                    return Err(invalid(&format!("unknown engine option '{}'", other)));
                }
                other => {
                    return Err(invalid(&format!("unexpected engine argument '{}'", other)));
                }
            }
        }

        if !named && !program.is_empty() {
            settings.options.insert(0, MountOption::FSName(program.to_string()));
        }
        Ok(settings)
    }

    /// Adds each entry of a comma separated option list. Returns true when
    /// the list names the filesystem.
    fn push_options(&mut self, list: &str) -> io::Result<bool> {
        let mut named = false;
        for name in list.split(',').filter(|name| !name.is_empty()) {
            if let Some(value) = name.strip_prefix("attr_timeout=") {
                self.attr_timeout = Some(parse_timeout(name, value)?);
            } else if let Some(value) = name.strip_prefix("entry_timeout=") {
                self.entry_timeout = Some(parse_timeout(name, value)?);
            } else if let Some(option) = mount_option(name) {
                named |= matches!(option, MountOption::FSName(_));
                self.options.push(option);
            }
        }
        Ok(named)
    }
}

// Seconds, fractions allowed.
fn parse_timeout(option: &str, value: &str) -> io::Result<Duration> {
    value
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| invalid(&format!("invalid timeout in '{}'", option)))
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.to_string())
}

/// Maps one `-o` entry to a `fuser` mount option.
///
/// Inode numbering is enforced by the operation table itself, so those
/// entries yield nothing.
fn mount_option(name: &str) -> Option<MountOption> {
    let option = match name {
        "use_ino" | "readdir_ino" => return None,
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "dirsync" => MountOption::DirSync,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        _ => match name.split_once('=') {
            Some(("fsname", value)) => MountOption::FSName(value.to_string()),
            Some(("subtype", value)) => MountOption::Subtype(value.to_string()),
            _ => MountOption::CUSTOM(name.to_string()),
        },
    };
    Some(option)
}

/// Serves the operation table through the kernel FUSE driver.
pub struct FuseTransport {
    unmounter: Arc<dyn Unmounter>,
}

impl FuseTransport {
    /// `unmounter` is used to detach the filesystem when a termination
    /// signal arrives.
    pub fn new(unmounter: Arc<dyn Unmounter>) -> Self {
        Self { unmounter }
    }
}

impl Transport for FuseTransport {
    fn serve<N: RootNode>(&self, args: &[String], table: OperationTable<N>) -> io::Result<()> {
        let settings = MountSettings::parse(args)?;
        if settings.debug {
            debug!("engine request tracing enabled");
        }
        if settings.single_threaded {
            debug!("single threaded request handling requested");
        }
        debug!(
            "mounting {} with {:?}",
            settings.mount_point.display(),
            settings.options
        );

        let watcher = SignalWatcher::start(
            settings.mount_point.to_string_lossy().into_owned(),
            Arc::clone(&self.unmounter),
        )?;
        let table = table.with_cache_timeouts(settings.attr_timeout, settings.entry_timeout);
        let result = fuser::mount2(table, &settings.mount_point, &settings.options);
        watcher.stop();
        result
    }
}

/// Unmounts the filesystem on SIGINT, SIGTERM or SIGHUP, which in turn makes
/// the session loop return.
struct SignalWatcher {
    handle: Handle,
    thread: JoinHandle<()>,
}

impl SignalWatcher {
    fn start(mount_point: String, unmounter: Arc<dyn Unmounter>) -> io::Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("signal-watch".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    info!("Received signal {}, unmounting {}", signal, mount_point);
                    if let Err(e) = unmounter.unmount(&mount_point) {
                        error!("Unable to unmount {}: {:#}", mount_point, e);
                    }
                }
            })?;
        Ok(Self { handle, thread })
    }

    fn stop(self) {
        self.handle.close();
        if self.thread.join().is_err() {
            error!("signal watcher panicked");
        }
    }
}
