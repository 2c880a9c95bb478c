//! Timeouts, limits and the tags of the annotation protocol.

use std::time::Duration;

/// Attribute and entry cache lifetime handed to the kernel by default.
pub const TTL: Duration = Duration::from_secs(1);
/// Cache lifetime used when attribute caching is disabled.
pub const NO_TTL: Duration = Duration::ZERO;
/// Inode number of the mount root.
pub const ROOT_INODE: u64 = 1;
/// First inode number handed out below the root.
pub const INITIAL_INODE: u64 = 2;

/// Time between two idle checks.
pub const ACTIVITY_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// [`ACTIVITY_CHECK_INTERVAL`] in whole seconds, for cycle arithmetic.
pub const ACTIVITY_CHECK_SECS: u32 = 10;

/// Capacity of the engine's argument table.
pub const MAX_ENGINE_ARGS: usize = 32;
/// Log tag used unless `--syslogtag` overrides it.
pub const DEFAULT_SYSLOG_TAG: &str = "encmount";
/// Mode of directories created after a prompt.
pub const NEW_DIR_MODE: u32 = 0o700;

/// A serve loop that fails faster than this never got the mount up.
pub const QUICK_FAILURE_WINDOW: Duration = Duration::from_secs(1);

/// Byte a detached daemon writes to its launcher once the mount is up.
pub const MOUNT_READY: u8 = b'R';

/// Written before the engine loop starts.
pub const STATUS_MAIN_START: &str = "$STATUS$ fuse_main_start";
/// Written after the engine loop returns.
pub const STATUS_MAIN_END: &str = "$STATUS$ fuse_main_end";
/// Precedes the question about creating a missing source directory.
pub const PROMPT_CREATE_ROOT_DIR: &str = "$PROMPT$ create_root_dir";
/// Precedes the question about creating a missing mount point.
pub const PROMPT_CREATE_MOUNT_POINT: &str = "$PROMPT$ create_mount_point";
