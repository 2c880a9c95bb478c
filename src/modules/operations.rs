//! The root node seam and the FUSE dispatch table.

use super::constants::{NO_TTL, TTL};
use super::context::MountContext;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::{c_int, EIO, ENOSYS, ERANGE, EROFS};
use log::{debug, trace};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Result of a root-node operation; the error is an errno value.
pub type OpResult<T> = Result<T, c_int>;

/// Attribute changes requested by a `setattr` call.
#[derive(Debug, Clone, Default)]
pub struct AttrChanges {
    /// New permission bits.
    pub mode: Option<u32>,
    /// New owner.
    pub uid: Option<u32>,
    /// New group.
    pub gid: Option<u32>,
    /// New length; truncates or extends.
    pub size: Option<u64>,
    /// New access time.
    pub atime: Option<TimeOrNow>,
    /// New modification time.
    pub mtime: Option<TimeOrNow>,
    /// Open handle the change was made through, if any.
    pub fh: Option<u64>,
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode of the entry.
    pub ino: u64,
    /// File type of the entry.
    pub kind: FileType,
    /// Name within the directory.
    pub name: OsString,
}

/// Filesystem statistics, field for field as `statvfs` reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatFs {
    /// Total blocks, in `frsize` units.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Free blocks available to unprivileged users.
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Preferred block size.
    pub bsize: u32,
    /// Longest file name.
    pub namelen: u32,
    /// Fragment size.
    pub frsize: u32,
}

/// The decrypted view of the backing directory, as produced by an
/// encryption engine.
///
/// Lookups, attributes and listings are mandatory. Every other operation
/// answers `ENOSYS` unless the engine provides it.
pub trait RootNode: Send + Sync + 'static {
    /// Resolves `name` inside directory `parent`.
    fn lookup(&self, parent: u64, name: &OsStr) -> OpResult<FileAttr>;

    /// Attributes of inode `ino`.
    fn getattr(&self, ino: u64) -> OpResult<FileAttr>;

    /// Lists a directory, without the `.` and `..` entries.
    fn readdir(&self, ino: u64) -> OpResult<Vec<DirEntry>>;

    /// Applies the requested attribute changes and returns the result.
    fn setattr(&self, _ino: u64, _changes: &AttrChanges) -> OpResult<FileAttr> {
        Err(ENOSYS)
    }

    /// Target of a symbolic link.
    fn readlink(&self, _ino: u64) -> OpResult<Vec<u8>> {
        Err(ENOSYS)
    }

    /// Creates a file node; `mode` already has the caller's umask applied.
    fn mknod(&self, _parent: u64, _name: &OsStr, _mode: u32, _rdev: u32) -> OpResult<FileAttr> {
        Err(ENOSYS)
    }

    /// Creates a directory.
    fn mkdir(&self, _parent: u64, _name: &OsStr, _mode: u32) -> OpResult<FileAttr> {
        Err(ENOSYS)
    }

    /// Removes a non-directory entry.
    fn unlink(&self, _parent: u64, _name: &OsStr) -> OpResult<()> {
        Err(ENOSYS)
    }

    /// Removes an empty directory.
    fn rmdir(&self, _parent: u64, _name: &OsStr) -> OpResult<()> {
        Err(ENOSYS)
    }

    /// Creates a symbolic link pointing at `target`.
    fn symlink(&self, _parent: u64, _name: &OsStr, _target: &Path) -> OpResult<FileAttr> {
        Err(ENOSYS)
    }

    /// Moves an entry, replacing any existing target.
    fn rename(
        &self,
        _parent: u64,
        _name: &OsStr,
        _new_parent: u64,
        _new_name: &OsStr,
    ) -> OpResult<()> {
        Err(ENOSYS)
    }

    /// Creates a hard link to `ino`.
    fn link(&self, _ino: u64, _new_parent: u64, _new_name: &OsStr) -> OpResult<FileAttr> {
        Err(ENOSYS)
    }

    /// Opens a file and returns the handle passed back on later calls.
    fn open(&self, _ino: u64, _flags: i32) -> OpResult<u64> {
        Err(ENOSYS)
    }

    /// Creates and opens a regular file.
    fn create(
        &self,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _flags: i32,
    ) -> OpResult<(FileAttr, u64)> {
        Err(ENOSYS)
    }

    /// Reads up to `size` bytes at `offset`.
    fn read(&self, _ino: u64, _fh: u64, _offset: i64, _size: u32) -> OpResult<Vec<u8>> {
        Err(ENOSYS)
    }

    /// Writes `data` at `offset` and returns the byte count written.
    fn write(&self, _ino: u64, _fh: u64, _offset: i64, _data: &[u8]) -> OpResult<u32> {
        Err(ENOSYS)
    }

    /// Called on every close of a file descriptor.
    fn flush(&self, _ino: u64, _fh: u64) -> OpResult<()> {
        Err(ENOSYS)
    }

    /// Called once the last reference to an open handle is gone.
    fn release(&self, _ino: u64, _fh: u64) -> OpResult<()> {
        Err(ENOSYS)
    }

    /// Flushes file contents, and metadata too unless `datasync` is set.
    fn fsync(&self, _ino: u64, _fh: u64, _datasync: bool) -> OpResult<()> {
        Err(ENOSYS)
    }

    /// Statistics of the filesystem holding `ino`.
    fn statfs(&self, _ino: u64) -> OpResult<StatFs> {
        Err(ENOSYS)
    }

    /// Sets an extended attribute.
    fn setxattr(&self, _ino: u64, _name: &OsStr, _value: &[u8], _flags: i32) -> OpResult<()> {
        Err(ENOSYS)
    }

    /// Value of an extended attribute.
    fn getxattr(&self, _ino: u64, _name: &OsStr) -> OpResult<Vec<u8>> {
        Err(ENOSYS)
    }

    /// Returns the attribute names, each terminated by a NUL byte.
    fn listxattr(&self, _ino: u64) -> OpResult<Vec<u8>> {
        Err(ENOSYS)
    }

    /// Removes an extended attribute.
    fn removexattr(&self, _ino: u64, _name: &OsStr) -> OpResult<()> {
        Err(ENOSYS)
    }
}

/// Dispatch table handed to the FUSE engine.
///
/// Every callback records activity for idle accounting, then forwards to
/// the root node held by the mount context. Mutating calls are refused
/// with `EROFS` on a read-only mount.
pub struct OperationTable<N: RootNode> {
    ctx: Arc<MountContext<N>>,
    attr_ttl: Duration,
    entry_ttl: Duration,
    read_only: bool,
}

impl<N: RootNode> OperationTable<N> {
    /// Builds the table over `ctx`, taking read-only mode and attribute
    /// caching from its configuration.
    pub fn assemble(ctx: Arc<MountContext<N>>) -> Self {
        let opts = &ctx.config().opts;
        let ttl = if opts.no_attr_cache { NO_TTL } else { TTL };
        let read_only = opts.read_only;
        Self {
            ctx,
            attr_ttl: ttl,
            entry_ttl: ttl,
            read_only,
        }
    }

    /// Overrides the kernel cache lifetimes given as `attr_timeout=` and
    /// `entry_timeout=` mount options.
    pub fn with_cache_timeouts(mut self, attr: Option<Duration>, entry: Option<Duration>) -> Self {
        if let Some(ttl) = attr {
            self.attr_ttl = ttl;
        }
        if let Some(ttl) = entry {
            self.entry_ttl = ttl;
        }
        self
    }

    /// The mount context the table forwards to.
    pub fn context(&self) -> &Arc<MountContext<N>> {
        &self.ctx
    }

    /// True when mutating calls are refused with `EROFS`.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// How long the kernel may cache attributes.
    pub fn attr_ttl(&self) -> Duration {
        self.attr_ttl
    }

    /// How long the kernel may cache name lookups.
    pub fn entry_ttl(&self) -> Duration {
        self.entry_ttl
    }

    /// Signals that the filesystem is up; runs the mount notice and starts
    /// idle supervision.
    pub fn mounted(&self) {
        debug!("filesystem mounted at {}", self.ctx.config().opts.mount_point);
        self.ctx.mounted();
    }

    fn with_root<T>(&self, op: impl FnOnce(&N) -> OpResult<T>) -> OpResult<T> {
        self.ctx.record_activity();
        match self.ctx.root().as_ref() {
            Some(root) => op(root),
            None => Err(EIO),
        }
    }

    fn writable(&self) -> OpResult<()> {
        if self.read_only {
            Err(EROFS)
        } else {
            Ok(())
        }
    }

    fn reply_entry(&self, result: OpResult<FileAttr>, reply: ReplyEntry) {
        match result {
            Ok(attr) => reply.entry(&self.entry_ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn reply_empty(result: OpResult<()>, reply: ReplyEmpty) {
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn reply_xattr(result: OpResult<Vec<u8>>, size: u32, reply: ReplyXattr) {
        match result {
            Ok(data) if size == 0 => reply.size(data.len() as u32),
            Ok(data) if data.len() > size as usize => reply.error(ERANGE),
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }
}

fn wants_write(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0
}

impl<N: RootNode> Filesystem for OperationTable<N> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        self.mounted();
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!("lookup parent: {}, name: {:?}", parent, name);
        let result = self.with_root(|root| root.lookup(parent, name));
        self.reply_entry(result, reply);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.with_root(|root| root.getattr(ino)) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = AttrChanges {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
            fh,
        };
        let result = self.with_root(|root| {
            self.writable()?;
            root.setattr(ino, &changes)
        });
        match result {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.with_root(|root| root.readlink(ino)) {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self.with_root(|root| {
            self.writable()?;
            root.mknod(parent, name, mode & !umask, rdev)
        });
        self.reply_entry(result, reply);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.with_root(|root| {
            self.writable()?;
            root.mkdir(parent, name, mode & !umask)
        });
        self.reply_entry(result, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.with_root(|root| {
            self.writable()?;
            root.unlink(parent, name)
        });
        Self::reply_empty(result, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.with_root(|root| {
            self.writable()?;
            root.rmdir(parent, name)
        });
        Self::reply_empty(result, reply);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.with_root(|root| {
            self.writable()?;
            root.symlink(parent, link_name, target)
        });
        self.reply_entry(result, reply);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.with_root(|root| {
            self.writable()?;
            root.rename(parent, name, newparent, newname)
        });
        Self::reply_empty(result, reply);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.with_root(|root| {
            self.writable()?;
            root.link(ino, newparent, newname)
        });
        self.reply_entry(result, reply);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let result = self.with_root(|root| {
            if wants_write(flags) {
                self.writable()?;
            }
            root.open(ino, flags)
        });
        match result {
            Ok(fh) => {
                self.ctx.file_opened();
                reply.opened(fh, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.with_root(|root| {
            self.writable()?;
            root.create(parent, name, mode & !umask, flags)
        });
        match result {
            Ok((attr, fh)) => {
                self.ctx.file_opened();
                reply.created(&self.entry_ttl, &attr, 0, fh, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.with_root(|root| root.read(ino, fh, offset, size)) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self.with_root(|root| {
            self.writable()?;
            root.write(ino, fh, offset, data)
        });
        match result {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let result = self.with_root(|root| root.flush(ino, fh));
        Self::reply_empty(result, reply);
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let result = self.with_root(|root| root.release(ino, fh));
        self.ctx.file_released();
        Self::reply_empty(result, reply);
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let result = self.with_root(|root| root.fsync(ino, fh, datasync));
        Self::reply_empty(result, reply);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.with_root(|root| root.readdir(ino)) {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let dots = [
            (ino, FileType::Directory, OsString::from(".")),
            (ino, FileType::Directory, OsString::from("..")),
        ];
        let listing = dots
            .into_iter()
            .chain(entries.into_iter().map(|e| (e.ino, e.kind, e.name)));

        for (i, (entry_ino, kind, name)) in listing.enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        match self.with_root(|root| root.statfs(ino)) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                st.frsize,
            ),
            Err(errno) => reply.error(errno),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.with_root(|root| {
            self.writable()?;
            root.setxattr(ino, name, value, flags)
        });
        Self::reply_empty(result, reply);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let result = self.with_root(|root| root.getxattr(ino, name));
        Self::reply_xattr(result, size, reply);
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let result = self.with_root(|root| root.listxattr(ino));
        Self::reply_xattr(result, size, reply);
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.with_root(|root| {
            self.writable()?;
            root.removexattr(ino, name)
        });
        Self::reply_empty(result, reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::context::Unmounter;
    use crate::modules::options::Config;
    use anyhow::Result;
    use fuser::FileAttr;
    use libc::ENOENT;
    use std::time::UNIX_EPOCH;

    fn dir_attr(ino: u64) -> FileAttr {
        FileAttr {
            ino,
            size: 0,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            flags: 0,
            blksize: 512,
        }
    }

    struct FixedRoot;

    impl RootNode for FixedRoot {
        fn lookup(&self, _parent: u64, name: &OsStr) -> OpResult<FileAttr> {
            if name == "docs" {
                Ok(dir_attr(2))
            } else {
                Err(ENOENT)
            }
        }

        fn getattr(&self, ino: u64) -> OpResult<FileAttr> {
            Ok(dir_attr(ino))
        }

        fn readdir(&self, _ino: u64) -> OpResult<Vec<DirEntry>> {
            Ok(vec![DirEntry {
                ino: 2,
                kind: FileType::Directory,
                name: OsString::from("docs"),
            }])
        }
    }

    struct NoUnmount;

    impl Unmounter for NoUnmount {
        fn unmount(&self, _mount_point: &str) -> Result<()> {
            Ok(())
        }
    }

    fn table(configure: impl FnOnce(&mut Config)) -> OperationTable<FixedRoot> {
        let mut config = Config::defaults("encmount");
        configure(&mut config);
        let ctx = MountContext::new(Arc::new(config), Arc::new(NoUnmount));
        OperationTable::assemble(Arc::new(ctx))
    }

    #[test]
    fn test_default_operations_are_unsupported() {
        let root = FixedRoot;
        assert_eq!(root.readlink(2), Err(ENOSYS));
        assert_eq!(root.open(2, libc::O_RDONLY), Err(ENOSYS));
        assert_eq!(root.statfs(1).unwrap_err(), ENOSYS);
        assert_eq!(root.listxattr(1).unwrap_err(), ENOSYS);
    }

    #[test]
    fn test_calls_without_root_fail_with_eio() {
        let table = table(|_| {});
        assert_eq!(table.with_root(|root| root.getattr(1)).unwrap_err(), EIO);
    }

    #[test]
    fn test_calls_reach_attached_root() {
        let table = table(|_| {});
        table.context().attach_root(FixedRoot).unwrap();

        let attr = table
            .with_root(|root| root.lookup(1, OsStr::new("docs")))
            .unwrap();
        assert_eq!(attr.ino, 2);
        assert_eq!(
            table
                .with_root(|root| root.lookup(1, OsStr::new("missing")))
                .unwrap_err(),
            ENOENT
        );
    }

    #[test]
    fn test_every_call_counts_as_activity() {
        let table = table(|config| config.idle_timeout = 1);
        table.context().attach_root(FixedRoot).unwrap();

        assert!(!table.context().usage_and_unmount(2));
        let _ = table.with_root(|root| root.getattr(1));
        assert!(!table.context().usage_and_unmount(2));
        assert!(!table.context().usage_and_unmount(2));
        assert!(table.context().usage_and_unmount(2));
    }

    #[test]
    fn test_read_only_refuses_mutations() {
        let table = table(|config| config.opts.read_only = true);
        assert!(table.is_read_only());
        assert_eq!(table.writable(), Err(EROFS));

        let writable = self::table(|_| {});
        assert_eq!(writable.writable(), Ok(()));
    }

    #[test]
    fn test_write_intent_from_open_flags() {
        assert!(!wants_write(libc::O_RDONLY));
        assert!(wants_write(libc::O_WRONLY));
        assert!(wants_write(libc::O_RDWR | libc::O_APPEND));
        assert!(wants_write(libc::O_RDONLY | libc::O_TRUNC));
    }

    #[test]
    fn test_attribute_cache_follows_options() {
        let cached = table(|_| {});
        assert_eq!(cached.attr_ttl, TTL);
        assert_eq!(cached.entry_ttl, TTL);

        let uncached = table(|config| config.opts.no_attr_cache = true);
        assert_eq!(uncached.attr_ttl, NO_TTL);
        assert_eq!(uncached.entry_ttl, NO_TTL);
    }

    #[test]
    fn test_cache_timeout_options_override_defaults() {
        let table = table(|_| {}).with_cache_timeouts(Some(NO_TTL), None);
        assert_eq!(table.attr_ttl(), NO_TTL);
        assert_eq!(table.entry_ttl(), TTL);

        let table = self::table(|config| config.opts.no_attr_cache = true)
            .with_cache_timeouts(None, Some(Duration::from_millis(1500)));
        assert_eq!(table.attr_ttl(), NO_TTL);
        assert_eq!(table.entry_ttl(), Duration::from_millis(1500));
    }

    #[test]
    fn test_mounted_starts_supervisor_only_with_idle_timeout() {
        let plain = table(|_| {});
        plain.mounted();
        assert!(!plain.context().has_supervisor());

        let idle = table(|config| config.idle_timeout = 5);
        idle.context().attach_root(FixedRoot).unwrap();
        idle.mounted();
        assert!(idle.context().has_supervisor());
        idle.context().stop_supervisor();
    }
}
