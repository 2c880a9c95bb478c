//! Null-cipher engine.
//!
//! Presents the root directory unchanged: names and contents pass through
//! as-is. It is only available behind `--insecure` and exists so the mount
//! lifecycle can run end to end without a cipher configuration.

use super::constants::{INITIAL_INODE, ROOT_INODE};
use super::operations::{AttrChanges, DirEntry, OpResult, RootNode, StatFs};
use super::options::Config;
use anyhow::{bail, Result};
use fuser::{FileAttr, FileType, TimeOrNow};
use libc::{c_int, EBADF, EIO, ENOENT};
use log::{debug, warn};
use nix::sys::statvfs::statvfs;
use nix::unistd::{chown, Gid, Uid};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, DirBuilder, File, FileTimes, Metadata, OpenOptions, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{
    DirBuilderExt, FileExt, FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Opens the root directory with the null cipher.
pub fn init_fs(config: &Config) -> Result<PlainRoot> {
    let opts = &config.opts;
    if !opts.insecure {
        bail!(
            "no cipher configuration is available for {}; \
             mounting without encryption requires --insecure",
            opts.root_dir
        );
    }
    if opts.require_mac {
        bail!("the null cipher carries no block MACs, refusing --require-macs");
    }

    let base = PathBuf::from(&opts.root_dir);
    if !base.is_dir() {
        bail!("root directory {} is not a directory", opts.root_dir);
    }

    warn!(
        "{} is mounted without encryption, file data is stored in plaintext",
        opts.root_dir
    );
    Ok(PlainRoot::new(base))
}

/// Maps inode numbers to paths relative to the root directory.
#[derive(Debug)]
struct InodeTable {
    by_ino: HashMap<u64, PathBuf>,
    by_path: HashMap<PathBuf, u64>,
    next_inode: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next_inode: INITIAL_INODE,
        };
        table.by_ino.insert(ROOT_INODE, PathBuf::new());
        table.by_path.insert(PathBuf::new(), ROOT_INODE);
        table
    }

    fn path(&self, ino: u64) -> Option<&Path> {
        self.by_ino.get(&ino).map(PathBuf::as_path)
    }

    fn assign(&mut self, rel: &Path) -> u64 {
        if let Some(&ino) = self.by_path.get(rel) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.by_ino.insert(ino, rel.to_path_buf());
        self.by_path.insert(rel.to_path_buf(), ino);
        ino
    }

    fn forget(&mut self, rel: &Path) {
        if let Some(ino) = self.by_path.remove(rel) {
            self.by_ino.remove(&ino);
        }
    }

    /// Moves `from` and everything below it to `to`.
    fn rename(&mut self, from: &Path, to: &Path) {
        self.forget(to);
        let moved: Vec<(PathBuf, u64)> = self
            .by_path
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();

        for (old, ino) in moved {
            let new = match old.strip_prefix(from) {
                Ok(suffix) if suffix.as_os_str().is_empty() => to.to_path_buf(),
                Ok(suffix) => to.join(suffix),
                Err(_) => continue,
            };
            self.by_path.remove(&old);
            self.by_path.insert(new.clone(), ino);
            self.by_ino.insert(ino, new);
        }
    }
}

/// Passthrough root node over a backing directory.
pub struct PlainRoot {
    base: PathBuf,
    inodes: Mutex<InodeTable>,
    handles: Mutex<HashMap<u64, File>>,
    next_fh: AtomicU64,
}

fn errno(e: io::Error) -> c_int {
    e.raw_os_error().unwrap_or(EIO)
}

fn file_kind(file_type: fs::FileType) -> FileType {
    if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_symlink() {
        FileType::Symlink
    } else if file_type.is_block_device() {
        FileType::BlockDevice
    } else if file_type.is_char_device() {
        FileType::CharDevice
    } else if file_type.is_fifo() {
        FileType::NamedPipe
    } else if file_type.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH
    }
}

fn file_attr(ino: u64, metadata: &Metadata) -> FileAttr {
    FileAttr {
        ino,
        size: metadata.len(),
        blocks: metadata.blocks(),
        atime: metadata.accessed().unwrap_or(UNIX_EPOCH),
        mtime: metadata.modified().unwrap_or(UNIX_EPOCH),
        ctime: system_time(metadata.ctime(), metadata.ctime_nsec()),
        crtime: metadata.created().unwrap_or(UNIX_EPOCH),
        kind: file_kind(metadata.file_type()),
        perm: (metadata.mode() & 0o7777) as u16,
        nlink: metadata.nlink() as u32,
        uid: metadata.uid(),
        gid: metadata.gid(),
        rdev: metadata.rdev() as u32,
        flags: 0,
        blksize: metadata.blksize() as u32,
    }
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl PlainRoot {
    /// Serves the directory tree below `base`.
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            inodes: Mutex::new(InodeTable::new()),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn relative(&self, ino: u64) -> OpResult<PathBuf> {
        self.inodes
            .lock()
            .path(ino)
            .map(Path::to_path_buf)
            .ok_or(ENOENT)
    }

    fn full_path(&self, ino: u64) -> OpResult<PathBuf> {
        Ok(self.base.join(self.relative(ino)?))
    }

    fn child(&self, parent: u64, name: &OsStr) -> OpResult<(PathBuf, PathBuf)> {
        let rel = self.relative(parent)?.join(name);
        let full = self.base.join(&rel);
        Ok((rel, full))
    }

    fn entry_attr(&self, rel: &Path, full: &Path) -> OpResult<FileAttr> {
        let metadata = fs::symlink_metadata(full).map_err(errno)?;
        let ino = self.inodes.lock().assign(rel);
        Ok(file_attr(ino, &metadata))
    }

    fn store_handle(&self, file: File) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(fh, file);
        fh
    }

    fn with_handle<T>(&self, fh: u64, op: impl FnOnce(&File) -> io::Result<T>) -> OpResult<T> {
        let handles = self.handles.lock();
        let file = handles.get(&fh).ok_or(EBADF)?;
        op(file).map_err(errno)
    }
}

fn open_options(flags: i32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    options
        .append(flags & libc::O_APPEND != 0)
        .custom_flags(flags & !(libc::O_ACCMODE | libc::O_APPEND | libc::O_CREAT | libc::O_EXCL));
    options
}

impl RootNode for PlainRoot {
    fn lookup(&self, parent: u64, name: &OsStr) -> OpResult<FileAttr> {
        let (rel, full) = self.child(parent, name)?;
        self.entry_attr(&rel, &full)
    }

    fn getattr(&self, ino: u64) -> OpResult<FileAttr> {
        let metadata = fs::symlink_metadata(self.full_path(ino)?).map_err(errno)?;
        Ok(file_attr(ino, &metadata))
    }

    fn readdir(&self, ino: u64) -> OpResult<Vec<DirEntry>> {
        let rel = self.relative(ino)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.base.join(&rel)).map_err(errno)? {
            let entry = entry.map_err(errno)?;
            let name = entry.file_name();
            let kind = entry.file_type().map(file_kind).map_err(errno)?;
            let ino = self.inodes.lock().assign(&rel.join(&name));
            entries.push(DirEntry { ino, kind, name });
        }
        Ok(entries)
    }

    fn setattr(&self, ino: u64, changes: &AttrChanges) -> OpResult<FileAttr> {
        let path = self.full_path(ino)?;

        if let Some(mode) = changes.mode {
            fs::set_permissions(&path, Permissions::from_mode(mode)).map_err(errno)?;
        }

        if changes.uid.is_some() || changes.gid.is_some() {
            chown(
                path.as_path(),
                changes.uid.map(Uid::from_raw),
                changes.gid.map(Gid::from_raw),
            )
            .map_err(|e| e as c_int)?;
        }

        if let Some(size) = changes.size {
            match changes.fh {
                Some(fh) => self.with_handle(fh, |file| file.set_len(size))?,
                None => OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .and_then(|file| file.set_len(size))
                    .map_err(errno)?,
            }
        }

        if changes.atime.is_some() || changes.mtime.is_some() {
            let mut times = FileTimes::new();
            if let Some(atime) = changes.atime {
                times = times.set_accessed(resolve_time(atime));
            }
            if let Some(mtime) = changes.mtime {
                times = times.set_modified(resolve_time(mtime));
            }
            File::open(&path)
                .and_then(|file| file.set_times(times))
                .map_err(errno)?;
        }

        self.getattr(ino)
    }

    fn readlink(&self, ino: u64) -> OpResult<Vec<u8>> {
        let target = fs::read_link(self.full_path(ino)?).map_err(errno)?;
        Ok(target.as_os_str().as_bytes().to_vec())
    }

    fn mkdir(&self, parent: u64, name: &OsStr, mode: u32) -> OpResult<FileAttr> {
        let (rel, full) = self.child(parent, name)?;
        DirBuilder::new().mode(mode).create(&full).map_err(errno)?;
        self.entry_attr(&rel, &full)
    }

    fn unlink(&self, parent: u64, name: &OsStr) -> OpResult<()> {
        let (rel, full) = self.child(parent, name)?;
        fs::remove_file(&full).map_err(errno)?;
        self.inodes.lock().forget(&rel);
        Ok(())
    }

    fn rmdir(&self, parent: u64, name: &OsStr) -> OpResult<()> {
        let (rel, full) = self.child(parent, name)?;
        fs::remove_dir(&full).map_err(errno)?;
        self.inodes.lock().forget(&rel);
        Ok(())
    }

    fn symlink(&self, parent: u64, name: &OsStr, target: &Path) -> OpResult<FileAttr> {
        let (rel, full) = self.child(parent, name)?;
        std::os::unix::fs::symlink(target, &full).map_err(errno)?;
        self.entry_attr(&rel, &full)
    }

    fn rename(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> OpResult<()> {
        let (from_rel, from) = self.child(parent, name)?;
        let (to_rel, to) = self.child(new_parent, new_name)?;
        fs::rename(&from, &to).map_err(errno)?;
        self.inodes.lock().rename(&from_rel, &to_rel);
        Ok(())
    }

    fn link(&self, ino: u64, new_parent: u64, new_name: &OsStr) -> OpResult<FileAttr> {
        let source = self.full_path(ino)?;
        let (rel, full) = self.child(new_parent, new_name)?;
        fs::hard_link(&source, &full).map_err(errno)?;
        self.entry_attr(&rel, &full)
    }

    fn open(&self, ino: u64, flags: i32) -> OpResult<u64> {
        let path = self.full_path(ino)?;
        let file = open_options(flags).open(&path).map_err(errno)?;
        debug!("opened {} with flags {:#o}", path.display(), flags);
        Ok(self.store_handle(file))
    }

    fn create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: i32,
    ) -> OpResult<(FileAttr, u64)> {
        let (rel, full) = self.child(parent, name)?;
        let mut options = open_options(flags);
        if flags & libc::O_ACCMODE == libc::O_RDONLY {
            options.write(true);
        }
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        } else {
            options.create(true);
        }
        let file = options.mode(mode).open(&full).map_err(errno)?;
        let attr = self.entry_attr(&rel, &full)?;
        Ok((attr, self.store_handle(file)))
    }

    fn read(&self, _ino: u64, fh: u64, offset: i64, size: u32) -> OpResult<Vec<u8>> {
        self.with_handle(fh, |file| {
            let mut buf = vec![0; size as usize];
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read_at(&mut buf[filled..], offset as u64 + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(buf)
        })
    }

    fn write(&self, _ino: u64, fh: u64, offset: i64, data: &[u8]) -> OpResult<u32> {
        self.with_handle(fh, |file| {
            file.write_all_at(data, offset as u64)?;
            Ok(data.len() as u32)
        })
    }

    fn flush(&self, _ino: u64, fh: u64) -> OpResult<()> {
        self.with_handle(fh, |_| Ok(()))
    }

    fn release(&self, _ino: u64, fh: u64) -> OpResult<()> {
        match self.handles.lock().remove(&fh) {
            Some(_) => Ok(()),
            None => Err(EBADF),
        }
    }

    fn fsync(&self, _ino: u64, fh: u64, datasync: bool) -> OpResult<()> {
        self.with_handle(fh, |file| {
            if datasync {
                file.sync_data()
            } else {
                file.sync_all()
            }
        })
    }

    fn statfs(&self, _ino: u64) -> OpResult<StatFs> {
        let st = statvfs(self.base.as_path()).map_err(|e| e as c_int)?;
        Ok(StatFs {
            blocks: st.blocks() as u64,
            bfree: st.blocks_free() as u64,
            bavail: st.blocks_available() as u64,
            files: st.files() as u64,
            ffree: st.files_free() as u64,
            bsize: st.block_size() as u32,
            namelen: st.name_max() as u32,
            frsize: st.fragment_size() as u32,
        })
    }
}
