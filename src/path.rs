//! Filesystem path primitives.
//!
//! [`HostPath`] wraps a host-side path and provides the low-level
//! operations the engine needs: lexical normalization, prefix tests,
//! mount and bind operations, a recursive clear that refuses to cross
//! mount points, the private-write sequence used for `/etc/hostname` and
//! `/etc/resolv.conf`, and hole-punching log rotation.
//!
//! Everything here works on the host mount namespace unless executed
//! from inside a launcher child, where the same primitives run against
//! the freshly created namespace.

use crate::error::{Error, ErrorKind, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::ffi::CString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Hard cap for whole-file reads unless the caller asks for more.
const READ_ALL_DEFAULT_MAX: usize = 2 * 1024 * 1024;

/// A host filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HostPath(PathBuf);

impl HostPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn root() -> Self {
        Self(PathBuf::from("/"))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.to_str().unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.0.as_os_str() == "/"
    }

    pub fn is_absolute(&self) -> bool {
        self.0.is_absolute()
    }

    pub fn join(&self, other: impl AsRef<Path>) -> Self {
        let other = other.as_ref();
        let other = other.strip_prefix("/").unwrap_or(other);
        Self(self.0.join(other))
    }

    pub fn dir_name(&self) -> Self {
        match self.0.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => Self(parent.to_path_buf()),
            Some(_) => Self(PathBuf::from(".")),
            None => Self(self.0.clone()),
        }
    }

    pub fn base_name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Resolves `.` and `..` lexically, without touching the disk.
    /// Leading `..` components of a relative path are preserved.
    pub fn normalize(&self) -> Self {
        let text = self.as_str();
        let absolute = self.is_absolute();
        let mut parts: Vec<&str> = Vec::new();

        for comp in text.split('/') {
            match comp {
                "" | "." => continue,
                ".." => {
                    match parts.last() {
                        Some(&"..") | None => {
                            if !absolute {
                                parts.push("..");
                            }
                            // "/.." stays "/"
                        }
                        Some(_) => {
                            parts.pop();
                        }
                    }
                }
                comp => parts.push(comp),
            }
        }

        let mut out = String::new();
        if absolute {
            out.push('/');
        }
        out.push_str(&parts.join("/"));
        if out.is_empty() {
            out.push('.');
        }
        Self(PathBuf::from(out))
    }

    /// True if the normalized path escapes upward.
    pub fn is_dotdot(&self) -> bool {
        let normal = self.normalize();
        normal.as_str() == ".." || normal.as_str().starts_with("../")
    }

    /// Returns the part of `path` below `self`, as an absolute path, if
    /// `path` starts with `self` at a `/` boundary.
    ///
    /// `"/root".inner("/root/foo") == Some("/foo")`,
    /// `"/root".inner("/rootfoo") == None`,
    /// `"/root".inner("/root") == Some("/")`.
    pub fn inner(&self, path: &HostPath) -> Option<HostPath> {
        let prefix = self.as_str();
        let full = path.as_str();

        if prefix.is_empty() || !full.starts_with(prefix) {
            return None;
        }
        if full.len() == prefix.len() {
            return Some(HostPath::root());
        }
        let boundary = if prefix == "/" { 0 } else { prefix.len() };
        if full.as_bytes()[boundary] != b'/' {
            return None;
        }
        Some(HostPath::new(&full[boundary..]))
    }

    // =========================================================================
    // Stat
    // =========================================================================

    pub fn exists(&self) -> bool {
        // access(2) semantics: follows symlinks.
        self.0.exists() || self.0.symlink_metadata().is_ok()
    }

    pub fn is_regular_follow(&self) -> bool {
        self.0.metadata().map(|m| m.is_file()).unwrap_or(false)
    }

    pub fn is_regular_strict(&self) -> bool {
        self.0
            .symlink_metadata()
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    pub fn is_directory_follow(&self) -> bool {
        self.0.metadata().map(|m| m.is_dir()).unwrap_or(false)
    }

    pub fn is_directory_strict(&self) -> bool {
        self.0
            .symlink_metadata()
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Device of the filesystem holding this path, 0 when unknown.
    pub fn device(&self) -> u64 {
        self.0.metadata().map(|m| m.dev()).unwrap_or(0)
    }

    /// Device number of a block-special node, 0 otherwise.
    pub fn block_device(&self) -> u64 {
        match self.0.metadata() {
            Ok(m) if m.file_type().is_block_device() => m.rdev(),
            _ => 0,
        }
    }

    pub fn is_same_inode(&self, other: &HostPath) -> bool {
        match (self.0.metadata(), other.0.metadata()) {
            (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
            _ => false,
        }
    }

    /// Milliseconds since the last modification, -1 when unknown.
    pub fn since_modification_ms(&self) -> i64 {
        let Ok(meta) = self.0.symlink_metadata() else {
            return -1;
        };
        let Ok(modified) = meta.modified() else {
            return -1;
        };
        match modified.elapsed() {
            Ok(elapsed) => elapsed.as_millis() as i64,
            Err(_) => 0,
        }
    }

    // =========================================================================
    // Plain I/O
    // =========================================================================

    pub fn read_all(&self, max: usize) -> Result<String> {
        let mut file = File::open(&self.0)
            .map_err(|e| Error::from(e).context(format!("open {}", self)))?;
        let size = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
        if size > max {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("file too large: {}", self),
            ));
        }
        let mut text = String::new();
        file.take(max as u64 + 1)
            .read_to_string(&mut text)
            .map_err(|e| Error::from(e).context(format!("read {}", self)))?;
        if text.len() > max {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("file too large: {}", self),
            ));
        }
        Ok(text)
    }

    pub fn read_lines(&self, max: usize) -> Result<Vec<String>> {
        let text = self.read_all(max)?;
        Ok(text.lines().map(str::to_string).collect())
    }

    pub fn write_all(&self, text: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NOCTTY)
            .open(&self.0)
            .map_err(|e| Error::from(e).context(format!("open {}", self)))?;
        file.write_all(text.as_bytes())
            .map_err(|e| Error::from(e).context(format!("write {}", self)))?;
        Ok(())
    }

    pub fn mkdir(&self, mode: u32) -> Result<()> {
        let cpath = self.to_cstring()?;
        if unsafe { libc::mkdir(cpath.as_ptr(), mode as libc::mode_t) } != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            let kind = if errno == libc::ENOSPC {
                ErrorKind::NoSpace
            } else {
                ErrorKind::Unknown
            };
            return Err(Error::with_errno(
                kind,
                errno,
                format!("mkdir({}, {:#o})", self, mode),
            ));
        }
        Ok(())
    }

    pub fn mkdir_all(&self, mode: u32) -> Result<()> {
        let mut missing = Vec::new();
        let mut path = self.clone();
        while !path.exists() {
            missing.push(path.clone());
            path = path.dir_name();
        }
        if !path.is_directory_follow() {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("not a directory: {}", path),
            ));
        }
        for dir in missing.iter().rev() {
            dir.mkdir(mode)?;
        }
        Ok(())
    }

    pub fn rmdir(&self) -> Result<()> {
        std::fs::remove_dir(&self.0)
            .map_err(|e| Error::from(e).context(format!("rmdir({})", self)))
    }

    pub fn unlink(&self) -> Result<()> {
        std::fs::remove_file(&self.0)
            .map_err(|e| Error::from(e).context(format!("unlink({})", self)))
    }

    pub fn rename(&self, dest: &HostPath) -> Result<()> {
        std::fs::rename(&self.0, &dest.0)
            .map_err(|e| Error::from(e).context(format!("rename({}, {})", self, dest)))
    }

    pub fn symlink(&self, target: &HostPath) -> Result<()> {
        std::os::unix::fs::symlink(&target.0, &self.0)
            .map_err(|e| Error::from(e).context(format!("symlink({}, {})", target, self)))
    }

    pub fn read_link(&self) -> Result<HostPath> {
        let target = std::fs::read_link(&self.0)
            .map_err(|e| Error::from(e).context(format!("readlink({})", self)))?;
        Ok(HostPath(target))
    }

    pub fn mknod(&self, mode: u32, dev: u64) -> Result<()> {
        let cpath = self.to_cstring()?;
        if unsafe { libc::mknod(cpath.as_ptr(), mode as libc::mode_t, dev as libc::dev_t) } != 0 {
            return Err(Error::sys(format!("mknod({}, {:#o}, {:#x})", self, mode, dev)));
        }
        Ok(())
    }

    /// Creates an empty regular file.
    pub fn mkfile(&self, mode: u32) -> Result<()> {
        self.mknod(libc::S_IFREG | (mode & 0o777), 0)
    }

    pub fn chown(&self, uid: u32, gid: u32) -> Result<()> {
        nix::unistd::chown(
            &self.0,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .map_err(|e| Error::from(e).context(format!("chown({}, {}, {})", self, uid, gid)))
    }

    pub fn chmod(&self, mode: u32) -> Result<()> {
        std::fs::set_permissions(&self.0, std::fs::Permissions::from_mode(mode))
            .map_err(|e| Error::from(e).context(format!("chmod({}, {:#o})", self, mode)))
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(&self.0)
            .map_err(|e| Error::from(e).context(format!("open {}", self)))?;
        file.set_len(size)
            .map_err(|e| Error::from(e).context(format!("truncate({})", self)))
    }

    pub fn set_xattr(&self, name: &str, value: &str) -> Result<()> {
        let cpath = self.to_cstring()?;
        let cname = CString::new(name)
            .map_err(|_| Error::new(ErrorKind::InvalidValue, "xattr name with NUL"))?;
        let ret = unsafe {
            libc::setxattr(
                cpath.as_ptr(),
                cname.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                0,
            )
        };
        if ret != 0 {
            return Err(Error::sys(format!("setxattr({}, {})", self, name)));
        }
        Ok(())
    }

    /// Adds and removes inode attribute flags (`FS_IOC_SETFLAGS`).
    pub fn chattr(&self, add: u32, del: u32) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NOFOLLOW | libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(&self.0)
            .map_err(|e| Error::from(e).context(format!("open {}", self)))?;
        chattr_fd(file.as_raw_fd(), add, del).map_err(|e| e.context(self.to_string()))
    }

    // =========================================================================
    // Recursive Clear
    // =========================================================================

    /// Removes everything inside the directory but not the directory
    /// itself. Stays on one filesystem and fails when it meets a mount
    /// point. Immutable and append-only flags are cleared to unlink
    /// protected files.
    pub fn clear_directory(&self) -> Result<()> {
        debug!(path = %self, "clear directory");
        let meta = self
            .0
            .symlink_metadata()
            .map_err(|e| Error::from(e).context(format!("clear {}", self)))?;
        clear_dir_at(&self.0, meta.dev())
    }

    /// Removes the path and, for directories, everything below it.
    pub fn remove_all(&self) -> Result<()> {
        if self.is_directory_strict() {
            self.clear_directory()?;
            self.rmdir()
        } else {
            self.unlink()
        }
    }

    pub fn list_names(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.0)
            .map_err(|e| Error::from(e).context(format!("opendir({})", self)))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::from(e).context(format!("readdir({})", self)))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    // =========================================================================
    // Mounts
    // =========================================================================

    pub fn mount(
        &self,
        source: &str,
        fstype: &str,
        flags: MsFlags,
        options: &[String],
    ) -> Result<()> {
        let data = options.join(",");
        if data.len() >= 4096 {
            return Err(Error::with_errno(
                ErrorKind::Unknown,
                libc::E2BIG,
                format!("mount options too big: {}", data.len()),
            ));
        }
        debug!(target = %self, source, fstype, ?flags, %data, "mount");
        let data_opt = if data.is_empty() {
            None
        } else {
            Some(data.as_str())
        };
        mount(Some(source), &self.0, Some(fstype), flags, data_opt).map_err(|e| {
            Error::from(e).context(format!("mount({}, {}, {}, {:?})", source, self, fstype, flags))
        })
    }

    pub fn bind(&self, source: &HostPath) -> Result<()> {
        debug!(target = %self, source = %source, "bind mount");
        mount(
            Some(&source.0),
            &self.0,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| Error::from(e).context(format!("bind({}, {})", source, self)))
    }

    pub fn bind_all(&self, source: &HostPath) -> Result<()> {
        debug!(target = %self, source = %source, "bind mount recursive");
        mount(
            Some(&source.0),
            &self.0,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| Error::from(e).context(format!("bind_all({}, {})", source, self)))
    }

    pub fn remount(&self, flags: MsFlags) -> Result<()> {
        debug!(target = %self, ?flags, "remount");
        mount(None::<&str>, &self.0, None::<&str>, flags, None::<&str>)
            .map_err(|e| Error::from(e).context(format!("remount({}, {:?})", self, flags)))
    }

    pub fn bind_remount(&self, source: &HostPath, flags: MsFlags) -> Result<()> {
        self.bind(source)?;
        self.remount(MsFlags::MS_REMOUNT | MsFlags::MS_BIND | flags)
    }

    pub fn umount(&self, flags: MntFlags) -> Result<()> {
        debug!(target = %self, ?flags, "umount");
        umount2(&self.0, flags)
            .map_err(|e| Error::from(e).context(format!("umount2({}, {:?})", self, flags)))
    }

    /// Unmounts everything stacked on this path, detaching busy mounts.
    pub fn umount_all(&self) -> Result<()> {
        debug!(target = %self, "umount all");
        loop {
            match umount2(&self.0, MntFlags::UMOUNT_NOFOLLOW) {
                Ok(()) => continue,
                Err(nix::Error::EINVAL) => return Ok(()), // not a mount point
                Err(nix::Error::EBUSY) => {
                    let _ = umount2(&self.0, MntFlags::UMOUNT_NOFOLLOW | MntFlags::MNT_DETACH);
                }
                Err(err) => {
                    return Err(Error::from(err).context(format!("umount2({})", self)));
                }
            }
        }
    }

    /// Finds the last mount table entry covering this path.
    pub fn find_mount(&self) -> Result<MountInfo> {
        let device = self.device();
        if device == 0 {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("device not found: {}", self),
            ));
        }
        let normal = self.normalize();
        let mut found = None;
        for entry in MountInfo::list_all()? {
            if entry.target.inner(&normal).is_some()
                && (entry.target.device() == device || entry.source.block_device() == device)
            {
                // keep the last matching mount point
                found = Some(entry);
            }
        }
        found.ok_or_else(|| {
            Error::new(ErrorKind::Unknown, format!("mount point not found: {}", self))
        })
    }

    // =========================================================================
    // Private Write
    // =========================================================================

    /// Replaces the file content for this mount namespace only: the text
    /// goes to an unlinked temporary file whose `/proc/self/fd/N` path
    /// is then bind-mounted over the target.
    pub fn write_private(&self, text: &str) -> Result<()> {
        if !self.exists() {
            self.mkfile(0o644)?;
        } else if !self.is_regular_strict() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("non-regular file {}", self),
            ));
        }

        let temp = TempFile::create(&HostPath::new("/run"))?;
        temp.chmod(0o644)?;
        temp.write_all(text)?;

        self.umount_all()?;
        self.bind(&temp.proc_path())
    }

    // =========================================================================
    // Log Rotation
    // =========================================================================

    /// Keeps roughly the last `max_disk_usage / 2` bytes by collapsing a
    /// hole at the head of the file. When the filesystem refuses, the
    /// file is truncated to zero. Returns the number of bytes lost.
    pub fn rotate_log(&self, max_disk_usage: u64) -> Result<u64> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NOCTTY)
            .open(&self.0)
            .map_err(|e| Error::from(e).context(format!("open {}", self)))?;
        let meta = file
            .metadata()
            .map_err(|e| Error::from(e).context(format!("fstat({})", self)))?;

        if !meta.is_file() || meta.blocks() * 512 <= max_disk_usage {
            return Ok(0);
        }

        let mut hole_len = meta.len().saturating_sub(max_disk_usage / 2);
        hole_len -= hole_len % meta.blksize().max(1);
        if hole_len == 0 {
            return Ok(0);
        }

        let ret = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_COLLAPSE_RANGE,
                0,
                hole_len as libc::off_t,
            )
        };
        if ret == 0 {
            return Ok(hole_len);
        }

        let loss = meta.len();
        file.set_len(0)
            .map_err(|e| Error::from(e).context(format!("truncate({})", self)))?;
        Ok(loss)
    }

    fn to_cstring(&self) -> Result<CString> {
        CString::new(self.0.as_os_str().as_bytes())
            .map_err(|_| Error::new(ErrorKind::InvalidValue, "path with NUL byte"))
    }
}

impl fmt::Display for HostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&str> for HostPath {
    fn from(s: &str) -> Self {
        Self(PathBuf::from(s))
    }
}

impl From<String> for HostPath {
    fn from(s: String) -> Self {
        Self(PathBuf::from(s))
    }
}

impl From<PathBuf> for HostPath {
    fn from(p: PathBuf) -> Self {
        Self(p)
    }
}

impl AsRef<Path> for HostPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

const FS_APPEND_FL: u32 = 0x0000_0020;
const FS_IMMUTABLE_FL: u32 = 0x0000_0010;

fn chattr_fd(fd: i32, add: u32, del: u32) -> Result<()> {
    let mut flags: libc::c_long = 0;
    if unsafe { libc::ioctl(fd, libc::FS_IOC_GETFLAGS, &mut flags) } != 0 {
        return Err(Error::sys("ioctl(FS_IOC_GETFLAGS)"));
    }
    let new_flags = (flags & !(del as libc::c_long)) | add as libc::c_long;
    if new_flags != flags && unsafe { libc::ioctl(fd, libc::FS_IOC_SETFLAGS, &new_flags) } != 0 {
        return Err(Error::sys("ioctl(FS_IOC_SETFLAGS)"));
    }
    Ok(())
}

fn clear_dir_at(dir: &Path, top_dev: u64) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::from(e).context(format!("opendir({})", dir.display())))?;

    for entry in entries {
        let entry = entry.map_err(|e| Error::from(e).context("readdir"))?;
        let path = entry.path();
        let meta = match path.symlink_metadata() {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(Error::from(err).context(format!("lstat({})", path.display()))),
        };

        if meta.dev() != top_dev {
            return Err(Error::with_errno(
                ErrorKind::Unknown,
                libc::EXDEV,
                format!("found mount point in {}", dir.display()),
            ));
        }

        if meta.is_dir() {
            clear_dir_at(&path, top_dev)?;
        }

        let removed = if meta.is_dir() {
            std::fs::remove_dir(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match removed {
            Ok(()) => continue,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err)
                if err.raw_os_error() == Some(libc::EPERM)
                    || err.raw_os_error() == Some(libc::EACCES) =>
            {
                // Protected file: drop immutable/append-only on it and on
                // its directory, then retry once.
                let host = HostPath::new(&path);
                if let Err(e) = host.chattr(0, FS_APPEND_FL | FS_IMMUTABLE_FL) {
                    error!(path = %host, error = %e, "cannot clear file attributes");
                }
                let host_dir = HostPath::new(dir);
                if let Err(e) = host_dir.chattr(0, FS_APPEND_FL | FS_IMMUTABLE_FL) {
                    error!(path = %host_dir, error = %e, "cannot clear directory attributes");
                }
                let retried = if meta.is_dir() {
                    std::fs::remove_dir(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                retried
                    .map_err(|e| Error::from(e).context(format!("unlink({})", path.display())))?;
            }
            Err(err) => {
                return Err(Error::from(err).context(format!("unlink({})", path.display())));
            }
        }
    }
    Ok(())
}

/// One `/proc/self/mounts` entry.
#[derive(Debug, Clone)]
pub struct MountInfo {
    pub source: HostPath,
    pub target: HostPath,
    pub fstype: String,
    pub options: String,
}

impl MountInfo {
    /// Parses the whole mount table.
    pub fn list_all() -> Result<Vec<MountInfo>> {
        let text = HostPath::new("/proc/self/mounts").read_all(READ_ALL_DEFAULT_MAX)?;
        let mut list = Vec::new();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(source), Some(target), Some(fstype), Some(options)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                warn!(line, "malformed mount table entry");
                continue;
            };
            list.push(MountInfo {
                source: HostPath::new(unescape_octal(source)),
                target: HostPath::new(unescape_octal(target)),
                fstype: fstype.to_string(),
                options: options.to_string(),
            });
        }
        Ok(list)
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options.split(',').any(|o| o == option)
    }
}

/// Undoes the `\040`-style escapes the kernel uses in the mount table.
fn unescape_octal(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Ok(code) = u8::from_str_radix(&text[i + 1..i + 4], 8) {
                out.push(code as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// An unlinked temporary file, addressable through `/proc/self/fd`.
pub struct TempFile {
    file: File,
}

impl TempFile {
    /// Creates an anonymous file in `dir`, preferring `O_TMPFILE` and
    /// falling back to create-then-unlink.
    pub fn create(dir: &HostPath) -> Result<Self> {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_TMPFILE | libc::O_CLOEXEC)
            .mode(0o600)
            .open(dir.as_path())
        {
            Ok(file) => return Ok(Self { file }),
            Err(err) => {
                debug!(dir = %dir, error = %err, "O_TMPFILE unavailable, falling back");
            }
        }

        let path = dir.join(format!("paddock.tmp.{}", std::process::id()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .custom_flags(libc::O_CLOEXEC)
            .mode(0o600)
            .open(path.as_path())
            .map_err(|e| Error::from(e).context(format!("create temporary in {}", dir)))?;
        path.unlink()?;
        Ok(Self { file })
    }

    pub fn write_all(&self, text: &str) -> Result<()> {
        let mut file = &self.file;
        file.write_all(text.as_bytes())
            .map_err(|e| Error::from(e).context("write temporary"))
    }

    pub fn chmod(&self, mode: u32) -> Result<()> {
        self.file
            .set_permissions(std::fs::Permissions::from_mode(mode))
            .map_err(|e| Error::from(e).context("fchmod temporary"))
    }

    /// The `/proc/self/fd/N` alias for bind-mounting.
    pub fn proc_path(&self) -> HostPath {
        HostPath::new(format!("/proc/self/fd/{}", self.file.as_raw_fd()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(HostPath::from("/a/b/../c").normalize().as_str(), "/a/c");
        assert_eq!(HostPath::from("/a/./b//c/").normalize().as_str(), "/a/b/c");
        assert_eq!(HostPath::from("/..").normalize().as_str(), "/");
        assert_eq!(HostPath::from("a/..").normalize().as_str(), ".");
        assert_eq!(HostPath::from("../a").normalize().as_str(), "../a");
        assert_eq!(HostPath::from("a/../../b").normalize().as_str(), "../b");
    }

    #[test]
    fn test_inner() {
        let root = HostPath::from("/root");
        assert_eq!(
            root.inner(&HostPath::from("/root/foo")).unwrap().as_str(),
            "/foo"
        );
        assert_eq!(root.inner(&HostPath::from("/root")).unwrap().as_str(), "/");
        assert!(root.inner(&HostPath::from("/rootfoo")).is_none());
        assert!(root.inner(&HostPath::from("/foo")).is_none());
        assert_eq!(
            HostPath::root().inner(&HostPath::from("/foo")).unwrap().as_str(),
            "/foo"
        );
    }

    #[test]
    fn test_is_dotdot() {
        assert!(HostPath::from("..").is_dotdot());
        assert!(HostPath::from("a/../..").is_dotdot());
        assert!(!HostPath::from("a/..").is_dotdot());
        assert!(!HostPath::from("/..").is_dotdot());
    }

    #[test]
    fn test_unescape_octal() {
        assert_eq!(unescape_octal("/mnt/with\\040space"), "/mnt/with space");
        assert_eq!(unescape_octal("plain"), "plain");
    }
}
