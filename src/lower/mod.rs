//! Lower filesystem contract
//!
//! The stacking layer never touches storage itself. Everything persistent is
//! owned by a lower filesystem reached through [`LowerFs`]. Lower objects are
//! opaque `Copy` handles; the lower filesystem alone decides what they refer to
//! and serializes its own object graph.

mod dcache;
mod host;
mod memory;

use crate::error::Result;
use crate::vm::LowerVmOps;
use bitflags::bitflags;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::time::SystemTime;

pub use host::HostFs;
pub use memory::{MemFs, MAX_MEM_FILE_SIZE};

/// Handle to a lower directory entry (name + parent link, possibly negative)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LowerEntry(pub u64);

/// Handle to a lower object (inode)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LowerNode(pub u64);

/// Handle to an open lower file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LowerFile(pub u64);

/// File type of a lower object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// Decode the `S_IFMT` bits of a mode; bare permission bits mean a regular file
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => FileKind::Directory,
            m if m == libc::S_IFLNK as u32 => FileKind::Symlink,
            m if m == libc::S_IFBLK as u32 => FileKind::BlockDevice,
            m if m == libc::S_IFCHR as u32 => FileKind::CharDevice,
            m if m == libc::S_IFIFO as u32 => FileKind::Fifo,
            m if m == libc::S_IFSOCK as u32 => FileKind::Socket,
            _ => FileKind::RegularFile,
        }
    }

    /// `S_IFMT` bits for this kind
    pub fn mode_bits(&self) -> u32 {
        (match self {
            FileKind::RegularFile => libc::S_IFREG,
            FileKind::Directory => libc::S_IFDIR,
            FileKind::Symlink => libc::S_IFLNK,
            FileKind::BlockDevice => libc::S_IFBLK,
            FileKind::CharDevice => libc::S_IFCHR,
            FileKind::Fifo => libc::S_IFIFO,
            FileKind::Socket => libc::S_IFSOCK,
        }) as u32
    }

    pub fn to_fuser_type(&self) -> fuser::FileType {
        match self {
            FileKind::RegularFile => fuser::FileType::RegularFile,
            FileKind::Directory => fuser::FileType::Directory,
            FileKind::Symlink => fuser::FileType::Symlink,
            FileKind::BlockDevice => fuser::FileType::BlockDevice,
            FileKind::CharDevice => fuser::FileType::CharDevice,
            FileKind::Fifo => fuser::FileType::NamedPipe,
            FileKind::Socket => fuser::FileType::Socket,
        }
    }
}

impl From<std::fs::FileType> for FileKind {
    fn from(ft: std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::RegularFile
        }
    }
}

/// Attributes of a lower object as reported by a live query
#[derive(Debug, Clone, PartialEq)]
pub struct LowerAttr {
    pub kind: FileKind,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl LowerAttr {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        let ts = |secs: i64, nsecs: i64| {
            if secs >= 0 {
                SystemTime::UNIX_EPOCH + std::time::Duration::new(secs as u64, nsecs as u32)
            } else {
                SystemTime::UNIX_EPOCH
            }
        };
        Self {
            kind: FileKind::from(meta.file_type()),
            size: meta.len(),
            blocks: meta.blocks(),
            atime: ts(meta.atime(), meta.atime_nsec()),
            mtime: ts(meta.mtime(), meta.mtime_nsec()),
            ctime: ts(meta.ctime(), meta.ctime_nsec()),
            crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
        }
    }
}

/// Snapshot of a lower entry's namespace position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: OsString,
    /// `None` only for the lower root
    pub parent: Option<LowerEntry>,
    /// `None` for a negative entry
    pub node: Option<LowerNode>,
    /// False once the entry has been detached from its parent
    pub hashed: bool,
    /// Entry was renamed away to defer deletion of a still-open file
    pub silly_renamed: bool,
}

impl EntryInfo {
    pub fn is_negative(&self) -> bool {
        self.node.is_none()
    }
}

/// Directory listing record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerDirEntry {
    pub name: OsString,
    pub kind: FileKind,
    pub ino: u64,
}

bitflags! {
    /// Capabilities a lower object advertises
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// Extended attributes are supported
        const XATTR = 1 << 0;
        /// Files can be memory-mapped
        const MMAP = 1 << 1;
    }
}

bitflags! {
    /// Extended attribute set intent
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XattrFlags: u32 {
        const CREATE = libc::XATTR_CREATE as u32;
        const REPLACE = libc::XATTR_REPLACE as u32;
    }
}

bitflags! {
    /// Which fields of a [`SetAttr`] are meaningful
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttrMask: u32 {
        const MODE = 1 << 0;
        const UID = 1 << 1;
        const GID = 1 << 2;
        const SIZE = 1 << 3;
        const ATIME = 1 << 4;
        const MTIME = 1 << 5;
        const CTIME = 1 << 6;
        /// The request was issued through an open file
        const FILE = 1 << 7;
        /// Clear the set-user-ID bit as a side effect of a write or chown
        const KILL_SUID = 1 << 8;
        /// Clear the set-group-ID bit as a side effect of a write or chown
        const KILL_SGID = 1 << 9;
    }
}

/// Attribute change request; `F` is the file handle type of the layer issuing it
#[derive(Debug, Clone, PartialEq)]
pub struct SetAttr<F = LowerFile> {
    pub valid: AttrMask,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub file: Option<F>,
}

impl<F> Default for SetAttr<F> {
    fn default() -> Self {
        Self {
            valid: AttrMask::empty(),
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            file: None,
        }
    }
}

impl<F> SetAttr<F> {
    pub fn size(size: u64) -> Self {
        Self {
            valid: AttrMask::SIZE,
            size,
            ..Default::default()
        }
    }

    pub fn mode(mode: u32) -> Self {
        Self {
            valid: AttrMask::MODE,
            mode,
            ..Default::default()
        }
    }

    /// Same request bound to another layer's file handle
    pub fn with_file<G>(self, file: Option<G>) -> SetAttr<G> {
        let mut valid = self.valid;
        if file.is_none() {
            valid.remove(AttrMask::FILE);
        }
        SetAttr {
            valid,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            file,
        }
    }
}

/// Operations the stacking layer invokes on the filesystem below it.
///
/// Every primitive follows POSIX success/errno semantics: failures come back as
/// [`crate::Error::Lower`] and are forwarded upward unchanged. Directory
/// serialization for structural primitives is done by the caller; backends only
/// guard their own internal state.
pub trait LowerFs: Send + Sync + 'static {
    /// Root entry of the lower namespace
    fn root(&self) -> LowerEntry;

    /// Capabilities advertised by a lower object
    fn capabilities(&self, node: LowerNode) -> Capabilities;

    /// Take a reference on an entry
    fn dget(&self, entry: LowerEntry) -> Result<()>;

    /// Drop a reference taken with [`LowerFs::dget`] or returned by [`LowerFs::lookup`]
    fn dput(&self, entry: LowerEntry);

    /// Current namespace position of an entry
    fn entry(&self, entry: LowerEntry) -> Result<EntryInfo>;

    /// Resolve `name` under `dir`; the result may be negative and carries one
    /// reference owned by the caller
    fn lookup(&self, dir: LowerEntry, name: &OsStr) -> Result<LowerEntry>;

    fn create(&self, dir: LowerNode, entry: LowerEntry, mode: u32) -> Result<()>;
    fn link(&self, old: LowerEntry, dir: LowerNode, new: LowerEntry) -> Result<()>;
    fn unlink(&self, dir: LowerNode, entry: LowerEntry) -> Result<()>;
    fn symlink(&self, dir: LowerNode, entry: LowerEntry, target: &OsStr) -> Result<()>;
    fn mkdir(&self, dir: LowerNode, entry: LowerEntry, mode: u32) -> Result<()>;
    fn rmdir(&self, dir: LowerNode, entry: LowerEntry) -> Result<()>;
    fn mknod(&self, dir: LowerNode, entry: LowerEntry, mode: u32, rdev: u32) -> Result<()>;
    fn rename(
        &self,
        old_dir: LowerNode,
        old: LowerEntry,
        new_dir: LowerNode,
        new: LowerEntry,
    ) -> Result<()>;

    fn readlink(&self, entry: LowerEntry) -> Result<OsString>;
    fn permission(&self, node: LowerNode, mask: i32) -> Result<()>;

    /// Live attribute query
    fn getattr(&self, node: LowerNode) -> Result<LowerAttr>;
    fn setattr(&self, entry: LowerEntry, attr: &SetAttr) -> Result<()>;

    fn getxattr(&self, entry: LowerEntry, name: &OsStr) -> Result<Vec<u8>>;
    fn setxattr(&self, entry: LowerEntry, name: &OsStr, value: &[u8], flags: XattrFlags)
        -> Result<()>;
    fn listxattr(&self, entry: LowerEntry) -> Result<Vec<OsString>>;
    fn removexattr(&self, entry: LowerEntry, name: &OsStr) -> Result<()>;

    fn open(&self, entry: LowerEntry, flags: i32) -> Result<LowerFile>;
    fn release(&self, file: LowerFile);
    fn read(&self, file: LowerFile, offset: u64, size: u32) -> Result<Vec<u8>>;
    fn write(&self, file: LowerFile, offset: u64, data: &[u8]) -> Result<u32>;
    fn readdir(&self, dir: LowerEntry) -> Result<Vec<LowerDirEntry>>;

    /// Mapping operations for an open file
    fn vm_ops(&self, file: LowerFile) -> Result<Arc<dyn LowerVmOps>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_kind_from_mode() {
        assert_eq!(FileKind::from_mode(0o644), FileKind::RegularFile);
        assert_eq!(
            FileKind::from_mode(libc::S_IFDIR as u32 | 0o755),
            FileKind::Directory
        );
        assert_eq!(
            FileKind::from_mode(libc::S_IFIFO as u32 | 0o600),
            FileKind::Fifo
        );
        assert_eq!(
            FileKind::from_mode(FileKind::CharDevice.mode_bits()),
            FileKind::CharDevice
        );
    }

    #[test]
    fn test_with_file_drops_file_flag() {
        let mut req: SetAttr<u64> = SetAttr::size(10);
        req.valid |= AttrMask::FILE;
        req.file = Some(7);

        let bound = req.clone().with_file(Some(LowerFile(3)));
        assert!(bound.valid.contains(AttrMask::FILE));
        assert_eq!(bound.file, Some(LowerFile(3)));

        let unbound: SetAttr<LowerFile> = req.with_file(None);
        assert!(!unbound.valid.contains(AttrMask::FILE));
        assert_eq!(unbound.size, 10);
    }
}
