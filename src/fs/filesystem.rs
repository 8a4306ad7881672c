//! FUSE adapter over the stacking layer
//!
//! Inode numbers handed to the kernel are shadow node indices. Every entry
//! reported by lookup-like calls keeps its shadow entry referenced until the
//! kernel forgets it.

use fuser::{
    FileAttr, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, error};

use crate::config::MountConfig;
use crate::error::{Error, Result};
use crate::lower::{AttrMask, FileKind, LowerFs, SetAttr, XattrFlags};
use crate::stack::{EntryIdx, FileIdx, NodeIdx, RenameFlags, StackFs};
use nix::errno::Errno;

/// Answer to a size-probing xattr request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrReply {
    /// Caller asked for the size only
    Size(u32),
    Data(Vec<u8>),
}

impl XattrReply {
    /// Fit `data` to a caller buffer of `size` bytes; 0 probes the size
    pub fn fit(size: u32, data: Vec<u8>) -> Result<Self> {
        let len = u32::try_from(data.len()).map_err(|_| Error::Lower(Errno::E2BIG))?;
        if size == 0 {
            Ok(XattrReply::Size(len))
        } else if len > size {
            Err(Error::Lower(Errno::ERANGE))
        } else {
            Ok(XattrReply::Data(data))
        }
    }

    fn send(self, reply: ReplyXattr) {
        match self {
            XattrReply::Size(len) => reply.size(len),
            XattrReply::Data(data) => reply.data(&data),
        }
    }
}

/// Stacked filesystem served over FUSE
pub struct StackedFuse<L: LowerFs> {
    stack: StackFs<L>,
    ttl: Duration,
    /// Shadow entries referenced on behalf of the kernel, per inode
    lookups: HashMap<u64, Vec<EntryIdx>>,
}

impl<L: LowerFs> StackedFuse<L> {
    pub fn new(stack: StackFs<L>, mount: &MountConfig) -> Self {
        Self {
            stack,
            ttl: Duration::from_millis(mount.attr_ttl_ms),
            lookups: HashMap::new(),
        }
    }

    /// Get the stacking layer
    pub fn stack(&self) -> &StackFs<L> {
        &self.stack
    }

    /// Entry standing for an inode
    fn entry_of(&self, ino: u64) -> Result<EntryIdx> {
        self.stack
            .alias(NodeIdx(ino))
            .ok_or(Error::Lower(Errno::ENOENT))
    }

    /// Hand a referenced positive entry to the kernel
    fn remember(&mut self, entry: EntryIdx) -> Result<FileAttr> {
        let attr = self.stack.getattr(entry);
        let node = self.stack.entry(entry).and_then(|e| {
            e.node
                .ok_or_else(|| Error::StaleReference("entry turned negative".to_string()))
        });
        match (attr, node) {
            (Ok(attr), Ok(node)) => {
                self.lookups.entry(node.0).or_default().push(entry);
                Ok(attr.to_fuser_attr(node.0))
            }
            (Err(e), _) | (_, Err(e)) => {
                self.stack.put_entry(entry);
                Err(e)
            }
        }
    }

    /// Resolve `name` under the directory inode `parent`; the result is
    /// referenced and may be negative
    fn child(&self, parent: u64, name: &OsStr) -> Result<EntryIdx> {
        let dir = self.entry_of(parent)?;
        self.stack.lookup(dir, name)
    }

    /// Resolve `name` under `parent`, failing with ENOENT if it does not exist
    fn positive_child(&self, parent: u64, name: &OsStr) -> Result<EntryIdx> {
        let entry = self.child(parent, name)?;
        match self.stack.entry(entry) {
            Ok(e) if e.node.is_some() => Ok(entry),
            _ => {
                self.stack.put_entry(entry);
                Err(Error::Lower(Errno::ENOENT))
            }
        }
    }

    pub fn do_lookup(&mut self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let entry = self.positive_child(parent, name)?;
        self.remember(entry)
    }

    pub fn do_forget(&mut self, ino: u64, nlookup: u64) {
        let Some(entries) = self.lookups.get_mut(&ino) else {
            return;
        };
        let n = (nlookup as usize).min(entries.len());
        let released: Vec<EntryIdx> = entries.drain(entries.len() - n..).collect();
        if entries.is_empty() {
            self.lookups.remove(&ino);
        }
        for entry in released {
            self.stack.put_entry(entry);
        }
    }

    /// Create a node named `name` under `parent` with `make`
    fn make<F>(&mut self, parent: u64, name: &OsStr, make: F) -> Result<FileAttr>
    where
        F: FnOnce(&StackFs<L>, NodeIdx, EntryIdx) -> Result<NodeIdx>,
    {
        let entry = self.child(parent, name)?;
        if let Err(e) = make(&self.stack, NodeIdx(parent), entry) {
            self.stack.put_entry(entry);
            return Err(e);
        }
        self.remember(entry)
    }

    pub fn do_mknod(&mut self, parent: u64, name: &OsStr, mode: u32, rdev: u32) -> Result<FileAttr> {
        self.make(parent, name, |fs, dir, entry| {
            if FileKind::from_mode(mode) == FileKind::RegularFile {
                fs.create(dir, entry, mode)
            } else {
                fs.mknod(dir, entry, mode, rdev)
            }
        })
    }

    pub fn do_mkdir(&mut self, parent: u64, name: &OsStr, mode: u32) -> Result<FileAttr> {
        self.make(parent, name, |fs, dir, entry| fs.mkdir(dir, entry, mode))
    }

    pub fn do_symlink(&mut self, parent: u64, name: &OsStr, target: &Path) -> Result<FileAttr> {
        self.make(parent, name, |fs, dir, entry| {
            fs.symlink(dir, entry, target.as_os_str())
        })
    }

    pub fn do_create(&mut self, parent: u64, name: &OsStr, mode: u32, flags: i32) -> Result<(FileAttr, FileIdx)> {
        let attr = self.make(parent, name, |fs, dir, entry| fs.create(dir, entry, mode))?;
        let entry = self.entry_of(attr.ino)?;
        let fh = self.stack.open(entry, flags)?;
        Ok((attr, fh))
    }

    pub fn do_link(&mut self, ino: u64, newparent: u64, newname: &OsStr) -> Result<FileAttr> {
        let old = self.entry_of(ino)?;
        let new = self.child(newparent, newname)?;
        match self.stack.link(old, NodeIdx(newparent), new) {
            Ok(Some(_)) => self.remember(new),
            Ok(None) => {
                // the new name stayed negative; report the source object
                self.stack.put_entry(new);
                self.stack.get_entry(old)?;
                self.remember(old)
            }
            Err(e) => {
                self.stack.put_entry(new);
                Err(e)
            }
        }
    }

    pub fn do_unlink(&mut self, parent: u64, name: &OsStr) -> Result<()> {
        let entry = self.positive_child(parent, name)?;
        let result = self.stack.unlink(NodeIdx(parent), entry);
        self.stack.put_entry(entry);
        result
    }

    pub fn do_rmdir(&mut self, parent: u64, name: &OsStr) -> Result<()> {
        let entry = self.positive_child(parent, name)?;
        let result = self.stack.rmdir(NodeIdx(parent), entry);
        self.stack.put_entry(entry);
        result
    }

    pub fn do_rename(
        &mut self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> Result<()> {
        let flags = RenameFlags::from_bits(flags)
            .ok_or_else(|| Error::UnsupportedOperation(format!("rename flags {:#x}", flags)))?;
        let old = self.positive_child(parent, name)?;
        let new = match self.child(newparent, newname) {
            Ok(new) => new,
            Err(e) => {
                self.stack.put_entry(old);
                return Err(e);
            }
        };
        let result = self
            .stack
            .rename(NodeIdx(parent), old, NodeIdx(newparent), new, flags);
        self.stack.put_entry(new);
        self.stack.put_entry(old);
        result
    }

    pub fn do_getattr(&mut self, ino: u64) -> Result<FileAttr> {
        let entry = self.entry_of(ino)?;
        Ok(self.stack.getattr(entry)?.to_fuser_attr(ino))
    }

    pub fn do_setattr(&mut self, ino: u64, req: SetAttr<FileIdx>) -> Result<FileAttr> {
        let entry = self.entry_of(ino)?;
        Ok(self.stack.setattr(entry, req)?.to_fuser_attr(ino))
    }

    pub fn do_readdir(&mut self, ino: u64) -> Result<Vec<(u64, FileKind, OsString)>> {
        let entry = self.entry_of(ino)?;
        let parent = self
            .stack
            .entry(entry)?
            .parent
            .and_then(|p| self.stack.entry(p).ok())
            .and_then(|p| p.node)
            .unwrap_or(NodeIdx::ROOT);

        let mut entries = vec![
            (ino, FileKind::Directory, OsString::from(".")),
            (parent.0, FileKind::Directory, OsString::from("..")),
        ];
        entries.extend(
            self.stack
                .readdir(entry)?
                .into_iter()
                .map(|e| (e.ino, e.kind, e.name)),
        );
        Ok(entries)
    }

    pub fn do_getxattr(&mut self, ino: u64, name: &OsStr, size: u32) -> Result<XattrReply> {
        let entry = self.entry_of(ino)?;
        XattrReply::fit(size, self.stack.getxattr(entry, name)?)
    }

    pub fn do_listxattr(&mut self, ino: u64, size: u32) -> Result<XattrReply> {
        let entry = self.entry_of(ino)?;
        let mut buf = Vec::new();
        for name in self.stack.listxattr(entry)? {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
        }
        XattrReply::fit(size, buf)
    }
}

/// Reply errno for a failed operation
fn errno(op: &str, e: Error) -> i32 {
    match e {
        Error::Io(_) | Error::Internal(_) | Error::AllocationError(_) => {
            error!("{} failed: {}", op, e)
        }
        _ => debug!("{} failed: {}", op, e),
    }
    e.errno()
}

fn system_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl<L: LowerFs> Filesystem for StackedFuse<L> {
    fn destroy(&mut self) {
        for (_, entries) in self.lookups.drain() {
            for entry in entries {
                self.stack.put_entry(entry);
            }
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        match self.do_lookup(parent, name) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno("lookup", e)),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        debug!("forget(ino={}, nlookup={})", ino, nlookup);
        self.do_forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(errno("getattr", e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, mode={:?}, size={:?})", ino, mode, size);
        let mut req = SetAttr::<FileIdx>::default();
        if let Some(mode) = mode {
            req.valid |= AttrMask::MODE;
            req.mode = mode;
        }
        if let Some(uid) = uid {
            req.valid |= AttrMask::UID;
            req.uid = uid;
        }
        if let Some(gid) = gid {
            req.valid |= AttrMask::GID;
            req.gid = gid;
        }
        if let Some(size) = size {
            req.valid |= AttrMask::SIZE;
            req.size = size;
        }
        if let Some(atime) = atime {
            req.valid |= AttrMask::ATIME;
            req.atime = system_time(atime);
        }
        if let Some(mtime) = mtime {
            req.valid |= AttrMask::MTIME;
            req.mtime = system_time(mtime);
        }
        if let Some(ctime) = ctime {
            req.valid |= AttrMask::CTIME;
            req.ctime = ctime;
        }
        if let Some(fh) = fh {
            req.valid |= AttrMask::FILE;
            req.file = Some(FileIdx(fh));
        }

        match self.do_setattr(ino, req) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(errno("setattr", e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);
        match self.entry_of(ino).and_then(|e| self.stack.readlink(e)) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno("readlink", e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);
        match self.do_mknod(parent, name, mode & !umask, rdev) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno("mknod", e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);
        match self.do_mkdir(parent, name, mode & !umask) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno("mkdir", e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        match self.do_unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("unlink", e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        match self.do_rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rmdir", e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);
        match self.do_symlink(parent, link_name, target) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno("symlink", e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        match self.do_rename(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rename", e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);
        match self.do_link(ino, newparent, newname) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno("link", e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={})", ino, flags);
        match self.entry_of(ino).and_then(|e| self.stack.open(e, flags)) {
            Ok(fh) => reply.opened(fh.0, 0),
            Err(e) => reply.error(errno("open", e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.stack.read(FileIdx(fh), offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.stack.write(FileIdx(fh), offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(errno("write", e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        self.stack.release(FileIdx(fh));
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);
        let entries = match self.do_readdir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno("readdir", e));
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(skip) {
            if reply.add(*child_ino, (i + 1) as i64, kind.to_fuser_type(), name) {
                break;
            }
        }
        reply.ok();
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr(ino={}, name={:?}, flags={})", ino, name, flags);
        let flags = XattrFlags::from_bits_truncate(flags as u32);
        match self
            .entry_of(ino)
            .and_then(|e| self.stack.setxattr(e, name, Some(value), flags))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("setxattr", e)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);
        match self.do_getxattr(ino, name, size) {
            Ok(answer) => answer.send(reply),
            Err(e) => reply.error(errno("getxattr", e)),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr(ino={}, size={})", ino, size);
        match self.do_listxattr(ino, size) {
            Ok(answer) => answer.send(reply),
            Err(e) => reply.error(errno("listxattr", e)),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr(ino={}, name={:?})", ino, name);
        match self
            .entry_of(ino)
            .and_then(|e| self.stack.removexattr(e, name))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("removexattr", e)),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);
        match self.stack.permission(NodeIdx(ino), mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("access", e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);
        match self.do_create(parent, name, mode & !umask, flags) {
            Ok((attr, fh)) => reply.created(&self.ttl, &attr, 0, fh.0, 0),
            Err(e) => reply.error(errno("create", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MountConfig, StackConfig};
    use crate::lower::MemFs;
    use std::sync::Arc;

    fn mounted() -> (StackedFuse<MemFs>, Arc<MemFs>) {
        let lower = Arc::new(MemFs::new());
        let stack = StackFs::new(Arc::clone(&lower), &StackConfig::default()).unwrap();
        (StackedFuse::new(stack, &MountConfig::default()), lower)
    }

    #[test]
    fn test_xattr_size_probe() {
        assert_eq!(XattrReply::fit(0, b"abc".to_vec()).unwrap(), XattrReply::Size(3));
        assert_eq!(
            XattrReply::fit(8, b"abc".to_vec()).unwrap(),
            XattrReply::Data(b"abc".to_vec())
        );
        assert!(matches!(
            XattrReply::fit(2, b"abc".to_vec()),
            Err(Error::Lower(Errno::ERANGE))
        ));
    }

    #[test]
    fn test_lookup_forget_balances_references() {
        let (mut fs, lower) = mounted();
        let dir = fs.do_mkdir(1, OsStr::new("d"), 0o755).unwrap();
        fs.do_mknod(dir.ino, OsStr::new("f"), libc::S_IFREG | 0o644, 0)
            .unwrap();
        let f = fs.do_lookup(dir.ino, OsStr::new("f")).unwrap();
        assert_eq!(f.kind, fuser::FileType::RegularFile);
        assert!(matches!(
            fs.do_lookup(dir.ino, OsStr::new("missing")),
            Err(Error::Lower(Errno::ENOENT))
        ));

        fs.do_forget(f.ino, 2);
        fs.do_unlink(dir.ino, OsStr::new("f")).unwrap();
        fs.do_forget(dir.ino, 1);
        fs.do_rmdir(1, OsStr::new("d")).unwrap();
        assert_eq!(fs.stack().node_count(), 1);

        drop(fs);
        assert_eq!(lower.outstanding_refs(), 0);
    }

    #[test]
    fn test_rename_and_readdir() {
        let (mut fs, _lower) = mounted();
        let a = fs.do_mkdir(1, OsStr::new("a"), 0o755).unwrap();
        let (f, fh) = fs
            .do_create(a.ino, OsStr::new("f"), 0o600, libc::O_RDWR)
            .unwrap();
        fs.stack().write(fh, 0, b"payload").unwrap();
        fs.stack().release(fh);

        fs.do_rename(a.ino, OsStr::new("f"), 1, OsStr::new("g"), 0)
            .unwrap();
        let names: Vec<OsString> = fs
            .do_readdir(1)
            .unwrap()
            .into_iter()
            .map(|(_, _, name)| name)
            .collect();
        let expected: Vec<OsString> = [".", "..", "a", "g"].iter().map(OsString::from).collect();
        assert_eq!(names, expected);

        let g = fs.do_getattr(f.ino).unwrap();
        assert_eq!(g.size, 7);
        assert!(matches!(
            fs.do_rename(1, OsStr::new("g"), 1, OsStr::new("h"), libc::RENAME_NOREPLACE),
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_link_and_symlink() {
        let (mut fs, _lower) = mounted();
        let f = fs
            .do_mknod(1, OsStr::new("f"), libc::S_IFREG | 0o644, 0)
            .unwrap();
        let linked = fs.do_link(f.ino, 1, OsStr::new("f2")).unwrap();
        assert_eq!(linked.ino, f.ino);
        assert_eq!(linked.nlink, 2);

        let l = fs
            .do_symlink(1, OsStr::new("l"), Path::new("f"))
            .unwrap();
        assert_eq!(l.kind, fuser::FileType::Symlink);
    }

    #[test]
    fn test_xattr_through_adapter() {
        let (mut fs, _lower) = mounted();
        let f = fs
            .do_mknod(1, OsStr::new("f"), libc::S_IFREG | 0o644, 0)
            .unwrap();
        let entry = fs.entry_of(f.ino).unwrap();
        fs.stack()
            .setxattr(entry, OsStr::new("user.k"), Some(b"v"), XattrFlags::empty())
            .unwrap();

        assert_eq!(
            fs.do_getxattr(f.ino, OsStr::new("user.k"), 0).unwrap(),
            XattrReply::Size(1)
        );
        assert_eq!(
            fs.do_listxattr(f.ino, 64).unwrap(),
            XattrReply::Data(b"user.k\0".to_vec())
        );
        assert!(matches!(
            fs.do_listxattr(f.ino, 3),
            Err(Error::Lower(Errno::ERANGE))
        ));
    }
}
