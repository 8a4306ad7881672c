//! In-memory lower filesystem
//!
//! A complete POSIX-style tree kept in memory. It is the reference backend for
//! the stacking layer and models the network-filesystem silly-rename convention
//! so the unlink busy downgrade can be exercised.

use super::dcache::DentryCache;
use super::{
    AttrMask, Capabilities, EntryInfo, FileKind, LowerAttr, LowerDirEntry, LowerEntry,
    LowerFile, LowerFs, LowerNode, SetAttr, XattrFlags,
};
use crate::error::{Error, Result};
use crate::vm::{FaultOutcome, LowerVmOps, MappedFile, VmArea, VmFault, PAGE_SIZE};
use bytes::Bytes;
use nix::errno::Errno;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Reported size of one directory entry
const DIRENT_SIZE: u64 = 20;

/// Longest name a directory accepts
const NAME_MAX: usize = 255;

/// Largest file the in-memory store will hold
pub const MAX_MEM_FILE_SIZE: u64 = 1 << 30;

struct MemNode {
    attr: LowerAttr,
    data: Vec<u8>,
    target: Option<OsString>,
    xattrs: BTreeMap<OsString, Vec<u8>>,
    open_count: u32,
}

impl MemNode {
    fn new(kind: FileKind, perm: u16, rdev: u32) -> Self {
        let now = SystemTime::now();
        Self {
            attr: LowerAttr {
                kind,
                size: 0,
                blocks: 0,
                atime: now,
                mtime: now,
                ctime: now,
                crtime: now,
                perm,
                nlink: if kind == FileKind::Directory { 2 } else { 1 },
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
                rdev,
                blksize: PAGE_SIZE as u32,
            },
            data: Vec::new(),
            target: None,
            xattrs: BTreeMap::new(),
            open_count: 0,
        }
    }

    fn is_dir(&self) -> bool {
        self.attr.kind == FileKind::Directory
    }

    fn resize(&mut self, size: u64) -> Result<()> {
        if size > MAX_MEM_FILE_SIZE {
            return Err(Error::Lower(Errno::EFBIG));
        }
        self.data.resize(size as usize, 0);
        self.attr.size = size;
        self.attr.blocks = size.div_ceil(512);
        Ok(())
    }

    fn touch_ctime(&mut self) {
        self.attr.ctime = SystemTime::now();
    }
}

struct MemOpenFile {
    node: LowerNode,
}

struct MemState {
    dcache: DentryCache,
    nodes: HashMap<LowerNode, MemNode>,
    files: HashMap<LowerFile, MemOpenFile>,
    next_node: u64,
    next_file: u64,
}

impl MemState {
    fn node(&self, node: LowerNode) -> Result<&MemNode> {
        self.nodes.get(&node).ok_or(Error::Lower(Errno::ESTALE))
    }

    fn node_mut(&mut self, node: LowerNode) -> Result<&mut MemNode> {
        self.nodes.get_mut(&node).ok_or(Error::Lower(Errno::ESTALE))
    }

    fn dir(&self, node: LowerNode) -> Result<&MemNode> {
        let n = self.node(node)?;
        if !n.is_dir() {
            return Err(Error::Lower(Errno::ENOTDIR));
        }
        Ok(n)
    }

    fn file_node(&self, file: LowerFile) -> Result<LowerNode> {
        self.files
            .get(&file)
            .map(|f| f.node)
            .ok_or(Error::Lower(Errno::EBADF))
    }

    /// Check that `entry` is a hashed child of directory `dir` and return its info
    fn child_of(&self, dir: LowerNode, entry: LowerEntry) -> Result<EntryInfo> {
        self.dir(dir)?;
        let info = self.dcache.info(entry)?;
        if !info.hashed {
            return Err(Error::Lower(Errno::ENOENT));
        }
        let parent = info.parent.ok_or(Error::Lower(Errno::EBUSY))?;
        if self.dcache.positive(parent)? != dir {
            return Err(Error::Lower(Errno::EINVAL));
        }
        Ok(info)
    }

    fn alloc_node(&mut self, node: MemNode) -> LowerNode {
        let id = LowerNode(self.next_node);
        self.next_node += 1;
        self.nodes.insert(id, node);
        id
    }

    /// Refresh a directory's size, times and optionally its link count
    fn dir_changed(&mut self, dir_entry: LowerEntry, dir: LowerNode, nlink_delta: i32) -> Result<()> {
        let count = self.dcache.positive_children(dir_entry).len() as u64;
        let now = SystemTime::now();
        let d = self.node_mut(dir)?;
        d.attr.size = count * DIRENT_SIZE;
        d.attr.mtime = now;
        d.attr.ctime = now;
        d.attr.nlink = (d.attr.nlink as i64 + nlink_delta as i64).max(0) as u32;
        Ok(())
    }

    /// Instantiate a negative child entry with a freshly allocated node
    fn make_node(&mut self, dir: LowerNode, entry: LowerEntry, node: MemNode) -> Result<LowerNode> {
        let info = self.child_of(dir, entry)?;
        if !info.is_negative() {
            return Err(Error::Lower(Errno::EEXIST));
        }
        let subdir = node.is_dir();
        let id = self.alloc_node(node);
        self.dcache.instantiate(entry, id)?;
        let parent = info.parent.ok_or(Error::Lower(Errno::EINVAL))?;
        self.dir_changed(parent, dir, if subdir { 1 } else { 0 })?;
        Ok(id)
    }

    fn is_ancestor(&self, ancestor: LowerEntry, mut entry: LowerEntry) -> bool {
        loop {
            if entry == ancestor {
                return true;
            }
            match self.dcache.get(entry).ok().and_then(|d| d.parent) {
                Some(parent) => entry = parent,
                None => return false,
            }
        }
    }
}

/// In-memory lower filesystem
pub struct MemFs {
    state: Arc<RwLock<MemState>>,
    caps: Capabilities,
    faults: Arc<AtomicU64>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::XATTR | Capabilities::MMAP)
    }

    pub fn with_capabilities(caps: Capabilities) -> Self {
        let root_node = LowerNode(1);
        let mut nodes = HashMap::new();
        nodes.insert(root_node, MemNode::new(FileKind::Directory, 0o755, 0));
        let state = MemState {
            dcache: DentryCache::new(root_node),
            nodes,
            files: HashMap::new(),
            next_node: 2,
            next_file: 1,
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            caps,
            faults: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Rename a positive entry to a hidden name in place and flag it, the way a
    /// network filesystem defers deletion of a file that is still open
    pub fn silly_rename(&self, entry: LowerEntry) -> Result<()> {
        let mut state = self.state.write();
        let node = state.dcache.positive(entry)?;
        let parent = state
            .dcache
            .info(entry)?
            .parent
            .ok_or(Error::Lower(Errno::EBUSY))?;
        let hidden = OsString::from(format!(".nfs{:016x}", node.0));
        state.dcache.d_move(entry, parent, &hidden, entry)?;
        state.dcache.get_mut(entry)?.silly_renamed = true;
        debug!("silly-renamed entry {:?} to {:?}", entry, hidden);
        Ok(())
    }

    /// Entry references currently held by callers
    pub fn outstanding_refs(&self) -> u64 {
        self.state.read().dcache.outstanding_refs()
    }

    /// Number of faults served by mappings of this filesystem
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::SeqCst)
    }

    /// Open files on a node
    pub fn open_count(&self, node: LowerNode) -> u32 {
        self.state
            .read()
            .nodes
            .get(&node)
            .map(|n| n.open_count)
            .unwrap_or(0)
    }

    fn check_name(name: &OsStr) -> Result<()> {
        use std::os::unix::ffi::OsStrExt;
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.contains(&b'/') || name == "." || name == ".." {
            return Err(Error::Lower(Errno::EINVAL));
        }
        if bytes.len() > NAME_MAX {
            return Err(Error::Lower(Errno::ENAMETOOLONG));
        }
        Ok(())
    }

    fn check_xattr(&self) -> Result<()> {
        if self.caps.contains(Capabilities::XATTR) {
            Ok(())
        } else {
            Err(Error::Lower(Errno::EOPNOTSUPP))
        }
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl LowerFs for MemFs {
    fn root(&self) -> LowerEntry {
        self.state.read().dcache.root()
    }

    fn capabilities(&self, _node: LowerNode) -> Capabilities {
        self.caps
    }

    fn dget(&self, entry: LowerEntry) -> Result<()> {
        self.state.write().dcache.dget(entry)
    }

    fn dput(&self, entry: LowerEntry) {
        self.state.write().dcache.dput(entry)
    }

    fn entry(&self, entry: LowerEntry) -> Result<EntryInfo> {
        self.state.read().dcache.info(entry)
    }

    fn lookup(&self, dir: LowerEntry, name: &OsStr) -> Result<LowerEntry> {
        Self::check_name(name)?;
        let mut state = self.state.write();
        let dir_node = state.dcache.positive(dir)?;
        state.dir(dir_node)?;
        let entry = match state.dcache.child(dir, name) {
            Some(entry) => entry,
            None => state.dcache.alloc(dir, name, None),
        };
        state.dcache.dget(entry)?;
        Ok(entry)
    }

    fn create(&self, dir: LowerNode, entry: LowerEntry, mode: u32) -> Result<()> {
        let mut state = self.state.write();
        state.make_node(dir, entry, MemNode::new(FileKind::RegularFile, (mode & 0o7777) as u16, 0))?;
        Ok(())
    }

    fn link(&self, old: LowerEntry, dir: LowerNode, new: LowerEntry) -> Result<()> {
        let mut state = self.state.write();
        let node = state.dcache.positive(old)?;
        if state.node(node)?.is_dir() {
            return Err(Error::Lower(Errno::EPERM));
        }
        let info = state.child_of(dir, new)?;
        if !info.is_negative() {
            return Err(Error::Lower(Errno::EEXIST));
        }
        state.dcache.instantiate(new, node)?;
        let n = state.node_mut(node)?;
        n.attr.nlink += 1;
        n.touch_ctime();
        let parent = info.parent.ok_or(Error::Lower(Errno::EINVAL))?;
        state.dir_changed(parent, dir, 0)
    }

    fn unlink(&self, dir: LowerNode, entry: LowerEntry) -> Result<()> {
        let mut state = self.state.write();
        let info = state.child_of(dir, entry)?;
        let node = info.node.ok_or(Error::Lower(Errno::ENOENT))?;
        let n = state.node(node)?;
        if n.is_dir() {
            return Err(Error::Lower(Errno::EISDIR));
        }
        if info.silly_renamed && n.open_count > 0 {
            return Err(Error::Lower(Errno::EBUSY));
        }
        state.dcache.unhash(entry);
        let n = state.node_mut(node)?;
        n.attr.nlink = n.attr.nlink.saturating_sub(1);
        n.touch_ctime();
        let parent = info.parent.ok_or(Error::Lower(Errno::EINVAL))?;
        state.dir_changed(parent, dir, 0)
    }

    fn symlink(&self, dir: LowerNode, entry: LowerEntry, target: &OsStr) -> Result<()> {
        let mut state = self.state.write();
        let mut node = MemNode::new(FileKind::Symlink, 0o777, 0);
        node.attr.size = target.len() as u64;
        node.target = Some(target.to_os_string());
        state.make_node(dir, entry, node)?;
        Ok(())
    }

    fn mkdir(&self, dir: LowerNode, entry: LowerEntry, mode: u32) -> Result<()> {
        let mut state = self.state.write();
        state.make_node(dir, entry, MemNode::new(FileKind::Directory, (mode & 0o7777) as u16, 0))?;
        Ok(())
    }

    fn rmdir(&self, dir: LowerNode, entry: LowerEntry) -> Result<()> {
        let mut state = self.state.write();
        let info = state.child_of(dir, entry)?;
        let node = info.node.ok_or(Error::Lower(Errno::ENOENT))?;
        state.dir(node)?;
        if !state.dcache.positive_children(entry).is_empty() {
            return Err(Error::Lower(Errno::ENOTEMPTY));
        }
        state.dcache.unhash(entry);
        let n = state.node_mut(node)?;
        n.attr.nlink = 0;
        n.touch_ctime();
        let parent = info.parent.ok_or(Error::Lower(Errno::EINVAL))?;
        state.dir_changed(parent, dir, -1)
    }

    fn mknod(&self, dir: LowerNode, entry: LowerEntry, mode: u32, rdev: u32) -> Result<()> {
        let kind = FileKind::from_mode(mode);
        if kind == FileKind::Directory || kind == FileKind::Symlink {
            return Err(Error::Lower(Errno::EINVAL));
        }
        let mut state = self.state.write();
        state.make_node(dir, entry, MemNode::new(kind, (mode & 0o7777) as u16, rdev))?;
        Ok(())
    }

    fn rename(
        &self,
        old_dir: LowerNode,
        old: LowerEntry,
        new_dir: LowerNode,
        new: LowerEntry,
    ) -> Result<()> {
        let mut state = self.state.write();
        let old_info = state.child_of(old_dir, old)?;
        let new_info = state.child_of(new_dir, new)?;
        let node = old_info.node.ok_or(Error::Lower(Errno::ENOENT))?;
        let moving_dir = state.node(node)?.is_dir();
        let new_parent = new_info.parent.ok_or(Error::Lower(Errno::EINVAL))?;
        let old_parent = old_info.parent.ok_or(Error::Lower(Errno::EINVAL))?;

        if moving_dir && state.is_ancestor(old, new_parent) {
            return Err(Error::Lower(Errno::EINVAL));
        }

        if let Some(victim) = new_info.node {
            if victim == node {
                return Ok(());
            }
            let victim_dir = state.node(victim)?.is_dir();
            match (moving_dir, victim_dir) {
                (true, false) => return Err(Error::Lower(Errno::ENOTDIR)),
                (false, true) => return Err(Error::Lower(Errno::EISDIR)),
                (true, true) if !state.dcache.positive_children(new).is_empty() => {
                    return Err(Error::Lower(Errno::ENOTEMPTY));
                }
                _ => {}
            }
            let v = state.node_mut(victim)?;
            v.attr.nlink = if victim_dir { 0 } else { v.attr.nlink.saturating_sub(1) };
            v.touch_ctime();
            if victim_dir {
                state.dir_changed(new_parent, new_dir, -1)?;
            }
        }

        state.dcache.d_move(old, new_parent, &new_info.name, new)?;
        state.node_mut(node)?.touch_ctime();

        let delta = if moving_dir && old_dir != new_dir { 1 } else { 0 };
        state.dir_changed(old_parent, old_dir, -delta)?;
        state.dir_changed(new_parent, new_dir, delta)
    }

    fn readlink(&self, entry: LowerEntry) -> Result<OsString> {
        let mut state = self.state.write();
        let node = state.dcache.positive(entry)?;
        let n = state.node_mut(node)?;
        let target = n.target.clone().ok_or(Error::Lower(Errno::EINVAL))?;
        n.attr.atime = SystemTime::now();
        Ok(target)
    }

    fn permission(&self, node: LowerNode, mask: i32) -> Result<()> {
        let state = self.state.read();
        let n = state.node(node)?;
        let granted = ((n.attr.perm >> 6) & 0o7) as i32;
        let wanted = mask & (libc::R_OK | libc::W_OK | libc::X_OK);
        if wanted & !granted != 0 {
            return Err(Error::Lower(Errno::EACCES));
        }
        Ok(())
    }

    fn getattr(&self, node: LowerNode) -> Result<LowerAttr> {
        Ok(self.state.read().node(node)?.attr.clone())
    }

    fn setattr(&self, entry: LowerEntry, attr: &SetAttr) -> Result<()> {
        let mut state = self.state.write();
        let node = state.dcache.get(entry)?.node.ok_or(Error::Lower(Errno::ENOENT))?;
        let n = state.node_mut(node)?;
        if attr.valid.contains(AttrMask::SIZE) {
            if n.is_dir() {
                return Err(Error::Lower(Errno::EISDIR));
            }
            n.resize(attr.size)?;
            n.attr.mtime = SystemTime::now();
        }
        if attr.valid.contains(AttrMask::MODE) {
            n.attr.perm = (attr.mode & 0o7777) as u16;
        }
        if attr.valid.contains(AttrMask::KILL_SUID) {
            n.attr.perm &= !(libc::S_ISUID as u16);
        }
        if attr.valid.contains(AttrMask::KILL_SGID) {
            n.attr.perm &= !(libc::S_ISGID as u16);
        }
        if attr.valid.contains(AttrMask::UID) {
            n.attr.uid = attr.uid;
        }
        if attr.valid.contains(AttrMask::GID) {
            n.attr.gid = attr.gid;
        }
        if attr.valid.contains(AttrMask::ATIME) {
            n.attr.atime = attr.atime;
        }
        if attr.valid.contains(AttrMask::MTIME) {
            n.attr.mtime = attr.mtime;
        }
        n.attr.ctime = if attr.valid.contains(AttrMask::CTIME) {
            attr.ctime
        } else {
            SystemTime::now()
        };
        Ok(())
    }

    fn getxattr(&self, entry: LowerEntry, name: &OsStr) -> Result<Vec<u8>> {
        self.check_xattr()?;
        let state = self.state.read();
        let node = state.dcache.get(entry)?.node.ok_or(Error::Lower(Errno::ENOENT))?;
        state
            .node(node)?
            .xattrs
            .get(name)
            .cloned()
            .ok_or(Error::Lower(Errno::ENODATA))
    }

    fn setxattr(
        &self,
        entry: LowerEntry,
        name: &OsStr,
        value: &[u8],
        flags: XattrFlags,
    ) -> Result<()> {
        self.check_xattr()?;
        let mut state = self.state.write();
        let node = state.dcache.get(entry)?.node.ok_or(Error::Lower(Errno::ENOENT))?;
        let n = state.node_mut(node)?;
        let exists = n.xattrs.contains_key(name);
        if flags.contains(XattrFlags::CREATE) && exists {
            return Err(Error::Lower(Errno::EEXIST));
        }
        if flags.contains(XattrFlags::REPLACE) && !exists {
            return Err(Error::Lower(Errno::ENODATA));
        }
        n.xattrs.insert(name.to_os_string(), value.to_vec());
        n.touch_ctime();
        Ok(())
    }

    fn listxattr(&self, entry: LowerEntry) -> Result<Vec<OsString>> {
        self.check_xattr()?;
        let state = self.state.read();
        let node = state.dcache.get(entry)?.node.ok_or(Error::Lower(Errno::ENOENT))?;
        Ok(state.node(node)?.xattrs.keys().cloned().collect())
    }

    fn removexattr(&self, entry: LowerEntry, name: &OsStr) -> Result<()> {
        self.check_xattr()?;
        let mut state = self.state.write();
        let node = state.dcache.get(entry)?.node.ok_or(Error::Lower(Errno::ENOENT))?;
        let n = state.node_mut(node)?;
        n.xattrs.remove(name).ok_or(Error::Lower(Errno::ENODATA))?;
        n.touch_ctime();
        Ok(())
    }

    fn open(&self, entry: LowerEntry, flags: i32) -> Result<LowerFile> {
        let mut state = self.state.write();
        let node = state.dcache.get(entry)?.node.ok_or(Error::Lower(Errno::ENOENT))?;
        let n = state.node_mut(node)?;
        if n.attr.kind == FileKind::Symlink {
            return Err(Error::Lower(Errno::ELOOP));
        }
        let accmode = flags & libc::O_ACCMODE;
        let writable = accmode == libc::O_WRONLY || accmode == libc::O_RDWR;
        if writable && n.is_dir() {
            return Err(Error::Lower(Errno::EISDIR));
        }
        if writable && flags & libc::O_TRUNC != 0 {
            n.resize(0)?;
        }
        n.open_count += 1;
        let file = LowerFile(state.next_file);
        state.next_file += 1;
        state.files.insert(file, MemOpenFile { node });
        Ok(file)
    }

    fn release(&self, file: LowerFile) {
        let mut state = self.state.write();
        if let Some(f) = state.files.remove(&file) {
            if let Some(n) = state.nodes.get_mut(&f.node) {
                n.open_count = n.open_count.saturating_sub(1);
            }
        }
    }

    fn read(&self, file: LowerFile, offset: u64, size: u32) -> Result<Vec<u8>> {
        let state = self.state.read();
        let n = state.node(state.file_node(file)?)?;
        if n.is_dir() {
            return Err(Error::Lower(Errno::EISDIR));
        }
        let start = (offset as usize).min(n.data.len());
        let end = start.saturating_add(size as usize).min(n.data.len());
        Ok(n.data[start..end].to_vec())
    }

    fn write(&self, file: LowerFile, offset: u64, data: &[u8]) -> Result<u32> {
        let mut state = self.state.write();
        let node = state.file_node(file)?;
        let n = state.node_mut(node)?;
        if n.is_dir() {
            return Err(Error::Lower(Errno::EISDIR));
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(Error::Lower(Errno::EFBIG))?;
        if end > n.attr.size {
            n.resize(end)?;
        }
        n.data[offset as usize..end as usize].copy_from_slice(data);
        let now = SystemTime::now();
        n.attr.mtime = now;
        n.attr.ctime = now;
        Ok(data.len() as u32)
    }

    fn readdir(&self, dir: LowerEntry) -> Result<Vec<LowerDirEntry>> {
        let state = self.state.read();
        state.dir(state.dcache.positive(dir)?)?;
        state
            .dcache
            .positive_children(dir)
            .into_iter()
            .map(|(name, _, node)| {
                Ok(LowerDirEntry {
                    name,
                    kind: state.node(node)?.attr.kind,
                    ino: node.0,
                })
            })
            .collect()
    }

    fn vm_ops(&self, file: LowerFile) -> Result<Arc<dyn LowerVmOps>> {
        let state = self.state.read();
        let n = state.node(state.file_node(file)?)?;
        if n.attr.kind != FileKind::RegularFile {
            return Err(Error::Lower(Errno::ENODEV));
        }
        Ok(Arc::new(MemVmOps {
            state: Arc::clone(&self.state),
            faults: Arc::clone(&self.faults),
        }))
    }
}

/// Mapping operations of a [`MemFs`] file
struct MemVmOps {
    state: Arc<RwLock<MemState>>,
    faults: Arc<AtomicU64>,
}

impl MemVmOps {
    fn lower_file(vma: &VmArea) -> Result<LowerFile> {
        match vma.file {
            MappedFile::Lower(file) => Ok(file),
            MappedFile::Upper(_) => Err(Error::InvalidArgument(
                "mapping is not bound to a lower file".to_string(),
            )),
        }
    }
}

impl LowerVmOps for MemVmOps {
    fn fault(&self, vma: &VmArea, vmf: &VmFault) -> Result<FaultOutcome> {
        let file = Self::lower_file(vma)?;
        let state = self.state.read();
        let n = state.node(state.file_node(file)?)?;
        self.faults.fetch_add(1, Ordering::SeqCst);

        let start = vmf.pgoff * PAGE_SIZE;
        if start >= n.attr.size {
            return Ok(FaultOutcome::SigBus);
        }
        let end = (start + PAGE_SIZE).min(n.attr.size);
        let mut page = n.data[start as usize..end as usize].to_vec();
        page.resize(PAGE_SIZE as usize, 0);
        Ok(FaultOutcome::Page(Bytes::from(page)))
    }

    fn page_mkwrite(&self, vma: &VmArea, vmf: &VmFault) -> Option<Result<FaultOutcome>> {
        let outcome = Self::lower_file(vma).and_then(|file| {
            let mut state = self.state.write();
            let node = state.file_node(file)?;
            let n = state.node_mut(node)?;
            self.faults.fetch_add(1, Ordering::SeqCst);
            if vmf.pgoff * PAGE_SIZE >= n.attr.size {
                return Ok(FaultOutcome::SigBus);
            }
            let now = SystemTime::now();
            n.attr.mtime = now;
            n.attr.ctime = now;
            Ok(FaultOutcome::Ready)
        });
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positive(fs: &MemFs, name: &str) -> (LowerEntry, LowerNode) {
        let entry = fs.lookup(fs.root(), OsStr::new(name)).unwrap();
        let node = fs.entry(entry).unwrap().node.unwrap();
        (entry, node)
    }

    #[test]
    fn test_create_and_lookup() {
        let fs = MemFs::new();
        let root = fs.root();
        let entry = fs.lookup(root, OsStr::new("f")).unwrap();
        assert!(fs.entry(entry).unwrap().is_negative());

        fs.create(LowerNode(1), entry, 0o640).unwrap();
        let info = fs.entry(entry).unwrap();
        let attr = fs.getattr(info.node.unwrap()).unwrap();
        assert_eq!(attr.kind, FileKind::RegularFile);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.size, 0);

        let root_attr = fs.getattr(LowerNode(1)).unwrap();
        assert_eq!(root_attr.size, DIRENT_SIZE);

        assert!(matches!(
            fs.create(LowerNode(1), entry, 0o640),
            Err(Error::Lower(Errno::EEXIST))
        ));
        fs.dput(entry);
        assert_eq!(fs.outstanding_refs(), 0);
    }

    #[test]
    fn test_mkdir_rmdir_nlink() {
        let fs = MemFs::new();
        let d = fs.lookup(fs.root(), OsStr::new("d")).unwrap();
        fs.mkdir(LowerNode(1), d, 0o755).unwrap();
        assert_eq!(fs.getattr(LowerNode(1)).unwrap().nlink, 3);

        let d_node = fs.entry(d).unwrap().node.unwrap();
        let f = fs.lookup(d, OsStr::new("f")).unwrap();
        fs.create(d_node, f, 0o644).unwrap();
        assert!(matches!(
            fs.rmdir(LowerNode(1), d),
            Err(Error::Lower(Errno::ENOTEMPTY))
        ));

        fs.unlink(d_node, f).unwrap();
        fs.rmdir(LowerNode(1), d).unwrap();
        assert_eq!(fs.getattr(LowerNode(1)).unwrap().nlink, 2);
        assert_eq!(fs.getattr(d_node).unwrap().nlink, 0);
    }

    #[test]
    fn test_silly_renamed_unlink_is_busy_while_open() {
        let fs = MemFs::new();
        let e = fs.lookup(fs.root(), OsStr::new("open")).unwrap();
        fs.create(LowerNode(1), e, 0o644).unwrap();
        let file = fs.open(e, libc::O_RDONLY).unwrap();

        fs.silly_rename(e).unwrap();
        let info = fs.entry(e).unwrap();
        assert!(info.silly_renamed);
        assert!(info.name.to_string_lossy().starts_with(".nfs"));
        assert!(matches!(
            fs.unlink(LowerNode(1), e),
            Err(Error::Lower(Errno::EBUSY))
        ));

        fs.release(file);
        fs.unlink(LowerNode(1), e).unwrap();
    }

    #[test]
    fn test_rename_replaces_target() {
        let fs = MemFs::new();
        let a = fs.lookup(fs.root(), OsStr::new("a")).unwrap();
        let b = fs.lookup(fs.root(), OsStr::new("b")).unwrap();
        fs.create(LowerNode(1), a, 0o644).unwrap();
        fs.create(LowerNode(1), b, 0o644).unwrap();
        let (_, b_node) = positive(&fs, "b");
        let a_node = fs.entry(a).unwrap().node.unwrap();

        fs.rename(LowerNode(1), a, LowerNode(1), b).unwrap();

        assert_eq!(fs.getattr(b_node).unwrap().nlink, 0);
        let (_, now_b) = positive(&fs, "b");
        assert_eq!(now_b, a_node);
        assert!(!fs.entry(b).unwrap().hashed);
    }

    #[test]
    fn test_rename_into_own_subtree_rejected() {
        let fs = MemFs::new();
        let d = fs.lookup(fs.root(), OsStr::new("d")).unwrap();
        fs.mkdir(LowerNode(1), d, 0o755).unwrap();
        let d_node = fs.entry(d).unwrap().node.unwrap();
        let inner = fs.lookup(d, OsStr::new("inner")).unwrap();
        assert!(matches!(
            fs.rename(LowerNode(1), d, d_node, inner),
            Err(Error::Lower(Errno::EINVAL))
        ));
    }

    #[test]
    fn test_xattr_capability() {
        let fs = MemFs::with_capabilities(Capabilities::MMAP);
        assert!(matches!(
            fs.listxattr(fs.root()),
            Err(Error::Lower(Errno::EOPNOTSUPP))
        ));

        let fs = MemFs::new();
        let root = fs.root();
        fs.setxattr(root, OsStr::new("user.k"), b"v", XattrFlags::CREATE)
            .unwrap();
        assert!(matches!(
            fs.setxattr(root, OsStr::new("user.k"), b"v", XattrFlags::CREATE),
            Err(Error::Lower(Errno::EEXIST))
        ));
        assert_eq!(fs.getxattr(root, OsStr::new("user.k")).unwrap(), b"v");
        fs.removexattr(root, OsStr::new("user.k")).unwrap();
        assert!(matches!(
            fs.getxattr(root, OsStr::new("user.k")),
            Err(Error::Lower(Errno::ENODATA))
        ));
    }

    #[test]
    fn test_fault_reads_page() {
        let fs = MemFs::new();
        let e = fs.lookup(fs.root(), OsStr::new("m")).unwrap();
        fs.create(LowerNode(1), e, 0o644).unwrap();
        let file = fs.open(e, libc::O_RDWR).unwrap();
        fs.write(file, 0, b"mapped").unwrap();

        let ops = fs.vm_ops(file).unwrap();
        let vma = VmArea::new(
            MappedFile::Lower(file),
            0,
            2 * PAGE_SIZE,
            0,
            crate::vm::MapFlags::READ,
        );
        match ops.fault(&vma, &VmFault::read(&vma, 0)).unwrap() {
            FaultOutcome::Page(page) => {
                assert_eq!(page.len(), PAGE_SIZE as usize);
                assert_eq!(&page[..6], b"mapped");
            }
            other => panic!("unexpected fault outcome {:?}", other),
        }
        assert_eq!(
            ops.fault(&vma, &VmFault::read(&vma, PAGE_SIZE)).unwrap(),
            FaultOutcome::SigBus
        );
        assert_eq!(fs.fault_count(), 2);
    }
}
