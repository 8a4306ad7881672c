//! Host directory pass-through
//!
//! Exposes a directory of the host filesystem through [`LowerFs`]. Entries are
//! tracked in a dentry arena keyed by path component; objects are identified by
//! their `(dev, ino)` pair so hard links resolve to one [`LowerNode`].

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
use std::collections::{BTreeSet, HashMap};
use std::ffi::{OsStr, OsString};
use std::fs::{self, File, Metadata, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, DirEntryExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Convert a host I/O failure into a forwarded lower errno
fn os_err(e: std::io::Error) -> Error {
    Error::Lower(Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))
}

struct HostOpenFile {
    file: Arc<File>,
    node: LowerNode,
}

struct HostState {
    dcache: DentryCache,
    /// `(dev, ino)` -> node
    nodes: HashMap<(u64, u64), LowerNode>,
    /// Hashed entries naming each node
    aliases: HashMap<LowerNode, BTreeSet<LowerEntry>>,
    files: HashMap<LowerFile, HostOpenFile>,
    next_node: u64,
    next_file: u64,
}

impl HostState {
    fn bind(&mut self, entry: LowerEntry, meta: &Metadata) -> Result<LowerNode> {
        let key = (meta.dev(), meta.ino());
        let node = match self.nodes.get(&key) {
            Some(node) => *node,
            None => {
                let node = LowerNode(self.next_node);
                self.next_node += 1;
                self.nodes.insert(key, node);
                node
            }
        };
        let d = self.dcache.get_mut(entry)?;
        if let Some(old) = d.node.replace(node) {
            if old != node {
                self.forget_alias(old, entry);
            }
        }
        self.aliases.entry(node).or_default().insert(entry);
        Ok(node)
    }

    fn forget_alias(&mut self, node: LowerNode, entry: LowerEntry) {
        if let Some(set) = self.aliases.get_mut(&node) {
            set.remove(&entry);
        }
    }

    fn unhash(&mut self, entry: LowerEntry) {
        if let Ok(Some(node)) = self.dcache.get(entry).map(|d| d.node) {
            self.forget_alias(node, entry);
        }
        self.dcache.unhash(entry);
    }

    fn file(&self, file: LowerFile) -> Result<&HostOpenFile> {
        self.files.get(&file).ok_or(Error::Lower(Errno::EBADF))
    }
}

/// Pass-through lower filesystem over a host directory
pub struct HostFs {
    /// Root path of the lower directory
    root: PathBuf,
    /// Whether extended attributes are passed through
    xattr: bool,
    state: Arc<RwLock<HostState>>,
}

impl HostFs {
    /// Create a pass-through over `root`
    pub fn new(root: PathBuf, xattr: bool) -> Result<Self> {
        let meta = fs::metadata(&root).map_err(|e| {
            Error::InvalidConfig(format!("lower directory {}: {}", root.display(), e))
        })?;
        if !meta.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "lower path {} is not a directory",
                root.display()
            )));
        }

        let root_node = LowerNode(1);
        let dcache = DentryCache::new(root_node);
        let mut nodes = HashMap::new();
        nodes.insert((meta.dev(), meta.ino()), root_node);
        let mut aliases: HashMap<LowerNode, BTreeSet<LowerEntry>> = HashMap::new();
        aliases.entry(root_node).or_default().insert(dcache.root());

        Ok(Self {
            root,
            xattr,
            state: Arc::new(RwLock::new(HostState {
                dcache,
                nodes,
                aliases,
                files: HashMap::new(),
                next_node: 2,
                next_file: 1,
            })),
        })
    }

    /// Absolute host path of an entry
    fn resolve(&self, state: &HostState, entry: LowerEntry) -> Result<PathBuf> {
        Ok(self.root.join(state.dcache.path(entry)?))
    }

    /// Host path of a node through the first of its names still present
    fn node_path(&self, state: &HostState, node: LowerNode) -> Result<PathBuf> {
        state
            .aliases
            .get(&node)
            .into_iter()
            .flatten()
            .filter_map(|entry| self.resolve(state, *entry).ok())
            .find(|path| fs::symlink_metadata(path).is_ok())
            .ok_or(Error::Lower(Errno::ENOENT))
    }

    /// Metadata of a node through any of its names, or an open file on it
    fn node_metadata(&self, state: &HostState, node: LowerNode) -> Result<Metadata> {
        if let Some(entries) = state.aliases.get(&node) {
            for entry in entries {
                if let Ok(meta) = self
                    .resolve(state, *entry)
                    .and_then(|p| fs::symlink_metadata(p).map_err(os_err))
                {
                    return Ok(meta);
                }
            }
        }
        state
            .files
            .values()
            .find(|f| f.node == node)
            .ok_or(Error::Lower(Errno::ENOENT))?
            .file
            .metadata()
            .map_err(os_err)
    }

    /// Run a host operation that creates `entry`, then bind it to the new object
    fn instantiate<F>(&self, entry: LowerEntry, op: F) -> Result<()>
    where
        F: FnOnce(&Path) -> std::io::Result<()>,
    {
        let path = {
            let state = self.state.read();
            let d = state.dcache.get(entry)?;
            if !d.hashed {
                return Err(Error::Lower(Errno::ENOENT));
            }
            if d.node.is_some() {
                return Err(Error::Lower(Errno::EEXIST));
            }
            self.resolve(&state, entry)?
        };
        op(&path).map_err(os_err)?;
        let meta = fs::symlink_metadata(&path).map_err(os_err)?;
        let mut state = self.state.write();
        state.bind(entry, &meta)?;
        Ok(())
    }

    fn entry_path(&self, entry: LowerEntry) -> Result<PathBuf> {
        let state = self.state.read();
        self.resolve(&state, entry)
    }

    fn check_xattr(&self) -> Result<()> {
        if self.xattr {
            Ok(())
        } else {
            Err(Error::Lower(Errno::EOPNOTSUPP))
        }
    }
}

#[cfg(target_os = "linux")]
mod xattr {
    use super::os_err;
    use crate::error::{Error, Result};
    use std::ffi::{CString, OsStr, OsString};
    use std::os::unix::ffi::{OsStrExt, OsStringExt};
    use std::path::Path;

    fn cstr(bytes: &[u8]) -> Result<CString> {
        CString::new(bytes).map_err(|_| Error::Lower(nix::errno::Errno::EINVAL))
    }

    pub fn get(path: &Path, name: &OsStr) -> Result<Vec<u8>> {
        let p = cstr(path.as_os_str().as_bytes())?;
        let n = cstr(name.as_bytes())?;
        let size = unsafe { libc::lgetxattr(p.as_ptr(), n.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(os_err(std::io::Error::last_os_error()));
        }
        let mut buf = vec![0u8; size as usize];
        let ret = unsafe {
            libc::lgetxattr(p.as_ptr(), n.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
        };
        if ret < 0 {
            return Err(os_err(std::io::Error::last_os_error()));
        }
        buf.truncate(ret as usize);
        Ok(buf)
    }

    pub fn set(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        let p = cstr(path.as_os_str().as_bytes())?;
        let n = cstr(name.as_bytes())?;
        let ret = unsafe {
            libc::lsetxattr(p.as_ptr(), n.as_ptr(), value.as_ptr().cast(), value.len(), flags)
        };
        if ret != 0 {
            return Err(os_err(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn list(path: &Path) -> Result<Vec<OsString>> {
        let p = cstr(path.as_os_str().as_bytes())?;
        let size = unsafe { libc::llistxattr(p.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(os_err(std::io::Error::last_os_error()));
        }
        let mut buf = vec![0u8; size as usize];
        let ret = unsafe { libc::llistxattr(p.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        if ret < 0 {
            return Err(os_err(std::io::Error::last_os_error()));
        }
        buf.truncate(ret as usize);
        Ok(buf
            .split(|b| *b == 0)
            .filter(|name| !name.is_empty())
            .map(|name| OsString::from_vec(name.to_vec()))
            .collect())
    }

    pub fn remove(path: &Path, name: &OsStr) -> Result<()> {
        let p = cstr(path.as_os_str().as_bytes())?;
        let n = cstr(name.as_bytes())?;
        let ret = unsafe { libc::lremovexattr(p.as_ptr(), n.as_ptr()) };
        if ret != 0 {
            return Err(os_err(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod xattr {
    use crate::error::{Error, Result};
    use nix::errno::Errno;
    use std::ffi::{OsStr, OsString};
    use std::path::Path;

    pub fn get(_path: &Path, _name: &OsStr) -> Result<Vec<u8>> {
        Err(Error::Lower(Errno::EOPNOTSUPP))
    }

    pub fn set(_path: &Path, _name: &OsStr, _value: &[u8], _flags: i32) -> Result<()> {
        Err(Error::Lower(Errno::EOPNOTSUPP))
    }

    pub fn list(_path: &Path) -> Result<Vec<OsString>> {
        Err(Error::Lower(Errno::EOPNOTSUPP))
    }

    pub fn remove(_path: &Path, _name: &OsStr) -> Result<()> {
        Err(Error::Lower(Errno::EOPNOTSUPP))
    }
}

impl LowerFs for HostFs {
    fn root(&self) -> LowerEntry {
        self.state.read().dcache.root()
    }

    fn capabilities(&self, _node: LowerNode) -> Capabilities {
        if self.xattr {
            Capabilities::XATTR | Capabilities::MMAP
        } else {
            Capabilities::MMAP
        }
    }

    fn dget(&self, entry: LowerEntry) -> Result<()> {
        self.state.write().dcache.dget(entry)
    }

    fn dput(&self, entry: LowerEntry) {
        self.state.write().dcache.dput(entry)
    }

    fn entry(&self, entry: LowerEntry) -> Result<EntryInfo> {
        // no silly-rename signal exists on a host directory
        self.state.read().dcache.info(entry)
    }

    fn lookup(&self, dir: LowerEntry, name: &OsStr) -> Result<LowerEntry> {
        use std::os::unix::ffi::OsStrExt;
        if name.is_empty() || name.as_bytes().contains(&b'/') || name == "." || name == ".." {
            return Err(Error::Lower(Errno::EINVAL));
        }
        let path = self.entry_path(dir)?.join(name);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(os_err(e)),
        };

        let mut state = self.state.write();
        let entry = match state.dcache.child(dir, name) {
            Some(entry) => entry,
            None => state.dcache.alloc(dir, name, None),
        };
        match meta {
            Some(meta) => {
                state.bind(entry, &meta)?;
            }
            None => {
                if let Some(old) = state.dcache.get_mut(entry)?.node.take() {
                    state.forget_alias(old, entry);
                }
            }
        }
        state.dcache.dget(entry)?;
        debug!("host lookup {:?} -> {:?}", path, entry);
        Ok(entry)
    }

    fn create(&self, _dir: LowerNode, entry: LowerEntry, mode: u32) -> Result<()> {
        self.instantiate(entry, |path| {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode & 0o7777)
                .open(path)
                .map(drop)
        })
    }

    fn link(&self, old: LowerEntry, _dir: LowerNode, new: LowerEntry) -> Result<()> {
        let old_path = self.entry_path(old)?;
        self.instantiate(new, |path| fs::hard_link(&old_path, path))
    }

    fn unlink(&self, _dir: LowerNode, entry: LowerEntry) -> Result<()> {
        let path = self.entry_path(entry)?;
        fs::remove_file(&path).map_err(os_err)?;
        self.state.write().unhash(entry);
        Ok(())
    }

    fn symlink(&self, _dir: LowerNode, entry: LowerEntry, target: &OsStr) -> Result<()> {
        self.instantiate(entry, |path| std::os::unix::fs::symlink(target, path))
    }

    fn mkdir(&self, _dir: LowerNode, entry: LowerEntry, mode: u32) -> Result<()> {
        self.instantiate(entry, |path| {
            fs::DirBuilder::new().mode(mode & 0o7777).create(path)
        })
    }

    fn rmdir(&self, _dir: LowerNode, entry: LowerEntry) -> Result<()> {
        let path = self.entry_path(entry)?;
        fs::remove_dir(&path).map_err(os_err)?;
        self.state.write().unhash(entry);
        Ok(())
    }

    fn mknod(&self, _dir: LowerNode, entry: LowerEntry, mode: u32, rdev: u32) -> Result<()> {
        use nix::sys::stat::{Mode, SFlag};
        self.instantiate(entry, |path| {
            let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT as u32);
            let perm = Mode::from_bits_truncate(mode & 0o7777);
            nix::sys::stat::mknod(path, kind, perm, rdev as libc::dev_t).map_err(std::io::Error::from)
        })
    }

    fn rename(
        &self,
        _old_dir: LowerNode,
        old: LowerEntry,
        _new_dir: LowerNode,
        new: LowerEntry,
    ) -> Result<()> {
        let (old_path, new_path, new_parent, new_name) = {
            let state = self.state.read();
            let target = state.dcache.get(new)?;
            if target.node.is_some() && target.node == state.dcache.get(old)?.node {
                return Ok(());
            }
            (
                self.resolve(&state, old)?,
                self.resolve(&state, new)?,
                target.parent.ok_or(Error::Lower(Errno::EBUSY))?,
                target.name.clone(),
            )
        };
        fs::rename(&old_path, &new_path).map_err(os_err)?;
        let mut state = self.state.write();
        state.unhash(new);
        state.dcache.d_move(old, new_parent, &new_name, new)
    }

    fn readlink(&self, entry: LowerEntry) -> Result<OsString> {
        let path = self.entry_path(entry)?;
        fs::read_link(path)
            .map(PathBuf::into_os_string)
            .map_err(os_err)
    }

    fn permission(&self, node: LowerNode, mask: i32) -> Result<()> {
        use nix::unistd::{access, AccessFlags};
        let path = {
            let state = self.state.read();
            self.node_path(&state, node)?
        };
        // symlink modes are never checked
        if fs::symlink_metadata(&path).map_err(os_err)?.file_type().is_symlink() {
            return Ok(());
        }
        access(&path, AccessFlags::from_bits_truncate(mask)).map_err(Error::Lower)
    }

    fn getattr(&self, node: LowerNode) -> Result<LowerAttr> {
        let state = self.state.read();
        Ok(LowerAttr::from_metadata(&self.node_metadata(&state, node)?))
    }

    fn setattr(&self, entry: LowerEntry, attr: &SetAttr) -> Result<()> {
        let (path, open_file) = {
            let state = self.state.read();
            let open_file = match attr.file {
                Some(file) if attr.valid.contains(AttrMask::FILE) => {
                    Some(Arc::clone(&state.file(file)?.file))
                }
                _ => None,
            };
            (self.resolve(&state, entry)?, open_file)
        };

        if attr.valid.contains(AttrMask::MODE) {
            fs::set_permissions(&path, fs::Permissions::from_mode(attr.mode & 0o7777))
                .map_err(os_err)?;
        }
        if attr.valid.intersects(AttrMask::UID | AttrMask::GID) {
            let uid = attr.valid.contains(AttrMask::UID).then_some(attr.uid);
            let gid = attr.valid.contains(AttrMask::GID).then_some(attr.gid);
            std::os::unix::fs::lchown(&path, uid, gid).map_err(os_err)?;
        }
        if attr.valid.contains(AttrMask::SIZE) {
            match &open_file {
                Some(file) => file.set_len(attr.size),
                None => OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .and_then(|f| f.set_len(attr.size)),
            }
            .map_err(os_err)?;
        }
        if attr.valid.intersects(AttrMask::ATIME | AttrMask::MTIME) {
            let mut times = fs::FileTimes::new();
            if attr.valid.contains(AttrMask::ATIME) {
                times = times.set_accessed(attr.atime);
            }
            if attr.valid.contains(AttrMask::MTIME) {
                times = times.set_modified(attr.mtime);
            }
            match &open_file {
                Some(file) => file.set_times(times),
                None => File::open(&path).and_then(|f| f.set_times(times)),
            }
            .map_err(os_err)?;
        }
        Ok(())
    }

    fn getxattr(&self, entry: LowerEntry, name: &OsStr) -> Result<Vec<u8>> {
        self.check_xattr()?;
        xattr::get(&self.entry_path(entry)?, name)
    }

    fn setxattr(
        &self,
        entry: LowerEntry,
        name: &OsStr,
        value: &[u8],
        flags: XattrFlags,
    ) -> Result<()> {
        self.check_xattr()?;
        xattr::set(&self.entry_path(entry)?, name, value, flags.bits() as i32)
    }

    fn listxattr(&self, entry: LowerEntry) -> Result<Vec<OsString>> {
        self.check_xattr()?;
        xattr::list(&self.entry_path(entry)?)
    }

    fn removexattr(&self, entry: LowerEntry, name: &OsStr) -> Result<()> {
        self.check_xattr()?;
        xattr::remove(&self.entry_path(entry)?, name)
    }

    fn open(&self, entry: LowerEntry, flags: i32) -> Result<LowerFile> {
        let (path, node) = {
            let state = self.state.read();
            let node = state.dcache.positive(entry)?;
            (self.resolve(&state, entry)?, node)
        };
        let accmode = flags & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
            .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
            .append(flags & libc::O_APPEND != 0)
            .truncate(flags & libc::O_TRUNC != 0)
            .custom_flags(flags & (libc::O_NOFOLLOW | libc::O_NONBLOCK | libc::O_SYNC))
            .open(&path)
            .map_err(os_err)?;

        let mut state = self.state.write();
        let id = LowerFile(state.next_file);
        state.next_file += 1;
        state.files.insert(
            id,
            HostOpenFile {
                file: Arc::new(file),
                node,
            },
        );
        Ok(id)
    }

    fn release(&self, file: LowerFile) {
        self.state.write().files.remove(&file);
    }

    fn read(&self, file: LowerFile, offset: u64, size: u32) -> Result<Vec<u8>> {
        let file = Arc::clone(&self.state.read().file(file)?.file);
        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = file
                .read_at(&mut buffer[filled..], offset + filled as u64)
                .map_err(os_err)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    fn write(&self, file: LowerFile, offset: u64, data: &[u8]) -> Result<u32> {
        let file = Arc::clone(&self.state.read().file(file)?.file);
        file.write_all_at(data, offset).map_err(os_err)?;
        Ok(data.len() as u32)
    }

    fn readdir(&self, dir: LowerEntry) -> Result<Vec<LowerDirEntry>> {
        let path = self.entry_path(dir)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&path).map_err(os_err)? {
            let entry = entry.map_err(os_err)?;
            let file_type = entry.file_type().map_err(os_err)?;
            entries.push(LowerDirEntry {
                name: entry.file_name(),
                kind: FileKind::from(file_type),
                ino: entry.ino(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn vm_ops(&self, file: LowerFile) -> Result<Arc<dyn LowerVmOps>> {
        let state = self.state.read();
        let meta = state.file(file)?.file.metadata().map_err(os_err)?;
        if !meta.is_file() {
            return Err(Error::Lower(Errno::ENODEV));
        }
        Ok(Arc::new(HostVmOps {
            state: Arc::clone(&self.state),
        }))
    }
}

/// Page-in from a host file; there is no write-fault handler
struct HostVmOps {
    state: Arc<RwLock<HostState>>,
}

impl LowerVmOps for HostVmOps {
    fn fault(&self, vma: &VmArea, vmf: &VmFault) -> Result<FaultOutcome> {
        let MappedFile::Lower(file) = vma.file else {
            return Err(Error::InvalidArgument(
                "mapping is not bound to a lower file".to_string(),
            ));
        };
        let file = Arc::clone(&self.state.read().file(file)?.file);
        let size = file.metadata().map_err(os_err)?.len();
        let offset = vmf.pgoff * PAGE_SIZE;
        if offset >= size {
            return Ok(FaultOutcome::SigBus);
        }
        let mut page = vec![0u8; PAGE_SIZE as usize];
        let want = (size - offset).min(PAGE_SIZE) as usize;
        file.read_exact_at(&mut page[..want], offset).map_err(os_err)?;
        Ok(FaultOutcome::Page(Bytes::from(page)))
    }
}
