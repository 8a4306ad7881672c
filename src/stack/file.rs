//! Open shadow files and the data passthrough

use super::{EntryIdx, InodeOp, NodeIdx, StackFs};
use crate::error::{Error, Result};
use crate::lower::{LowerDirEntry, LowerFile, LowerFs};
use crate::vm::LowerVmOps;
use nix::errno::Errno;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

#[cfg(target_os = "linux")]
const O_DIRECT: i32 = libc::O_DIRECT;
#[cfg(not(target_os = "linux"))]
const O_DIRECT: i32 = 0;

/// Handle of an open shadow file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIdx(pub u64);

/// An open file of the stacking layer
pub struct ShadowFile {
    pub node: NodeIdx,
    /// Entry the file was opened through; referenced while open
    pub entry: EntryIdx,
    pub lower: LowerFile,
    /// Open flags
    pub flags: i32,
    /// Lower mapping operations, fetched on first mmap
    pub(crate) vm_ops: OnceLock<Arc<dyn LowerVmOps>>,
}

impl ShadowFile {
    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let accmode = self.flags & libc::O_ACCMODE;
        accmode == libc::O_WRONLY || accmode == libc::O_RDWR
    }

    /// Check if opened for unbuffered I/O
    pub fn is_direct(&self) -> bool {
        O_DIRECT != 0 && self.flags & O_DIRECT != 0
    }
}

/// Manages open shadow files
pub(crate) struct FileTable {
    next_fh: AtomicU64,
    files: RwLock<HashMap<FileIdx, Arc<ShadowFile>>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, node: NodeIdx, entry: EntryIdx, lower: LowerFile, flags: i32) -> FileIdx {
        let fh = FileIdx(self.next_fh.fetch_add(1, Ordering::SeqCst));
        let file = ShadowFile {
            node,
            entry,
            lower,
            flags,
            vm_ops: OnceLock::new(),
        };
        self.files.write().insert(fh, Arc::new(file));
        fh
    }

    pub fn get(&self, fh: FileIdx) -> Result<Arc<ShadowFile>> {
        self.files
            .read()
            .get(&fh)
            .cloned()
            .ok_or(Error::Lower(Errno::EBADF))
    }

    pub fn close(&self, fh: FileIdx) -> Option<Arc<ShadowFile>> {
        self.files.write().remove(&fh)
    }

    pub fn drain(&self) -> Vec<Arc<ShadowFile>> {
        self.files.write().drain().map(|(_, f)| f).collect()
    }
}

impl<L: LowerFs> StackFs<L> {
    /// Open a regular file through `entry`
    pub fn open(&self, entry: EntryIdx, flags: i32) -> Result<FileIdx> {
        debug!("open(entry={:?}, flags={:#x})", entry, flags);
        let node = self.graph.positive(entry)?;
        self.graph.lower_node(node, InodeOp::Open)?;

        let lower_path = self.lower_path(entry)?;
        let lower_file = self.lower.open(lower_path.entry(), flags)?;
        if let Err(e) = self.graph.get_ref(entry) {
            self.lower.release(lower_file);
            return Err(e);
        }
        if let Err(e) = self.graph.open_file(node) {
            self.lower.release(lower_file);
            self.put_entry(entry);
            return Err(e);
        }
        let fh = self.files.register(node, entry, lower_file, flags);

        self.copy_attr_all(node);
        self.copy_inode_size(node);
        Ok(fh)
    }

    /// Close an open file
    pub fn release(&self, fh: FileIdx) {
        debug!("release(fh={:?})", fh);
        let Some(file) = self.files.close(fh) else {
            return;
        };
        self.lower.release(file.lower);
        // the entry reference below keeps the node attached
        self.graph.close_file(file.node);
        self.put_entry(file.entry);
    }

    /// Get an open file
    pub fn file(&self, fh: FileIdx) -> Result<Arc<ShadowFile>> {
        self.files.get(fh)
    }

    pub fn read(&self, fh: FileIdx, offset: u64, size: u32) -> Result<Vec<u8>> {
        let file = self.files.get(fh)?;
        if file.is_direct() {
            return self.direct_io(fh);
        }
        let data = self.lower.read(file.lower, offset, size)?;
        self.copy_attr_atime(file.node);
        Ok(data)
    }

    pub fn write(&self, fh: FileIdx, offset: u64, data: &[u8]) -> Result<u32> {
        let file = self.files.get(fh)?;
        if file.is_direct() {
            return self.direct_io(fh);
        }
        if !file.is_writable() {
            return Err(Error::Lower(Errno::EBADF));
        }
        let written = self.lower.write(file.lower, offset, data)?;
        self.copy_inode_size(file.node);
        self.copy_attr_times(file.node);
        Ok(written)
    }

    /// Unbuffered I/O bypassing the layer is never supported
    pub fn direct_io<T>(&self, fh: FileIdx) -> Result<T> {
        debug!("direct_io(fh={:?}) rejected", fh);
        Err(Error::InvalidArgument(
            "direct I/O is not supported on stacked files".to_string(),
        ))
    }

    /// List a directory
    pub fn readdir(&self, entry: EntryIdx) -> Result<Vec<LowerDirEntry>> {
        debug!("readdir(entry={:?})", entry);
        let node = self.graph.positive(entry)?;
        self.graph.lower_node(node, InodeOp::Readdir)?;
        let lower_path = self.lower_path(entry)?;
        let entries = self.lower.readdir(lower_path.entry())?;
        self.copy_attr_atime(node);
        Ok(entries)
    }
}
