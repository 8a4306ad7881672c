//! Stacking layer
//!
//! [`StackFs`] mirrors a lower filesystem one-to-one. Every operation resolves
//! shadow objects to their lower counterparts, takes the directory locks it
//! needs, delegates to the lower primitive and propagates attributes back up.
//! All lower references and locks are Drop guards, so they are released on
//! every exit path.

mod attr;
mod file;
mod interpose;
mod lock;
mod mmap;
mod namei;
mod rename;
mod shadow;
mod xattr;

pub use file::{FileIdx, ShadowFile};
pub use lock::{DirGuard, LockScope, LockTable};
pub use mmap::MappingContext;
pub use rename::RenameFlags;
pub use shadow::{
    EntryIdx, InodeOp, NodeAttr, NodeIdx, NodeKind, Reaped, ShadowEntry, ShadowGraph, ShadowNode,
};

use crate::config::StackConfig;
use crate::error::{Error, Result};
use crate::lower::{LowerEntry, LowerFs, LowerNode};
use file::FileTable;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Largest size a file may be truncated or extended to
pub const MAX_FILE_SIZE: u64 = i64::MAX as u64;

/// Scoped reference on a lower entry, dropped with the guard
pub(crate) struct LowerPath<'a, L: LowerFs> {
    lower: &'a L,
    entry: LowerEntry,
}

impl<'a, L: LowerFs> LowerPath<'a, L> {
    pub(crate) fn get(lower: &'a L, entry: LowerEntry) -> Result<Self> {
        lower.dget(entry)?;
        Ok(Self { lower, entry })
    }

    pub(crate) fn entry(&self) -> LowerEntry {
        self.entry
    }
}

impl<L: LowerFs> Drop for LowerPath<'_, L> {
    fn drop(&mut self) {
        self.lower.dput(self.entry);
    }
}

/// Lower parent directory of an entry, referenced for the scope
pub(crate) struct LowerParent<'a, L: LowerFs> {
    pub dir: LowerPath<'a, L>,
    pub node: LowerNode,
}

/// Lower parent directory held locked; unlocks before the reference drops
pub(crate) struct LockedParent<'a, L: LowerFs> {
    _guard: DirGuard<'a>,
    pub parent: LowerParent<'a, L>,
}

impl<L: LowerFs> LockedParent<'_, L> {
    pub fn node(&self) -> LowerNode {
        self.parent.node
    }
}

/// Stacking filesystem over a lower filesystem `L`
pub struct StackFs<L: LowerFs> {
    lower: Arc<L>,
    graph: ShadowGraph,
    locks: LockTable,
    files: FileTable,
}

impl<L: LowerFs> StackFs<L> {
    /// Stack a new layer on `lower`
    pub fn new(lower: Arc<L>, config: &StackConfig) -> Result<Self> {
        // held by the root shadow entry until the layer is dropped
        let root = lower.root();
        lower.dget(root)?;
        let resolved = lower.entry(root).and_then(|info| {
            let node = info
                .node
                .ok_or_else(|| Error::StaleReference("lower root is negative".to_string()))?;
            Ok((node, lower.getattr(node)?))
        });
        let (root_node, attr) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                lower.dput(root);
                return Err(e);
            }
        };
        let graph = ShadowGraph::new(root, root_node, &attr, config.max_nodes);

        debug!("stacked layer on lower root {:?}", root_node);
        Ok(Self {
            lower,
            graph,
            locks: LockTable::new(),
            files: FileTable::new(),
        })
    }

    /// Get the lower filesystem
    pub fn lower(&self) -> &Arc<L> {
        &self.lower
    }

    /// Root shadow entry
    pub fn root(&self) -> EntryIdx {
        EntryIdx::ROOT
    }

    /// Snapshot of a shadow entry
    pub fn entry(&self, entry: EntryIdx) -> Result<ShadowEntry> {
        self.graph.entry(entry)
    }

    /// Snapshot of a shadow node
    pub fn node(&self, node: NodeIdx) -> Result<ShadowNode> {
        self.graph.node(node)
    }

    /// An entry naming `node`, preferring hashed ones
    pub fn alias(&self, node: NodeIdx) -> Option<EntryIdx> {
        self.graph.alias(node)
    }

    /// Take another reference on a shadow entry
    pub fn get_entry(&self, entry: EntryIdx) -> Result<()> {
        self.graph.get_ref(entry)
    }

    /// Drop a reference returned by lookup or taken with [`StackFs::get_entry`]
    pub fn put_entry(&self, entry: EntryIdx) {
        if let Some(reaped) = self.graph.put_ref(entry) {
            self.release_reaped(reaped);
        }
    }

    /// Number of live shadow nodes
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of live shadow entries
    pub fn entry_count(&self) -> usize {
        self.graph.entry_count()
    }

    fn release_reaped(&self, reaped: Reaped) {
        self.lower.dput(reaped.lower);
        if let Some(node) = reaped.evicted {
            trace!("evicted shadow node {:?}", node);
        }
    }

    /// Scoped reference on the lower counterpart of `entry`
    pub(crate) fn lower_path(&self, entry: EntryIdx) -> Result<LowerPath<'_, L>> {
        LowerPath::get(&*self.lower, self.graph.entry(entry)?.lower)
    }

    /// Reference the lower parent directory of `lower_entry`
    pub(crate) fn lower_parent(&self, lower_entry: LowerEntry) -> Result<LowerParent<'_, L>> {
        let parent = self
            .lower
            .entry(lower_entry)?
            .parent
            .ok_or_else(|| Error::InvalidArgument("the root has no parent".to_string()))?;
        let dir = LowerPath::get(&*self.lower, parent)?;
        let node = self
            .lower
            .entry(parent)?
            .node
            .ok_or_else(|| Error::StaleReference(format!("lower parent {:?} is negative", parent)))?;
        Ok(LowerParent { dir, node })
    }

    /// Reference and lock the lower parent directory of `lower_entry`
    pub(crate) fn lock_parent(&self, lower_entry: LowerEntry) -> Result<LockedParent<'_, L>> {
        let parent = self.lower_parent(lower_entry)?;
        let guard = self.locks.lock_dir(parent.node);
        Ok(LockedParent {
            _guard: guard,
            parent,
        })
    }

    /// Check, under the directory lock, that `lower_entry` is still a hashed
    /// child of `parent`
    pub(crate) fn validate_locked(&self, lower_entry: LowerEntry, parent: LowerEntry) -> Result<()> {
        let info = self.lower.entry(lower_entry)?;
        if info.parent != Some(parent) || !info.hashed {
            warn!(
                "lower entry {:?} moved or detached before the lock was taken",
                lower_entry
            );
            return Err(Error::RaceDetected(format!(
                "{:?} is no longer a child of {:?}",
                info.name, parent
            )));
        }
        Ok(())
    }

    /// Check that the shadow parent of `entry` is `dir`
    pub(crate) fn check_parent(&self, dir: NodeIdx, entry: EntryIdx) -> Result<()> {
        let parent = self
            .graph
            .entry(entry)?
            .parent
            .ok_or_else(|| Error::InvalidArgument("the root has no parent".to_string()))?;
        if self.graph.positive(parent)? != dir {
            return Err(Error::InvalidArgument(format!(
                "entry {} is not in directory {}",
                entry.0, dir.0
            )));
        }
        Ok(())
    }
}

impl<L: LowerFs> Drop for StackFs<L> {
    fn drop(&mut self) {
        for file in self.files.drain() {
            self.lower.release(file.lower);
        }
        for lower in self.graph.drain() {
            self.lower.dput(lower);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::lower::MemFs;
    use std::ffi::OsStr;

    pub fn stack() -> StackFs<MemFs> {
        stack_on(MemFs::new())
    }

    pub fn stack_on(lower: MemFs) -> StackFs<MemFs> {
        StackFs::new(Arc::new(lower), &StackConfig::default()).unwrap()
    }

    pub fn create(fs: &StackFs<MemFs>, parent: EntryIdx, name: &str) -> (EntryIdx, NodeIdx) {
        let dir = fs.entry(parent).unwrap().node.unwrap();
        let entry = fs.lookup(parent, OsStr::new(name)).unwrap();
        let node = fs.create(dir, entry, 0o644).unwrap();
        (entry, node)
    }

    pub fn mkdir(fs: &StackFs<MemFs>, parent: EntryIdx, name: &str) -> (EntryIdx, NodeIdx) {
        let dir = fs.entry(parent).unwrap().node.unwrap();
        let entry = fs.lookup(parent, OsStr::new(name)).unwrap();
        let node = fs.mkdir(dir, entry, 0o755).unwrap();
        (entry, node)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::lower::MemFs;

    #[test]
    fn test_drop_releases_every_lower_reference() {
        let lower = Arc::new(MemFs::new());
        let fs = StackFs::new(Arc::clone(&lower), &StackConfig::default()).unwrap();
        assert_eq!(lower.outstanding_refs(), 1);

        let (d, _) = mkdir(&fs, fs.root(), "d");
        let (f, _) = create(&fs, d, "f");
        let file = fs.open(f, libc::O_RDWR).unwrap();
        fs.write(file, 0, b"data").unwrap();
        assert!(lower.outstanding_refs() > 1);

        drop(fs);
        assert_eq!(lower.outstanding_refs(), 0);
    }

    #[test]
    fn test_host_directory_round_trip() {
        use crate::lower::{HostFs, XattrFlags};
        use std::ffi::OsStr;

        let dir = tempfile::tempdir().unwrap();
        let lower = Arc::new(HostFs::new(dir.path().to_path_buf(), false).unwrap());
        let fs = StackFs::new(lower, &StackConfig::default()).unwrap();

        let d = fs.lookup(fs.root(), OsStr::new("d")).unwrap();
        let d_node = fs.mkdir(NodeIdx::ROOT, d, 0o755).unwrap();
        let f = fs.lookup(d, OsStr::new("f")).unwrap();
        fs.create(d_node, f, 0o644).unwrap();
        let file = fs.open(f, libc::O_RDWR).unwrap();
        fs.write(file, 0, b"stacked").unwrap();
        fs.release(file);
        assert_eq!(std::fs::read(dir.path().join("d/f")).unwrap(), b"stacked");

        let g = fs.lookup(fs.root(), OsStr::new("g")).unwrap();
        fs.rename(d_node, f, NodeIdx::ROOT, g, RenameFlags::empty())
            .unwrap();
        assert!(dir.path().join("g").is_file());
        assert!(!dir.path().join("d/f").exists());

        let l = fs.lookup(fs.root(), OsStr::new("l")).unwrap();
        fs.symlink(NodeIdx::ROOT, l, OsStr::new("g")).unwrap();
        assert_eq!(fs.readlink(l).unwrap(), std::ffi::OsString::from("g"));
        assert!(matches!(
            fs.setxattr(l, OsStr::new("user.a"), Some(b"1"), XattrFlags::empty()),
            Err(Error::UnsupportedOperation(_))
        ));

        fs.unlink(NodeIdx::ROOT, f).unwrap();
        fs.rmdir(NodeIdx::ROOT, d).unwrap();
        assert!(!dir.path().join("g").exists());
        assert!(!dir.path().join("d").exists());
        for e in [d, f, g, l] {
            fs.put_entry(e);
        }
    }

    #[test]
    fn test_check_parent_rejects_foreign_directory() {
        let fs = stack();
        let (_, d_node) = mkdir(&fs, fs.root(), "d");
        let (f, _) = create(&fs, fs.root(), "f");
        assert!(matches!(
            fs.unlink(d_node, f),
            Err(Error::InvalidArgument(_))
        ));
    }
}
