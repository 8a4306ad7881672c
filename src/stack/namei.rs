//! Structural operations
//!
//! Each operation resolves the shadow entry to its lower entry, locks the
//! lower parent, invokes the lower primitive, interposes the result and
//! propagates the parent's attributes. Guards release the lock and the lower
//! references on every path.

use super::{EntryIdx, InodeOp, NodeIdx, StackFs};
use crate::error::{Error, Result};
use crate::lower::{LowerEntry, LowerFs, LowerNode};
use nix::errno::Errno;
use std::ffi::OsStr;
use tracing::{debug, warn};

impl<L: LowerFs> StackFs<L> {
    /// Resolve `name` in directory `parent`.
    ///
    /// The returned entry carries one reference owned by the caller and may be
    /// negative; create-family operations fill negative entries.
    pub fn lookup(&self, parent: EntryIdx, name: &OsStr) -> Result<EntryIdx> {
        debug!("lookup(parent={:?}, name={:?})", parent, name);
        let dir = self.graph.positive(parent)?;
        let dir_lower = self.graph.lower_node(dir, InodeOp::Lookup)?;

        if let Some(entry) = self.graph.cached_child(parent, name) {
            return Ok(entry);
        }

        let lower_dir = self.lower_path(parent)?;
        let _guard = self.locks.lock_dir(dir_lower);
        // another lookup may have raced us to the lock
        if let Some(entry) = self.graph.cached_child(parent, name) {
            return Ok(entry);
        }

        let lower_entry = self.lower.lookup(lower_dir.entry(), name)?;
        let entry = match self.graph.alloc_entry(parent, name, lower_entry) {
            Ok(entry) => entry,
            Err(e) => {
                self.lower.dput(lower_entry);
                return Err(e);
            }
        };

        let interposed = self.lower.entry(lower_entry).and_then(|info| {
            if info.is_negative() {
                Ok(())
            } else {
                self.interpose(entry, lower_entry).map(drop)
            }
        });
        if let Err(e) = interposed {
            self.put_entry(entry);
            return Err(e);
        }

        self.copy_attr_atime(dir);
        Ok(entry)
    }

    /// Delegate one create-family primitive on the negative `entry` in `dir`
    fn make_node<F>(&self, dir: NodeIdx, entry: EntryIdx, op: InodeOp, primitive: F) -> Result<NodeIdx>
    where
        F: FnOnce(&L, LowerNode, LowerEntry) -> Result<()>,
    {
        self.graph.lower_node(dir, op)?;
        self.check_parent(dir, entry)?;

        let lower_entry = self.lower_path(entry)?;
        let parent = self.lock_parent(lower_entry.entry())?;
        primitive(&*self.lower, parent.node(), lower_entry.entry())?;

        let node = self.interpose(entry, lower_entry.entry())?;
        self.copy_attr_times(dir);
        self.copy_inode_size(dir);
        Ok(node)
    }

    /// Create a regular file
    pub fn create(&self, dir: NodeIdx, entry: EntryIdx, mode: u32) -> Result<NodeIdx> {
        debug!("create(dir={:?}, entry={:?}, mode={:o})", dir, entry, mode);
        self.make_node(dir, entry, InodeOp::Create, |lower, dir, entry| {
            lower.create(dir, entry, mode)
        })
    }

    pub fn symlink(&self, dir: NodeIdx, entry: EntryIdx, target: &OsStr) -> Result<NodeIdx> {
        debug!("symlink(dir={:?}, entry={:?}, target={:?})", dir, entry, target);
        self.make_node(dir, entry, InodeOp::Symlink, |lower, dir, entry| {
            lower.symlink(dir, entry, target)
        })
    }

    pub fn mkdir(&self, dir: NodeIdx, entry: EntryIdx, mode: u32) -> Result<NodeIdx> {
        debug!("mkdir(dir={:?}, entry={:?}, mode={:o})", dir, entry, mode);
        let node = self.make_node(dir, entry, InodeOp::Mkdir, |lower, dir, entry| {
            lower.mkdir(dir, entry, mode)
        })?;
        self.copy_nlink(dir);
        Ok(node)
    }

    pub fn mknod(&self, dir: NodeIdx, entry: EntryIdx, mode: u32, rdev: u32) -> Result<NodeIdx> {
        debug!("mknod(dir={:?}, entry={:?}, mode={:o}, rdev={})", dir, entry, mode, rdev);
        self.make_node(dir, entry, InodeOp::Mknod, |lower, dir, entry| {
            lower.mknod(dir, entry, mode, rdev)
        })
    }

    /// Link the object of `old` at the negative entry `new` in `dir`.
    ///
    /// Returns `None` when the lower filesystem left `new` negative.
    pub fn link(&self, old: EntryIdx, dir: NodeIdx, new: EntryIdx) -> Result<Option<NodeIdx>> {
        debug!("link(old={:?}, dir={:?}, new={:?})", old, dir, new);
        self.graph.lower_node(dir, InodeOp::Link)?;
        self.check_parent(dir, new)?;
        let old_node = self.graph.positive(old)?;
        let saved_size = self.graph.node(old_node)?.attr.size;

        let lower_old = self.lower_path(old)?;
        let lower_new = self.lower_path(new)?;
        let parent = self.lock_parent(lower_new.entry())?;
        self.lower
            .link(lower_old.entry(), parent.node(), lower_new.entry())?;
        if self.lower.entry(lower_new.entry())?.is_negative() {
            return Ok(None);
        }

        let node = self.interpose(new, lower_new.entry())?;
        self.copy_attr_times(dir);
        self.copy_inode_size(dir);
        self.copy_nlink(old_node);
        self.graph.update(node, |n| n.attr.size = saved_size)?;
        Ok(Some(node))
    }

    pub fn unlink(&self, dir: NodeIdx, entry: EntryIdx) -> Result<()> {
        debug!("unlink(dir={:?}, entry={:?})", dir, entry);
        self.graph.lower_node(dir, InodeOp::Unlink)?;
        self.check_parent(dir, entry)?;

        let lower_entry = self.lower_path(entry)?;
        let parent = self.lock_parent(lower_entry.entry())?;
        self.validate_locked(lower_entry.entry(), parent.parent.dir.entry())?;

        match self.lower.unlink(parent.node(), lower_entry.entry()) {
            Ok(()) => {}
            Err(Error::Lower(Errno::EBUSY)) if self.silly_renamed(lower_entry.entry()) => {
                warn!(
                    "unlink of silly-renamed {:?} reported busy, treating as done",
                    lower_entry.entry()
                );
            }
            Err(e) => return Err(e),
        }

        self.copy_attr_times(dir);
        self.copy_inode_size(dir);
        if let Some(victim) = self.graph.entry(entry)?.node {
            let ctime = self.graph.node(dir)?.attr.ctime;
            self.refresh_victim(victim);
            self.graph.update(victim, |n| n.attr.ctime = ctime)?;
        }
        if let Some(reaped) = self.graph.drop_entry(entry) {
            self.release_reaped(reaped);
        }
        Ok(())
    }

    pub fn rmdir(&self, dir: NodeIdx, entry: EntryIdx) -> Result<()> {
        debug!("rmdir(dir={:?}, entry={:?})", dir, entry);
        self.graph.lower_node(dir, InodeOp::Rmdir)?;
        self.check_parent(dir, entry)?;

        let lower_entry = self.lower_path(entry)?;
        let parent = self.lock_parent(lower_entry.entry())?;
        self.validate_locked(lower_entry.entry(), parent.parent.dir.entry())?;
        self.lower.rmdir(parent.node(), lower_entry.entry())?;

        let victim = self.graph.entry(entry)?.node;
        if let Some(reaped) = self.graph.drop_entry(entry) {
            self.release_reaped(reaped);
        }
        if let Some(victim) = victim {
            // gone if the drop above evicted it
            let _ = self.graph.update(victim, |n| n.attr.nlink = 0);
        }
        self.copy_attr_times(dir);
        self.copy_inode_size(dir);
        self.copy_nlink(dir);
        Ok(())
    }

    fn silly_renamed(&self, lower_entry: LowerEntry) -> bool {
        self.lower
            .entry(lower_entry)
            .map(|info| info.silly_renamed)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::NodeKind;
    use super::*;
    use crate::lower::MemFs;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_create_in_directory_propagates_parent() {
        let fs = stack();
        let (d, d_node) = mkdir(&fs, fs.root(), "D");
        let before = fs.getattr(d).unwrap().mtime;

        let dir_lower = fs.node(d_node).unwrap().lower;
        let f = fs.lookup(d, OsStr::new("f")).unwrap();
        let f_node = fs.create(d_node, f, 0o640).unwrap();

        let lower_dir = fs.lower().getattr(dir_lower).unwrap();
        let cached = fs.node(d_node).unwrap().attr;
        assert_eq!(cached.mtime, lower_dir.mtime);
        assert_eq!(cached.size, lower_dir.size);
        assert!(cached.mtime >= before);

        let attr = fs.getattr(f).unwrap();
        assert_eq!(attr.size, 0);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(fs.node(f_node).unwrap().kind, NodeKind::File);
    }

    #[test]
    fn test_mknod_fifo_is_special() {
        let fs = stack();
        let (d, d_node) = mkdir(&fs, fs.root(), "D");
        let dir_lower = fs.node(d_node).unwrap().lower;

        let p = fs.lookup(d, OsStr::new("pipe")).unwrap();
        let mode = libc::S_IFIFO as u32 | 0o644;
        let p_node = fs.mknod(d_node, p, mode, 0).unwrap();
        assert_eq!(fs.node(p_node).unwrap().kind, NodeKind::Special);
        assert_eq!(fs.getattr(p).unwrap().perm, 0o644);

        let lower_dir = fs.lower().getattr(dir_lower).unwrap();
        let cached = fs.node(d_node).unwrap().attr;
        assert_eq!(cached.mtime, lower_dir.mtime);
        assert_eq!(cached.size, lower_dir.size);

        assert!(matches!(
            fs.open(p, libc::O_RDONLY),
            Err(Error::UnsupportedOperation(_))
        ));
        assert!(matches!(
            fs.mknod(d_node, p, mode, 0),
            Err(Error::Lower(Errno::EEXIST))
        ));
    }

    #[test]
    fn test_create_existing_forwards_eexist() {
        let fs = stack();
        let (f, _) = create(&fs, fs.root(), "f");
        let result = fs.create(NodeIdx::ROOT, f, 0o644);
        assert!(matches!(result, Err(Error::Lower(Errno::EEXIST))));
    }

    #[test]
    fn test_create_in_file_is_unsupported() {
        let fs = stack();
        let (f, f_node) = create(&fs, fs.root(), "f");
        assert!(matches!(
            fs.lookup(f, OsStr::new("x")),
            Err(Error::UnsupportedOperation(_))
        ));
        assert!(matches!(
            fs.mkdir(f_node, f, 0o755),
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_lookup_is_cached_and_counts_references() {
        let fs = stack();
        create(&fs, fs.root(), "f");
        let a = fs.lookup(fs.root(), OsStr::new("f")).unwrap();
        let b = fs.lookup(fs.root(), OsStr::new("f")).unwrap();
        assert_eq!(a, b);
        assert_eq!(fs.entry(a).unwrap().refs, 3);
    }

    #[test]
    fn test_mkdir_rmdir_track_link_counts() {
        let fs = stack();
        let root = fs.root();
        let (d, d_node) = mkdir(&fs, root, "d");
        assert_eq!(fs.node(NodeIdx::ROOT).unwrap().attr.nlink, 3);
        assert_eq!(fs.node(d_node).unwrap().attr.nlink, 2);

        fs.rmdir(NodeIdx::ROOT, d).unwrap();
        assert_eq!(fs.node(NodeIdx::ROOT).unwrap().attr.nlink, 2);
        assert_eq!(fs.node(d_node).unwrap().attr.nlink, 0);
        assert!(!fs.entry(d).unwrap().hashed);

        let again = fs.lookup(root, OsStr::new("d")).unwrap();
        assert!(fs.entry(again).unwrap().node.is_none());
        fs.put_entry(again);
    }

    #[test]
    fn test_rmdir_non_empty_forwards_error() {
        let fs = stack();
        let (d, _) = mkdir(&fs, fs.root(), "d");
        create(&fs, d, "f");
        assert!(matches!(
            fs.rmdir(NodeIdx::ROOT, d),
            Err(Error::Lower(Errno::ENOTEMPTY))
        ));
        assert!(fs.entry(d).unwrap().hashed);
    }

    #[test]
    fn test_link_updates_source_and_keeps_size() {
        let fs = stack();
        let root_node = NodeIdx::ROOT;
        let (a, a_node) = create(&fs, fs.root(), "a");
        let file = fs.open(a, libc::O_RDWR).unwrap();
        fs.write(file, 0, b"hello").unwrap();
        fs.release(file);

        let b = fs.lookup(fs.root(), OsStr::new("b")).unwrap();
        let linked = fs.link(a, root_node, b).unwrap();
        assert_eq!(linked, Some(a_node));
        let node = fs.node(a_node).unwrap();
        assert_eq!(node.attr.nlink, 2);
        assert_eq!(node.attr.size, 5);
        assert_eq!(node.aliases.len(), 2);
    }

    #[test]
    fn test_unlink_refreshes_victim() {
        let fs = stack();
        let root_node = NodeIdx::ROOT;
        let (f, f_node) = create(&fs, fs.root(), "f");

        fs.unlink(root_node, f).unwrap();
        let victim = fs.node(f_node).unwrap();
        assert_eq!(victim.attr.nlink, 0);
        assert_eq!(victim.attr.ctime, fs.node(root_node).unwrap().attr.ctime);
        assert!(!fs.entry(f).unwrap().hashed);

        fs.put_entry(f);
        assert!(fs.node(f_node).is_err());
    }

    #[test]
    fn test_unlink_busy_on_silly_renamed_is_success() {
        let fs = stack();
        let root_node = NodeIdx::ROOT;
        let (f, _) = create(&fs, fs.root(), "f");
        let file = fs.open(f, libc::O_RDONLY).unwrap();
        fs.lower().silly_rename(fs.entry(f).unwrap().lower).unwrap();

        fs.unlink(root_node, f).unwrap();
        assert!(!fs.entry(f).unwrap().hashed);
        fs.release(file);
    }

    #[test]
    fn test_unlink_busy_without_flag_is_forwarded() {
        // a plain entry never reports busy, so only the flagged path downgrades
        let fs = stack();
        let root_node = NodeIdx::ROOT;
        let (f, _) = create(&fs, fs.root(), "f");
        let lower = fs.entry(f).unwrap().lower;
        assert!(!fs.lower().entry(lower).unwrap().silly_renamed);
        fs.unlink(root_node, f).unwrap();
        assert!(matches!(
            fs.unlink(root_node, f),
            Err(Error::RaceDetected(_))
        ));
    }

    #[test]
    fn test_concurrent_unlink_single_winner() {
        for _ in 0..20 {
            let fs = Arc::new(stack());
            let (f, _) = create(&fs, fs.root(), "f");
            fs.get_entry(f).unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let fs = Arc::clone(&fs);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        let result = fs.unlink(NodeIdx::ROOT, f);
                        fs.put_entry(f);
                        result
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(Error::RaceDetected(_)))));
            assert_eq!(fs.lower().outstanding_refs(), 1);
        }
    }

    #[test]
    fn test_disjoint_directories_proceed_concurrently() {
        let fs = Arc::new(stack());
        let dirs: Vec<_> = (0..4)
            .map(|i| mkdir(&fs, fs.root(), &format!("d{}", i)))
            .collect();
        let barrier = Arc::new(Barrier::new(dirs.len()));

        let handles: Vec<_> = dirs
            .into_iter()
            .map(|(d, d_node)| {
                let fs = Arc::clone(&fs);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..50 {
                        let name = format!("f{}", i);
                        let e = fs.lookup(d, OsStr::new(&name)).unwrap();
                        fs.create(d_node, e, 0o644).unwrap();
                        fs.unlink(d_node, e).unwrap();
                        fs.put_entry(e);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fs.node_count(), 5);
    }

    #[test]
    fn test_failed_operations_release_references() {
        let lower = MemFs::new();
        let fs = stack_on(lower);
        let (d, d_node) = mkdir(&fs, fs.root(), "d");
        create(&fs, d, "f");
        let refs = fs.lower().outstanding_refs();

        let _ = fs.rmdir(NodeIdx::ROOT, d);
        let f = fs.lookup(d, OsStr::new("f")).unwrap();
        let _ = fs.create(d_node, f, 0o644);
        let _ = fs.rmdir(d_node, f);
        fs.put_entry(f);
        let missing = fs.lookup(d, OsStr::new("missing")).unwrap();
        let _ = fs.unlink(d_node, missing);
        fs.put_entry(missing);

        assert_eq!(fs.lower().outstanding_refs(), refs);
    }
}
