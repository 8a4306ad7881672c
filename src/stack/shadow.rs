//! Shadow object model
//!
//! Shadow entries and nodes stand in for lower entries and nodes. Both live in
//! index-addressed arenas; a node is bound to exactly one [`LowerNode`] from
//! interposition until eviction, and `by_lower` keeps that binding unique.

use crate::error::{Error, Result};
use crate::lower::{FileKind, LowerAttr, LowerEntry, LowerNode};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Index of a shadow entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryIdx(pub u64);

/// Index of a shadow node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdx(pub u64);

impl EntryIdx {
    pub const ROOT: EntryIdx = EntryIdx(1);
}

impl NodeIdx {
    /// Root node; doubles as the FUSE root inode number
    pub const ROOT: NodeIdx = NodeIdx(1);
}

/// Operations dispatched on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeOp {
    Lookup,
    Create,
    Link,
    Unlink,
    Symlink,
    Mkdir,
    Rmdir,
    Mknod,
    Rename,
    Readdir,
    GetLink,
    Open,
    Mmap,
    Permission,
    Setattr,
    Getattr,
    Xattr,
}

/// Kind of object a shadow node stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
    /// Device, fifo or socket
    Special,
}

impl NodeKind {
    pub fn from_lower(kind: FileKind) -> Self {
        match kind {
            FileKind::RegularFile => NodeKind::File,
            FileKind::Directory => NodeKind::Directory,
            FileKind::Symlink => NodeKind::Symlink,
            FileKind::BlockDevice | FileKind::CharDevice | FileKind::Fifo | FileKind::Socket => {
                NodeKind::Special
            }
        }
    }

    /// Whether this kind implements `op`
    pub fn supports(&self, op: InodeOp) -> bool {
        use InodeOp::*;
        match op {
            Permission | Setattr | Getattr | Xattr => true,
            Lookup | Create | Link | Unlink | Symlink | Mkdir | Rmdir | Mknod | Rename
            | Readdir => *self == NodeKind::Directory,
            GetLink => *self == NodeKind::Symlink,
            Open | Mmap => *self == NodeKind::File,
        }
    }

    /// Fail with `UnsupportedOperation` unless this kind implements `op`
    pub fn check(&self, op: InodeOp) -> Result<()> {
        if self.supports(op) {
            Ok(())
        } else {
            Err(Error::UnsupportedOperation(format!("{:?} on {:?}", op, self)))
        }
    }
}

/// Cached attributes of a shadow node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAttr {
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

impl NodeAttr {
    pub fn from_lower(attr: &LowerAttr) -> Self {
        Self {
            kind: attr.kind,
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.crtime,
            perm: attr.perm,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: attr.blksize,
        }
    }

    /// Convert to fuser FileAttr
    pub fn to_fuser_attr(&self, ino: u64) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: self.blocks,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.crtime,
            kind: self.kind.to_fuser_type(),
            perm: self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: self.blksize,
            flags: 0,
        }
    }
}

/// Virtual namespace entry
#[derive(Debug, Clone)]
pub struct ShadowEntry {
    pub name: OsString,
    /// `None` only for the root
    pub parent: Option<EntryIdx>,
    /// Lower counterpart; the arena holds one lower reference on it
    pub lower: LowerEntry,
    /// `None` while negative
    pub node: Option<NodeIdx>,
    /// Reachable from the parent's lookup cache
    pub hashed: bool,
    pub refs: u64,
}

/// Virtual object bound to one lower node
#[derive(Debug, Clone)]
pub struct ShadowNode {
    pub kind: NodeKind,
    pub lower: LowerNode,
    pub attr: NodeAttr,
    /// Entries currently attached to this node
    pub aliases: BTreeSet<EntryIdx>,
    /// Open shadow files on this node
    pub open_files: u32,
}

/// An entry removed from the arena whose lower reference must now be dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub lower: LowerEntry,
    /// Node evicted along with the entry
    pub evicted: Option<NodeIdx>,
}

#[derive(Default)]
struct Arena {
    entries: HashMap<EntryIdx, ShadowEntry>,
    nodes: HashMap<NodeIdx, ShadowNode>,
    /// Hashed entries by (parent, name)
    children: HashMap<(EntryIdx, OsString), EntryIdx>,
    by_lower: HashMap<LowerNode, NodeIdx>,
}

impl Arena {
    fn entry(&self, idx: EntryIdx) -> Result<&ShadowEntry> {
        self.entries
            .get(&idx)
            .ok_or_else(|| Error::StaleReference(format!("shadow entry {}", idx.0)))
    }

    fn entry_mut(&mut self, idx: EntryIdx) -> Result<&mut ShadowEntry> {
        self.entries
            .get_mut(&idx)
            .ok_or_else(|| Error::StaleReference(format!("shadow entry {}", idx.0)))
    }

    fn node(&self, idx: NodeIdx) -> Result<&ShadowNode> {
        self.nodes
            .get(&idx)
            .ok_or_else(|| Error::StaleReference(format!("shadow node {}", idx.0)))
    }

    fn node_mut(&mut self, idx: NodeIdx) -> Result<&mut ShadowNode> {
        self.nodes
            .get_mut(&idx)
            .ok_or_else(|| Error::StaleReference(format!("shadow node {}", idx.0)))
    }

    fn unhash(&mut self, idx: EntryIdx) {
        let Some(e) = self.entries.get_mut(&idx) else {
            return;
        };
        if !e.hashed {
            return;
        }
        e.hashed = false;
        if let Some(parent) = e.parent {
            let key = (parent, e.name.clone());
            if self.children.get(&key) == Some(&idx) {
                self.children.remove(&key);
            }
        }
    }

    /// Evict a node nothing refers to any more
    fn maybe_evict(&mut self, idx: NodeIdx) -> bool {
        let idle = match self.nodes.get(&idx) {
            Some(n) => n.aliases.is_empty() && n.open_files == 0 && idx != NodeIdx::ROOT,
            None => false,
        };
        if idle {
            if let Some(n) = self.nodes.remove(&idx) {
                if self.by_lower.get(&n.lower) == Some(&idx) {
                    self.by_lower.remove(&n.lower);
                }
            }
        }
        idle
    }

    /// Remove an entry if it is unreferenced and unhashed or negative
    fn maybe_reap(&mut self, idx: EntryIdx) -> Option<Reaped> {
        let e = self.entries.get(&idx)?;
        if idx == EntryIdx::ROOT || e.refs > 0 || (e.hashed && e.node.is_some()) {
            return None;
        }
        self.unhash(idx);
        let e = self.entries.remove(&idx)?;
        let evicted = e.node.and_then(|node| {
            if let Some(n) = self.nodes.get_mut(&node) {
                n.aliases.remove(&idx);
            }
            self.maybe_evict(node).then_some(node)
        });
        Some(Reaped {
            lower: e.lower,
            evicted,
        })
    }
}

/// Arena of shadow entries and nodes
pub struct ShadowGraph {
    next_entry: AtomicU64,
    next_node: AtomicU64,
    max_nodes: usize,
    arena: RwLock<Arena>,
}

impl ShadowGraph {
    /// Create a graph whose root entry stands for `root_lower` bound to `root_node`
    pub fn new(root_lower: LowerEntry, root_node: LowerNode, root_attr: &LowerAttr, max_nodes: usize) -> Self {
        let mut arena = Arena::default();
        arena.entries.insert(
            EntryIdx::ROOT,
            ShadowEntry {
                name: OsString::new(),
                parent: None,
                lower: root_lower,
                node: Some(NodeIdx::ROOT),
                hashed: true,
                refs: 1,
            },
        );
        arena.nodes.insert(
            NodeIdx::ROOT,
            ShadowNode {
                kind: NodeKind::Directory,
                lower: root_node,
                attr: NodeAttr::from_lower(root_attr),
                aliases: BTreeSet::from([EntryIdx::ROOT]),
                open_files: 0,
            },
        );
        arena.by_lower.insert(root_node, NodeIdx::ROOT);

        Self {
            next_entry: AtomicU64::new(2),
            next_node: AtomicU64::new(2),
            max_nodes,
            arena: RwLock::new(arena),
        }
    }

    /// Snapshot of an entry
    pub fn entry(&self, idx: EntryIdx) -> Result<ShadowEntry> {
        self.arena.read().entry(idx).cloned()
    }

    /// Snapshot of a node
    pub fn node(&self, idx: NodeIdx) -> Result<ShadowNode> {
        self.arena.read().node(idx).cloned()
    }

    /// Lower node of `idx`, checking that its kind implements `op`
    pub fn lower_node(&self, idx: NodeIdx, op: InodeOp) -> Result<LowerNode> {
        let arena = self.arena.read();
        let node = arena.node(idx)?;
        node.kind.check(op)?;
        Ok(node.lower)
    }

    /// Node attached to `idx`, or `StaleReference` for a negative entry
    pub fn positive(&self, idx: EntryIdx) -> Result<NodeIdx> {
        self.arena
            .read()
            .entry(idx)?
            .node
            .ok_or_else(|| Error::StaleReference(format!("negative entry {}", idx.0)))
    }

    /// An entry attached to `node`, hashed ones first
    pub fn alias(&self, node: NodeIdx) -> Option<EntryIdx> {
        let arena = self.arena.read();
        let n = arena.nodes.get(&node)?;
        n.aliases
            .iter()
            .find(|e| arena.entries.get(*e).is_some_and(|e| e.hashed))
            .or_else(|| n.aliases.iter().next())
            .copied()
    }

    /// Hashed child of `parent` called `name`, with a new reference taken on it
    pub fn cached_child(&self, parent: EntryIdx, name: &OsStr) -> Option<EntryIdx> {
        let mut arena = self.arena.write();
        let idx = *arena.children.get(&(parent, name.to_os_string()))?;
        arena.entries.get_mut(&idx)?.refs += 1;
        Some(idx)
    }

    /// Hash a new entry under `parent` owning the lower reference on `lower`.
    /// The entry starts with one reference held by the caller.
    pub fn alloc_entry(&self, parent: EntryIdx, name: &OsStr, lower: LowerEntry) -> Result<EntryIdx> {
        let mut arena = self.arena.write();
        arena.entry(parent)?;
        let key = (parent, name.to_os_string());
        if let Some(old) = arena.children.get(&key).copied() {
            arena.unhash(old);
        }
        let idx = EntryIdx(self.next_entry.fetch_add(1, Ordering::SeqCst));
        arena.entries.insert(
            idx,
            ShadowEntry {
                name: name.to_os_string(),
                parent: Some(parent),
                lower,
                node: None,
                hashed: true,
                refs: 1,
            },
        );
        arena.children.insert(key, idx);
        Ok(idx)
    }

    /// Attach `entry` to the node bound to `lower`, creating it from `attr` if
    /// there is none yet. Returns the node and whether it was created.
    pub fn bind(&self, entry: EntryIdx, lower: LowerNode, attr: &LowerAttr) -> Result<(NodeIdx, bool)> {
        let mut arena = self.arena.write();
        arena.entry(entry)?;

        let (idx, fresh) = match arena.by_lower.get(&lower).copied() {
            Some(idx) => (idx, false),
            None => {
                if arena.nodes.len() >= self.max_nodes {
                    return Err(Error::AllocationError(format!(
                        "shadow node limit of {} reached",
                        self.max_nodes
                    )));
                }
                let idx = NodeIdx(self.next_node.fetch_add(1, Ordering::SeqCst));
                arena.nodes.insert(
                    idx,
                    ShadowNode {
                        kind: NodeKind::from_lower(attr.kind),
                        lower,
                        attr: NodeAttr::from_lower(attr),
                        aliases: BTreeSet::new(),
                        open_files: 0,
                    },
                );
                arena.by_lower.insert(lower, idx);
                (idx, true)
            }
        };

        let previous = arena.entry_mut(entry)?.node.replace(idx);
        if let Some(prev) = previous.filter(|p| *p != idx) {
            if let Some(n) = arena.nodes.get_mut(&prev) {
                n.aliases.remove(&entry);
            }
            arena.maybe_evict(prev);
        }
        arena.node_mut(idx)?.aliases.insert(entry);
        Ok((idx, fresh))
    }

    /// Take another reference on an entry
    pub fn get_ref(&self, idx: EntryIdx) -> Result<()> {
        self.arena.write().entry_mut(idx)?.refs += 1;
        Ok(())
    }

    /// Drop a reference; returns what was reaped, if anything
    pub fn put_ref(&self, idx: EntryIdx) -> Option<Reaped> {
        let mut arena = self.arena.write();
        let e = arena.entries.get_mut(&idx)?;
        e.refs = e.refs.saturating_sub(1);
        arena.maybe_reap(idx)
    }

    /// Drop an entry from the lookup cache
    pub fn drop_entry(&self, idx: EntryIdx) -> Option<Reaped> {
        let mut arena = self.arena.write();
        arena.unhash(idx);
        arena.maybe_reap(idx)
    }

    /// Move `entry` to the position of `target`, which is dropped
    pub fn d_move(&self, entry: EntryIdx, target: EntryIdx) -> Result<Option<Reaped>> {
        let mut arena = self.arena.write();
        let (parent, name) = {
            let t = arena.entry(target)?;
            (t.parent, t.name.clone())
        };
        let parent = parent.ok_or_else(|| Error::InvalidArgument("cannot replace the root".to_string()))?;

        arena.unhash(target);
        arena.unhash(entry);
        let e = arena.entry_mut(entry)?;
        e.parent = Some(parent);
        e.name = name.clone();
        e.hashed = true;
        arena.children.insert((parent, name), entry);
        Ok(if target != entry {
            arena.maybe_reap(target)
        } else {
            None
        })
    }

    /// Mutate a node's cached state
    pub fn update<F, T>(&self, idx: NodeIdx, f: F) -> Result<T>
    where
        F: FnOnce(&mut ShadowNode) -> T,
    {
        let mut arena = self.arena.write();
        Ok(f(arena.node_mut(idx)?))
    }

    /// Account an open file on a node
    pub fn open_file(&self, idx: NodeIdx) -> Result<()> {
        self.update(idx, |n| n.open_files += 1)
    }

    /// Account a closed file; returns true if the node was evicted
    pub fn close_file(&self, idx: NodeIdx) -> bool {
        let mut arena = self.arena.write();
        match arena.nodes.get_mut(&idx) {
            Some(n) => {
                n.open_files = n.open_files.saturating_sub(1);
                arena.maybe_evict(idx)
            }
            None => false,
        }
    }

    /// Number of live shadow nodes
    pub fn node_count(&self) -> usize {
        self.arena.read().nodes.len()
    }

    /// Number of live shadow entries
    pub fn entry_count(&self) -> usize {
        self.arena.read().entries.len()
    }

    /// Empty the arena, returning the lower entries whose references it held
    pub fn drain(&self) -> Vec<LowerEntry> {
        let mut arena = self.arena.write();
        let lower = arena.entries.drain().map(|(_, e)| e.lower).collect();
        *arena = Arena::default();
        lower
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(kind: FileKind) -> LowerAttr {
        let now = SystemTime::now();
        LowerAttr {
            kind,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            perm: 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
        }
    }

    fn graph() -> ShadowGraph {
        ShadowGraph::new(LowerEntry(1), LowerNode(1), &attr(FileKind::Directory), 16)
    }

    #[test]
    fn test_kind_dispatch() {
        assert!(NodeKind::Directory.supports(InodeOp::Mkdir));
        assert!(!NodeKind::File.supports(InodeOp::Lookup));
        assert!(NodeKind::Symlink.supports(InodeOp::GetLink));
        assert!(NodeKind::Special.supports(InodeOp::Xattr));
        assert!(matches!(
            NodeKind::Special.check(InodeOp::Open),
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_bind_is_idempotent() {
        let g = graph();
        let a = g.alloc_entry(EntryIdx::ROOT, OsStr::new("a"), LowerEntry(2)).unwrap();
        let b = g.alloc_entry(EntryIdx::ROOT, OsStr::new("b"), LowerEntry(3)).unwrap();

        let (na, fresh) = g.bind(a, LowerNode(7), &attr(FileKind::RegularFile)).unwrap();
        assert!(fresh);
        let (nb, fresh) = g.bind(b, LowerNode(7), &attr(FileKind::RegularFile)).unwrap();
        assert!(!fresh);
        assert_eq!(na, nb);
        assert_eq!(g.node(na).unwrap().aliases.len(), 2);
    }

    #[test]
    fn test_node_limit() {
        let g = ShadowGraph::new(LowerEntry(1), LowerNode(1), &attr(FileKind::Directory), 1);
        let a = g.alloc_entry(EntryIdx::ROOT, OsStr::new("a"), LowerEntry(2)).unwrap();
        assert!(matches!(
            g.bind(a, LowerNode(2), &attr(FileKind::RegularFile)),
            Err(Error::AllocationError(_))
        ));
    }

    #[test]
    fn test_reap_and_evict() {
        let g = graph();
        let a = g.alloc_entry(EntryIdx::ROOT, OsStr::new("a"), LowerEntry(2)).unwrap();
        let (node, _) = g.bind(a, LowerNode(2), &attr(FileKind::RegularFile)).unwrap();

        // hashed positive entries stay cached
        assert_eq!(g.put_ref(a), None);
        assert_eq!(g.cached_child(EntryIdx::ROOT, OsStr::new("a")), Some(a));

        assert_eq!(g.drop_entry(a), None);
        let reaped = g.put_ref(a).unwrap();
        assert_eq!(reaped.lower, LowerEntry(2));
        assert_eq!(reaped.evicted, Some(node));
        assert!(g.node(node).is_err());
        assert_eq!(g.node_count(), 1);
    }

    #[test]
    fn test_negative_entry_reaped_on_last_put() {
        let g = graph();
        let n = g.alloc_entry(EntryIdx::ROOT, OsStr::new("n"), LowerEntry(5)).unwrap();
        let reaped = g.put_ref(n).unwrap();
        assert_eq!(reaped.evicted, None);
        assert!(g.entry(n).is_err());
        assert_eq!(g.entry_count(), 1);
    }

    #[test]
    fn test_d_move() {
        let g = graph();
        let d = g.alloc_entry(EntryIdx::ROOT, OsStr::new("d"), LowerEntry(2)).unwrap();
        g.bind(d, LowerNode(2), &attr(FileKind::Directory)).unwrap();
        let a = g.alloc_entry(EntryIdx::ROOT, OsStr::new("a"), LowerEntry(3)).unwrap();
        g.bind(a, LowerNode(3), &attr(FileKind::RegularFile)).unwrap();
        let b = g.alloc_entry(d, OsStr::new("b"), LowerEntry(4)).unwrap();

        let reaped = g.d_move(a, b).unwrap();
        assert!(reaped.is_none());
        assert!(!g.entry(b).unwrap().hashed);
        let moved = g.entry(a).unwrap();
        assert_eq!(moved.parent, Some(d));
        assert_eq!(moved.name, OsString::from("b"));
        assert_eq!(g.cached_child(d, OsStr::new("b")), Some(a));
        assert_eq!(g.cached_child(EntryIdx::ROOT, OsStr::new("a")), None);

        let reaped = g.put_ref(b).unwrap();
        assert_eq!(reaped.lower, LowerEntry(4));
    }
}
