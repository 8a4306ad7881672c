//! Attribute propagation
//!
//! Cached shadow attributes are copied up from the lower node after every
//! mutation and on every stat.

use super::{EntryIdx, FileIdx, InodeOp, NodeAttr, NodeIdx, NodeKind, StackFs, MAX_FILE_SIZE};
use crate::error::{Error, Result};
use crate::lower::{AttrMask, LowerAttr, LowerFs, SetAttr};
use nix::errno::Errno;
use std::ffi::OsString;
use tracing::{debug, warn};

impl<L: LowerFs> StackFs<L> {
    /// Query the lower node behind `node` and apply `f` to the cached copy
    fn refresh<F>(&self, node: NodeIdx, f: F) -> Option<LowerAttr>
    where
        F: FnOnce(&mut NodeAttr, &LowerAttr),
    {
        let lower = self.graph.lower_node(node, InodeOp::Getattr).ok()?;
        match self.lower.getattr(lower) {
            Ok(attr) => {
                self.graph.update(node, |n| f(&mut n.attr, &attr)).ok()?;
                Some(attr)
            }
            Err(e) => {
                warn!("attribute refresh of {:?} failed: {}", node, e);
                None
            }
        }
    }

    pub(crate) fn copy_attr_times(&self, node: NodeIdx) {
        self.refresh(node, |upper, lower| {
            upper.atime = lower.atime;
            upper.mtime = lower.mtime;
            upper.ctime = lower.ctime;
        });
    }

    pub(crate) fn copy_attr_atime(&self, node: NodeIdx) {
        self.refresh(node, |upper, lower| upper.atime = lower.atime);
    }

    pub(crate) fn copy_inode_size(&self, node: NodeIdx) {
        self.refresh(node, |upper, lower| {
            upper.size = lower.size;
            upper.blocks = lower.blocks;
        });
    }

    /// Everything but size
    pub(crate) fn copy_attr_all(&self, node: NodeIdx) {
        self.refresh(node, copy_all);
    }

    pub(crate) fn copy_nlink(&self, node: NodeIdx) {
        self.refresh(node, |upper, lower| upper.nlink = lower.nlink);
    }

    /// Refresh the link count of a node that just lost a name. A lower object
    /// that can no longer be queried has no links left.
    pub(crate) fn refresh_victim(&self, node: NodeIdx) {
        let lower = self
            .graph
            .lower_node(node, InodeOp::Getattr)
            .and_then(|lower| self.lower.getattr(lower));
        let nlink = lower.map(|attr| attr.nlink).unwrap_or(0);
        let _ = self.graph.update(node, |n| n.attr.nlink = nlink);
    }

    /// Stat an entry.
    ///
    /// The cached attributes are refreshed from a live lower query first; the
    /// block count is always the one from that query.
    pub fn getattr(&self, entry: EntryIdx) -> Result<NodeAttr> {
        debug!("getattr(entry={:?})", entry);
        let node = self.graph.positive(entry)?;
        let lower_node = self.graph.lower_node(node, InodeOp::Getattr)?;
        let _lower_path = self.lower_path(entry)?;

        let live = self.lower.getattr(lower_node)?;
        let mut attr = self.graph.update(node, |n| {
            copy_all(&mut n.attr, &live);
            n.attr.size = live.size;
            n.attr.clone()
        })?;
        attr.blocks = live.blocks;
        Ok(attr)
    }

    /// Change attributes of an entry, optionally through an open file
    pub fn setattr(&self, entry: EntryIdx, req: SetAttr<FileIdx>) -> Result<NodeAttr> {
        debug!("setattr(entry={:?}, valid={:?})", entry, req.valid);
        let node = self.graph.positive(entry)?;
        let shadow = self.graph.node(node)?;
        shadow.kind.check(InodeOp::Setattr)?;

        if req.valid.contains(AttrMask::SIZE) {
            if shadow.kind == NodeKind::Directory {
                return Err(Error::Lower(Errno::EISDIR));
            }
            if req.size > MAX_FILE_SIZE {
                return Err(Error::Lower(Errno::EFBIG));
            }
        }

        let lower_file = match req.file {
            Some(file) if req.valid.contains(AttrMask::FILE) => Some(self.files.get(file)?.lower),
            _ => None,
        };
        let mut lower_req = req.with_file(lower_file);
        // the lower filesystem clears set-id bits on its own
        if lower_req
            .valid
            .intersects(AttrMask::KILL_SUID | AttrMask::KILL_SGID)
        {
            lower_req.valid.remove(AttrMask::MODE);
        }

        let lower_path = self.lower_path(entry)?;
        if lower_req.valid.contains(AttrMask::SIZE) {
            // no writeback may land past the new end of file
            self.graph.update(node, |n| n.attr.size = lower_req.size)?;
        }
        let result = self.lower.setattr(lower_path.entry(), &lower_req);
        self.copy_inode_size(node);
        result?;

        self.copy_attr_all(node);
        Ok(self.graph.node(node)?.attr)
    }

    /// Permission check delegated to the lower node
    pub fn permission(&self, node: NodeIdx, mask: i32) -> Result<()> {
        debug!("permission(node={:?}, mask={:o})", node, mask);
        let lower = self.graph.lower_node(node, InodeOp::Permission)?;
        self.lower.permission(lower, mask)
    }

    /// Target of a symlink
    pub fn readlink(&self, entry: EntryIdx) -> Result<OsString> {
        debug!("readlink(entry={:?})", entry);
        let node = self.graph.positive(entry)?;
        self.graph.lower_node(node, InodeOp::GetLink)?;
        let lower_path = self.lower_path(entry)?;
        let target = self.lower.readlink(lower_path.entry())?;
        self.copy_attr_atime(node);
        Ok(target)
    }
}

fn copy_all(upper: &mut NodeAttr, lower: &LowerAttr) {
    upper.kind = lower.kind;
    upper.perm = lower.perm;
    upper.uid = lower.uid;
    upper.gid = lower.gid;
    upper.rdev = lower.rdev;
    upper.atime = lower.atime;
    upper.mtime = lower.mtime;
    upper.ctime = lower.ctime;
    upper.blksize = lower.blksize;
    upper.nlink = lower.nlink;
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use std::ffi::OsStr;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_getattr_reports_live_blocks() {
        let fs = stack();
        let (f, f_node) = create(&fs, fs.root(), "f");
        let lower_node = fs.node(f_node).unwrap().lower;

        // grow the file behind the layer's back
        let lower_entry = fs.entry(f).unwrap().lower;
        let lower_file = fs.lower().open(lower_entry, libc::O_RDWR).unwrap();
        fs.lower().write(lower_file, 0, &[7u8; 5000]).unwrap();
        fs.lower().release(lower_file);

        let attr = fs.getattr(f).unwrap();
        let live = fs.lower().getattr(lower_node).unwrap();
        assert_eq!(attr.blocks, live.blocks);
        assert_eq!(attr.size, 5000);
    }

    #[test]
    fn test_truncate_resyncs_size() {
        let fs = stack();
        let (f, _) = create(&fs, fs.root(), "f");
        let file = fs.open(f, libc::O_RDWR).unwrap();
        fs.write(file, 0, &[1u8; 100]).unwrap();

        let mut req = SetAttr::size(10);
        req.valid |= AttrMask::FILE;
        req.file = Some(file);
        let attr = fs.setattr(f, req).unwrap();
        assert_eq!(attr.size, 10);
        assert_eq!(fs.read(file, 0, 100).unwrap().len(), 10);
        fs.release(file);
    }

    #[test]
    fn test_size_checks_precede_lower_call() {
        let fs = stack();
        let (d, _) = mkdir(&fs, fs.root(), "d");
        assert!(matches!(
            fs.setattr(d, SetAttr::size(0)),
            Err(Error::Lower(Errno::EISDIR))
        ));
        let (f, _) = create(&fs, fs.root(), "f");
        assert!(matches!(
            fs.setattr(f, SetAttr::size(MAX_FILE_SIZE + 1)),
            Err(Error::Lower(Errno::EFBIG))
        ));
    }

    #[test]
    fn test_lower_size_limit_resyncs_upper_size() {
        use crate::lower::MAX_MEM_FILE_SIZE;

        let fs = stack();
        let (f, f_node) = create(&fs, fs.root(), "f");
        let file = fs.open(f, libc::O_RDWR).unwrap();
        fs.write(file, 0, b"keep").unwrap();

        assert!(matches!(
            fs.setattr(f, SetAttr::size(1 << 62)),
            Err(Error::Lower(Errno::EFBIG))
        ));
        assert_eq!(fs.node(f_node).unwrap().attr.size, 4);

        assert!(matches!(
            fs.write(file, MAX_MEM_FILE_SIZE, b"x"),
            Err(Error::Lower(Errno::EFBIG))
        ));
        assert!(matches!(
            fs.write(file, u64::MAX, b"x"),
            Err(Error::Lower(Errno::EFBIG))
        ));
        assert_eq!(fs.read(file, 0, 16).unwrap(), b"keep");
        fs.release(file);
    }

    #[test]
    fn test_kill_suid_not_forwarded_as_mode() {
        let fs = stack();
        let (f, _) = create(&fs, fs.root(), "f");
        fs.setattr(f, SetAttr::mode(0o4755)).unwrap();

        let mut req = SetAttr::mode(0o777);
        req.valid |= AttrMask::KILL_SUID;
        let attr = fs.setattr(f, req).unwrap();
        // set-uid cleared by the lower side, explicit mode ignored
        assert_eq!(attr.perm, 0o755);
    }

    #[test]
    fn test_setattr_times() {
        let fs = stack();
        let (f, _) = create(&fs, fs.root(), "f");
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let req = SetAttr {
            valid: AttrMask::ATIME | AttrMask::MTIME,
            atime: when,
            mtime: when,
            ..Default::default()
        };
        let attr = fs.setattr(f, req).unwrap();
        assert_eq!(attr.mtime, when);
        assert_eq!(attr.atime, when);
    }

    #[test]
    fn test_readlink_and_permission() {
        let fs = stack();
        let l = fs.lookup(fs.root(), OsStr::new("l")).unwrap();
        let node = fs.symlink(NodeIdx::ROOT, l, OsStr::new("target/path")).unwrap();
        assert_eq!(fs.readlink(l).unwrap(), OsString::from("target/path"));

        let (f, f_node) = create(&fs, fs.root(), "f");
        assert!(matches!(fs.readlink(f), Err(Error::UnsupportedOperation(_))));
        fs.permission(f_node, libc::R_OK | libc::W_OK).unwrap();
        fs.setattr(f, SetAttr::mode(0o444)).unwrap();
        assert!(matches!(
            fs.permission(f_node, libc::W_OK),
            Err(Error::Lower(Errno::EACCES))
        ));
        assert_eq!(fs.node(node).unwrap().kind, NodeKind::Symlink);
    }
}
