//! Rename with ancestry-aware two-directory locking

use super::{EntryIdx, InodeOp, NodeIdx, StackFs};
use crate::error::{Error, Result};
use crate::lower::LowerFs;
use bitflags::bitflags;
use tracing::debug;

bitflags! {
    /// renameat2 flags; none of them are supported by the layer
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RenameFlags: u32 {
        const NOREPLACE = 1 << 0;
        const EXCHANGE = 1 << 1;
        const WHITEOUT = 1 << 2;
    }
}

impl<L: LowerFs> StackFs<L> {
    /// Rename `old` in `old_dir` over `new` in `new_dir`.
    ///
    /// Both lower parents are locked in canonical order and both lower entries
    /// revalidated under the locks before the lower rename runs. A rename that
    /// would make a directory its own descendant fails with `InvalidArgument`;
    /// one whose target is an ancestor of the source fails with
    /// `DirectoryNotEmpty`.
    pub fn rename(
        &self,
        old_dir: NodeIdx,
        old: EntryIdx,
        new_dir: NodeIdx,
        new: EntryIdx,
        flags: RenameFlags,
    ) -> Result<()> {
        debug!(
            "rename(old_dir={:?}, old={:?}, new_dir={:?}, new={:?}, flags={:?})",
            old_dir, old, new_dir, new, flags
        );
        if !flags.is_empty() {
            return Err(Error::UnsupportedOperation(format!(
                "rename flags {:?}",
                flags
            )));
        }
        self.graph.lower_node(old_dir, InodeOp::Rename)?;
        self.graph.lower_node(new_dir, InodeOp::Rename)?;
        self.check_parent(old_dir, old)?;
        self.check_parent(new_dir, new)?;
        let moved = self.graph.positive(old)?;
        let victim = self.graph.entry(new)?.node;
        if victim == Some(moved) {
            // two names of one object: nothing moves
            return Ok(());
        }

        let lower_old = self.lower_path(old)?;
        let lower_new = self.lower_path(new)?;
        let old_parent = self.lower_parent(lower_old.entry())?;
        let new_parent = self.lower_parent(lower_new.entry())?;

        let scope = self.locks.lock_rename(
            &*self.lower,
            (old_parent.dir.entry(), old_parent.node),
            (new_parent.dir.entry(), new_parent.node),
        )?;
        self.validate_locked(lower_old.entry(), old_parent.dir.entry())?;
        self.validate_locked(lower_new.entry(), new_parent.dir.entry())?;

        if scope.trap == Some(lower_old.entry()) {
            return Err(Error::InvalidArgument(
                "cannot move a directory into its own subtree".to_string(),
            ));
        }
        if scope.trap == Some(lower_new.entry()) {
            return Err(Error::DirectoryNotEmpty);
        }

        self.lower.rename(
            old_parent.node,
            lower_old.entry(),
            new_parent.node,
            lower_new.entry(),
        )?;

        self.copy_attr_all(new_dir);
        self.copy_inode_size(new_dir);
        if new_dir != old_dir {
            self.copy_attr_all(old_dir);
            self.copy_inode_size(old_dir);
        }
        if let Some(victim) = victim {
            self.refresh_victim(victim);
        }
        if let Some(reaped) = self.graph.d_move(old, new)? {
            self.release_reaped(reaped);
        }
        Ok(())
    }
}
