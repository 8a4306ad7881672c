//! Directory locking
//!
//! Every structural operation serializes on the lower parent directory. Rename
//! takes two directory locks, ordered so that any two operations agree on the
//! order: a same-directory rename takes one lock; otherwise the layer-wide
//! rename mutex is taken first, then an ancestor before its descendant, and
//! unrelated directories in ascending [`LowerNode`] order.

use crate::error::Result;
use crate::lower::{LowerEntry, LowerFs, LowerNode};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use tracing::trace;

/// Lock on one lower directory
#[derive(Default)]
struct DirLock {
    held: Mutex<bool>,
    released: Condvar,
}

/// Table of directory locks keyed by lower directory
#[derive(Default)]
pub struct LockTable {
    dirs: DashMap<LowerNode, Arc<DirLock>>,
    rename: Mutex<()>,
}

/// Held lock on one directory; released on drop
pub struct DirGuard<'a> {
    table: &'a LockTable,
    dir: LowerNode,
    lock: Option<Arc<DirLock>>,
}

impl DirGuard<'_> {
    pub fn dir(&self) -> LowerNode {
        self.dir
    }
}

impl Drop for DirGuard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            *lock.held.lock() = false;
            lock.released.notify_one();
            drop(lock);
            // last user takes the table slot with it
            self.table
                .dirs
                .remove_if(&self.dir, |_, l| Arc::strong_count(l) == 1);
        }
        trace!("unlocked dir {:?}", self.dir);
    }
}

/// Two directory locks held for a rename, plus the trap
pub struct LockScope<'a> {
    first: DirGuard<'a>,
    second: Option<DirGuard<'a>>,
    /// Child of the ancestor directory on the path to the other one
    pub trap: Option<LowerEntry>,
    // released after both directory locks
    _rename: Option<MutexGuard<'a, ()>>,
}

impl LockScope<'_> {
    /// Directories held, in acquisition order
    pub fn dirs(&self) -> Vec<LowerNode> {
        std::iter::once(self.first.dir())
            .chain(self.second.as_ref().map(DirGuard::dir))
            .collect()
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock on `dir` is held
    pub fn lock_dir(&self, dir: LowerNode) -> DirGuard<'_> {
        let lock = Arc::clone(self.dirs.entry(dir).or_default().value());
        {
            let mut held = lock.held.lock();
            while *held {
                lock.released.wait(&mut held);
            }
            *held = true;
        }
        trace!("locked dir {:?}", dir);
        DirGuard {
            table: self,
            dir,
            lock: Some(lock),
        }
    }

    /// Number of directories with a lock in use
    pub fn active(&self) -> usize {
        self.dirs.len()
    }

    /// Lock the parents of both rename endpoints.
    ///
    /// Each parent is given as its lower entry and node. The returned trap is set
    /// when one parent is an ancestor of the other.
    pub fn lock_rename<L: LowerFs + ?Sized>(
        &self,
        lower: &L,
        p1: (LowerEntry, LowerNode),
        p2: (LowerEntry, LowerNode),
    ) -> Result<LockScope<'_>> {
        if p1.1 == p2.1 {
            return Ok(LockScope {
                first: self.lock_dir(p1.1),
                second: None,
                trap: None,
                _rename: None,
            });
        }

        // ancestry is stable while the rename mutex is held
        let rename = self.rename.lock();
        let (first, second, trap) = if let Some(trap) = child_towards(lower, p2.0, p1.0)? {
            (p2.1, p1.1, Some(trap))
        } else if let Some(trap) = child_towards(lower, p1.0, p2.0)? {
            (p1.1, p2.1, Some(trap))
        } else if p1.1 < p2.1 {
            (p1.1, p2.1, None)
        } else {
            (p2.1, p1.1, None)
        };

        let first = self.lock_dir(first);
        let second = self.lock_dir(second);
        Ok(LockScope {
            first,
            second: Some(second),
            trap,
            _rename: Some(rename),
        })
    }
}

/// If `ancestor` is a proper ancestor of `entry`, the child of `ancestor` on
/// the path down to `entry`
fn child_towards<L: LowerFs + ?Sized>(
    lower: &L,
    ancestor: LowerEntry,
    entry: LowerEntry,
) -> Result<Option<LowerEntry>> {
    let mut cur = entry;
    loop {
        match lower.entry(cur)?.parent {
            Some(parent) if parent == ancestor => return Ok(Some(cur)),
            Some(parent) => cur = parent,
            None => return Ok(None),
        }
    }
}
