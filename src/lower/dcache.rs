//! Dentry arena used by the bundled lower backends
//!
//! Entries are addressed by [`LowerEntry`] index. A hashed entry is reachable
//! from its parent by name; an unhashed one stays alive only while referenced.

use super::{EntryInfo, LowerEntry, LowerNode};
use crate::error::{Error, Result};
use nix::errno::Errno;
use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

#[derive(Debug)]
pub(super) struct Dentry {
    pub name: OsString,
    pub parent: Option<LowerEntry>,
    pub node: Option<LowerNode>,
    pub hashed: bool,
    pub silly_renamed: bool,
    pub refs: u64,
}

pub(super) struct DentryCache {
    next_id: u64,
    root: LowerEntry,
    entries: HashMap<LowerEntry, Dentry>,
    /// Hashed children by parent, sorted by name
    children: HashMap<LowerEntry, BTreeMap<OsString, LowerEntry>>,
}

impl DentryCache {
    pub fn new(root_node: LowerNode) -> Self {
        let root = LowerEntry(1);
        let mut entries = HashMap::new();
        entries.insert(
            root,
            Dentry {
                name: OsString::new(),
                parent: None,
                node: Some(root_node),
                hashed: true,
                silly_renamed: false,
                // pinned for the lifetime of the cache
                refs: 1,
            },
        );
        Self {
            next_id: 2,
            root,
            entries,
            children: HashMap::new(),
        }
    }

    pub fn root(&self) -> LowerEntry {
        self.root
    }

    pub fn get(&self, entry: LowerEntry) -> Result<&Dentry> {
        self.entries.get(&entry).ok_or(Error::Lower(Errno::ESTALE))
    }

    pub fn get_mut(&mut self, entry: LowerEntry) -> Result<&mut Dentry> {
        self.entries.get_mut(&entry).ok_or(Error::Lower(Errno::ESTALE))
    }

    pub fn info(&self, entry: LowerEntry) -> Result<EntryInfo> {
        let d = self.get(entry)?;
        Ok(EntryInfo {
            name: d.name.clone(),
            parent: d.parent,
            node: d.node,
            hashed: d.hashed,
            silly_renamed: d.silly_renamed,
        })
    }

    /// Positive node of a hashed entry, `ENOENT` otherwise
    pub fn positive(&self, entry: LowerEntry) -> Result<LowerNode> {
        let d = self.get(entry)?;
        match d.node {
            Some(node) if d.hashed => Ok(node),
            _ => Err(Error::Lower(Errno::ENOENT)),
        }
    }

    pub fn child(&self, parent: LowerEntry, name: &OsStr) -> Option<LowerEntry> {
        self.children.get(&parent)?.get(name).copied()
    }

    /// Hash a new entry under `parent`, displacing any previous child of that name
    pub fn alloc(&mut self, parent: LowerEntry, name: &OsStr, node: Option<LowerNode>) -> LowerEntry {
        if let Some(old) = self.child(parent, name) {
            self.unhash(old);
        }
        let entry = LowerEntry(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            entry,
            Dentry {
                name: name.to_os_string(),
                parent: Some(parent),
                node,
                hashed: true,
                silly_renamed: false,
                refs: 0,
            },
        );
        self.children
            .entry(parent)
            .or_default()
            .insert(name.to_os_string(), entry);
        entry
    }

    pub fn dget(&mut self, entry: LowerEntry) -> Result<()> {
        self.get_mut(entry)?.refs += 1;
        Ok(())
    }

    /// Drop a reference; unhashed or negative entries are reaped at zero
    pub fn dput(&mut self, entry: LowerEntry) {
        let reap = match self.entries.get_mut(&entry) {
            Some(d) => {
                d.refs = d.refs.saturating_sub(1);
                d.refs == 0 && (!d.hashed || d.node.is_none())
            }
            None => false,
        };
        if reap {
            self.unhash(entry);
            self.entries.remove(&entry);
        }
    }

    /// Turn a hashed negative entry positive
    pub fn instantiate(&mut self, entry: LowerEntry, node: LowerNode) -> Result<()> {
        let d = self.get_mut(entry)?;
        if !d.hashed {
            return Err(Error::Lower(Errno::ENOENT));
        }
        if d.node.is_some() {
            return Err(Error::Lower(Errno::EEXIST));
        }
        d.node = Some(node);
        Ok(())
    }

    /// Detach an entry from its parent; the node binding is kept for holders
    pub fn unhash(&mut self, entry: LowerEntry) {
        let Some(d) = self.entries.get_mut(&entry) else {
            return;
        };
        if !d.hashed {
            return;
        }
        d.hashed = false;
        if let Some(map) = d.parent.and_then(|p| self.children.get_mut(&p)) {
            if map.get(&d.name) == Some(&entry) {
                map.remove(&d.name);
            }
        }
        if d.refs == 0 {
            self.entries.remove(&entry);
        }
    }

    /// Move `entry` to `new_parent/new_name`, unhashing whatever `victim` is
    pub fn d_move(
        &mut self,
        entry: LowerEntry,
        new_parent: LowerEntry,
        new_name: &OsStr,
        victim: LowerEntry,
    ) -> Result<()> {
        if victim != entry {
            self.unhash(victim);
        }
        let (old_parent, old_name) = {
            let d = self.get(entry)?;
            (d.parent, d.name.clone())
        };
        if let Some(map) = old_parent.and_then(|p| self.children.get_mut(&p)) {
            if map.get(&old_name) == Some(&entry) {
                map.remove(&old_name);
            }
        }
        let d = self.get_mut(entry)?;
        d.parent = Some(new_parent);
        d.name = new_name.to_os_string();
        d.hashed = true;
        if let Some(old) = self.child(new_parent, new_name) {
            self.unhash(old);
        }
        self.children
            .entry(new_parent)
            .or_default()
            .insert(new_name.to_os_string(), entry);
        Ok(())
    }

    /// Hashed positive children of a directory
    pub fn positive_children(&self, parent: LowerEntry) -> Vec<(OsString, LowerEntry, LowerNode)> {
        let Some(map) = self.children.get(&parent) else {
            return Vec::new();
        };
        map.iter()
            .filter_map(|(name, entry)| {
                let node = self.entries.get(entry)?.node?;
                Some((name.clone(), *entry, node))
            })
            .collect()
    }

    /// Path of an entry relative to the root
    pub fn path(&self, entry: LowerEntry) -> Result<PathBuf> {
        let mut names = Vec::new();
        let mut cur = entry;
        while cur != self.root {
            let d = self.get(cur)?;
            names.push(d.name.clone());
            cur = d.parent.ok_or(Error::Lower(Errno::ESTALE))?;
        }
        Ok(names.iter().rev().collect())
    }

    /// References held by callers, excluding the root pin
    pub fn outstanding_refs(&self) -> u64 {
        self.entries.values().map(|d| d.refs).sum::<u64>() - 1
    }
}
