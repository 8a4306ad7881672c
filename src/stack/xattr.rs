//! Extended attribute passthrough

use super::{EntryIdx, InodeOp, NodeIdx, StackFs};
use crate::error::{Error, Result};
use crate::lower::{Capabilities, LowerFs, XattrFlags};
use std::ffi::{OsStr, OsString};
use tracing::debug;

impl<L: LowerFs> StackFs<L> {
    /// Positive node of `entry`, provided its lower node supports xattrs
    fn xattr_node(&self, entry: EntryIdx) -> Result<NodeIdx> {
        let node = self.graph.positive(entry)?;
        let lower = self.graph.lower_node(node, InodeOp::Xattr)?;
        if !self.lower.capabilities(lower).contains(Capabilities::XATTR) {
            return Err(Error::UnsupportedOperation(
                "extended attributes are not supported by the lower filesystem".to_string(),
            ));
        }
        Ok(node)
    }

    pub fn getxattr(&self, entry: EntryIdx, name: &OsStr) -> Result<Vec<u8>> {
        debug!("getxattr(entry={:?}, name={:?})", entry, name);
        let node = self.xattr_node(entry)?;
        let lower_path = self.lower_path(entry)?;
        let value = self.lower.getxattr(lower_path.entry(), name)?;
        self.copy_attr_atime(node);
        Ok(value)
    }

    /// Set an attribute; a `None` value with `REPLACE` removes it instead
    pub fn setxattr(
        &self,
        entry: EntryIdx,
        name: &OsStr,
        value: Option<&[u8]>,
        flags: XattrFlags,
    ) -> Result<()> {
        debug!("setxattr(entry={:?}, name={:?}, flags={:?})", entry, name, flags);
        let value = match value {
            Some(value) => value,
            None if flags.contains(XattrFlags::REPLACE) => return self.removexattr(entry, name),
            None => {
                return Err(Error::InvalidArgument(
                    "extended attribute value missing".to_string(),
                ))
            }
        };

        let node = self.xattr_node(entry)?;
        let lower_path = self.lower_path(entry)?;
        self.lower
            .setxattr(lower_path.entry(), name, value, flags)?;
        self.copy_attr_all(node);
        Ok(())
    }

    pub fn listxattr(&self, entry: EntryIdx) -> Result<Vec<OsString>> {
        debug!("listxattr(entry={:?})", entry);
        let node = self.xattr_node(entry)?;
        let lower_path = self.lower_path(entry)?;
        let names = self.lower.listxattr(lower_path.entry())?;
        self.copy_attr_atime(node);
        Ok(names)
    }

    pub fn removexattr(&self, entry: EntryIdx, name: &OsStr) -> Result<()> {
        debug!("removexattr(entry={:?}, name={:?})", entry, name);
        let node = self.xattr_node(entry)?;
        let lower_path = self.lower_path(entry)?;
        self.lower.removexattr(lower_path.entry(), name)?;
        self.copy_attr_all(node);
        Ok(())
    }
}
