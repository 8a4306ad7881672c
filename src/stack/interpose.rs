//! Interposition of shadow nodes over freshly resolved lower objects

use super::{EntryIdx, NodeIdx, StackFs};
use crate::error::{Error, Result};
use crate::lower::{LowerEntry, LowerFs};
use tracing::trace;

impl<L: LowerFs> StackFs<L> {
    /// Attach `entry` to the shadow node standing for the positive lower
    /// target of `lower_entry`, creating the node on first sight.
    ///
    /// Repeated interposition on the same lower node yields the same shadow
    /// node. A negative target fails with `StaleReference`; an exhausted arena
    /// with `AllocationError`.
    pub(crate) fn interpose(&self, entry: EntryIdx, lower_entry: LowerEntry) -> Result<NodeIdx> {
        let lower_node = self.lower.entry(lower_entry)?.node.ok_or_else(|| {
            Error::StaleReference(format!("lower entry {:?} is negative", lower_entry))
        })?;
        let attr = self.lower.getattr(lower_node)?;
        let (node, fresh) = self.graph.bind(entry, lower_node, &attr)?;
        if fresh {
            trace!("interposed node {:?} over {:?}", node, lower_node);
        }
        Ok(node)
    }
}
