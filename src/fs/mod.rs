//! FUSE filesystem implementation
//!
//! Serves a [`crate::stack::StackFs`] to the kernel through `fuser`.

mod filesystem;

pub use filesystem::{StackedFuse, XattrReply};
