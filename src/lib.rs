//! stackfs - a stacking passthrough filesystem
//!
//! A [`stack::StackFs`] mirrors a lower filesystem one-to-one, interposing a
//! shadow object over every lower object it resolves. Structural operations
//! are delegated under canonical directory locking, attributes are propagated
//! back up after every mutation, and page faults on mapped files are forwarded
//! to the lower mapping without touching shared state.

pub mod config;
pub mod error;
pub mod fs;
pub mod lower;
pub mod stack;
pub mod vm;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, StackConfig};
    pub use crate::error::{Error, Result};
    pub use crate::lower::{HostFs, LowerFs, MemFs};
    pub use crate::stack::{EntryIdx, FileIdx, NodeIdx, RenameFlags, StackFs};
}
