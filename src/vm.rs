//! Memory-mapping descriptors shared between the stacking layer and lower filesystems

use crate::error::Result;
use crate::lower::LowerFile;
use crate::stack::FileIdx;
use bitflags::bitflags;
use bytes::Bytes;

/// Size of one mapped page
pub const PAGE_SIZE: u64 = 4096;

/// File a mapping is backed by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedFile {
    /// Open file of the stacking layer
    Upper(FileIdx),
    /// Open file of the lower filesystem
    Lower(LowerFile),
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const SHARED = 1 << 3;
    }
}

/// A mapped region of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmArea {
    pub file: MappedFile,
    pub start: u64,
    pub end: u64,
    /// File offset of `start`, in pages
    pub pgoff: u64,
    pub flags: MapFlags,
}

impl VmArea {
    pub fn new(file: MappedFile, start: u64, len: u64, pgoff: u64, flags: MapFlags) -> Self {
        Self {
            file,
            start,
            end: start + len,
            pgoff,
            flags,
        }
    }

    /// File page backing `address`
    pub fn file_page(&self, address: u64) -> u64 {
        self.pgoff + (address.saturating_sub(self.start)) / PAGE_SIZE
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        const WRITE = 1 << 0;
        const MKWRITE = 1 << 1;
    }
}

/// A single page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmFault {
    pub address: u64,
    /// Faulting file page
    pub pgoff: u64,
    pub flags: FaultFlags,
}

impl VmFault {
    pub fn read(vma: &VmArea, address: u64) -> Self {
        Self {
            address,
            pgoff: vma.file_page(address),
            flags: FaultFlags::empty(),
        }
    }

    pub fn write(vma: &VmArea, address: u64) -> Self {
        Self {
            address,
            pgoff: vma.file_page(address),
            flags: FaultFlags::WRITE | FaultFlags::MKWRITE,
        }
    }
}

/// Result of handling a fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Page contents to install
    Page(Bytes),
    /// The page may now be written
    Ready,
    /// Access beyond end of file
    SigBus,
}

/// Fault handlers of a lower mapping
pub trait LowerVmOps: Send + Sync {
    /// Populate the page for a read or write fault
    fn fault(&self, vma: &VmArea, vmf: &VmFault) -> Result<FaultOutcome>;

    /// Make a mapped page writable; `None` when the lower mapping has no such handler
    fn page_mkwrite(&self, _vma: &VmArea, _vmf: &VmFault) -> Option<Result<FaultOutcome>> {
        None
    }
}
