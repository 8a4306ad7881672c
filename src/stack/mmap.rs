//! Mapping fault shim
//!
//! Faults on a mapped shadow file are forwarded to the lower mapping through a
//! call-local [`MappingContext`]. The shared [`VmArea`] is only ever borrowed,
//! so concurrent and reentrant faults on the same file never see it change.

use super::{FileIdx, InodeOp, ShadowFile, StackFs};
use crate::error::{Error, Result};
use crate::lower::{Capabilities, LowerFile, LowerFs};
use crate::vm::{FaultOutcome, LowerVmOps, MappedFile, VmArea, VmFault};
use std::sync::Arc;
use tracing::{debug, trace};

/// Private view of a mapping with its file redirected to the lower file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingContext {
    area: VmArea,
}

impl MappingContext {
    pub fn redirect(vma: &VmArea, lower: LowerFile) -> Self {
        let mut area = vma.clone();
        area.file = MappedFile::Lower(lower);
        Self { area }
    }

    pub fn area(&self) -> &VmArea {
        &self.area
    }
}

impl<L: LowerFs> StackFs<L> {
    fn mapped_file(&self, vma: &VmArea) -> Result<FileIdx> {
        match vma.file {
            MappedFile::Upper(fh) => Ok(fh),
            MappedFile::Lower(_) => Err(Error::InvalidArgument(
                "mapping does not belong to a stacked file".to_string(),
            )),
        }
    }

    /// Open file behind `vma` along with its cached lower mapping operations
    fn mapping(&self, vma: &VmArea) -> Result<(Arc<ShadowFile>, Arc<dyn LowerVmOps>)> {
        let file = self.files.get(self.mapped_file(vma)?)?;
        let ops = file
            .vm_ops
            .get()
            .cloned()
            .ok_or_else(|| Error::InvalidArgument("file has not been mapped".to_string()))?;
        Ok((file, ops))
    }

    /// Map an open file; the lower mapping operations are fetched on first use
    pub fn mmap(&self, fh: FileIdx, vma: &VmArea) -> Result<()> {
        debug!("mmap(fh={:?}, start={:#x}, end={:#x})", fh, vma.start, vma.end);
        if self.mapped_file(vma)? != fh {
            return Err(Error::InvalidArgument(
                "mapping belongs to another file".to_string(),
            ));
        }
        let file = self.files.get(fh)?;
        let lower = self.graph.lower_node(file.node, InodeOp::Mmap)?;
        if !self.lower.capabilities(lower).contains(Capabilities::MMAP) {
            return Err(Error::UnsupportedOperation(
                "lower filesystem cannot map files".to_string(),
            ));
        }
        if file.is_direct() {
            return self.direct_io(fh);
        }

        if file.vm_ops.get().is_none() {
            let ops = self.lower.vm_ops(file.lower)?;
            // a concurrent mmap may have won; either set of ops is equivalent
            let _ = file.vm_ops.set(ops);
        }
        self.copy_attr_atime(file.node);
        Ok(())
    }

    /// Handle a read or write fault on a mapped shadow file
    pub fn fault(&self, vma: &VmArea, vmf: &VmFault) -> Result<FaultOutcome> {
        trace!("fault(address={:#x}, pgoff={})", vmf.address, vmf.pgoff);
        let (file, ops) = self.mapping(vma)?;
        let ctx = MappingContext::redirect(vma, file.lower);
        ops.fault(ctx.area(), vmf)
    }

    /// Make a mapped page writable
    pub fn page_mkwrite(&self, vma: &VmArea, vmf: &VmFault) -> Result<FaultOutcome> {
        trace!("page_mkwrite(address={:#x}, pgoff={})", vmf.address, vmf.pgoff);
        let (file, ops) = self.mapping(vma)?;
        let ctx = MappingContext::redirect(vma, file.lower);
        match ops.page_mkwrite(ctx.area(), vmf) {
            None => Ok(FaultOutcome::Ready),
            Some(outcome) => {
                let outcome = outcome?;
                self.copy_attr_times(file.node);
                Ok(outcome)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::lower::MemFs;
    use crate::vm::{MapFlags, PAGE_SIZE};
    use std::sync::Barrier;
    use std::thread;

    fn mapped(fs: &StackFs<MemFs>, len: usize) -> (FileIdx, VmArea) {
        let (f, _) = create(fs, fs.root(), "m");
        let fh = fs.open(f, libc::O_RDWR).unwrap();
        fs.write(fh, 0, &vec![0xabu8; len]).unwrap();
        let vma = VmArea::new(
            MappedFile::Upper(fh),
            0x7000_0000,
            4 * PAGE_SIZE,
            0,
            MapFlags::READ | MapFlags::WRITE | MapFlags::SHARED,
        );
        fs.mmap(fh, &vma).unwrap();
        (fh, vma)
    }

    #[test]
    fn test_redirect_leaves_original_untouched() {
        let vma = VmArea::new(MappedFile::Upper(FileIdx(3)), 0, PAGE_SIZE, 0, MapFlags::READ);
        let ctx = MappingContext::redirect(&vma, LowerFile(9));
        assert_eq!(ctx.area().file, MappedFile::Lower(LowerFile(9)));
        assert_eq!(vma.file, MappedFile::Upper(FileIdx(3)));
        assert_eq!(ctx.area().start, vma.start);
    }

    #[test]
    fn test_fault_reads_lower_page() {
        let fs = stack();
        let (fh, vma) = mapped(&fs, 100);

        match fs.fault(&vma, &VmFault::read(&vma, vma.start)).unwrap() {
            FaultOutcome::Page(page) => {
                assert_eq!(page.len(), PAGE_SIZE as usize);
                assert_eq!(page[99], 0xab);
                assert_eq!(page[100], 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let past_eof = VmFault::read(&vma, vma.start + 2 * PAGE_SIZE);
        assert_eq!(fs.fault(&vma, &past_eof).unwrap(), FaultOutcome::SigBus);
        fs.release(fh);
    }

    #[test]
    fn test_concurrent_faults_never_touch_shared_area() {
        let fs = stack();
        let (fh, vma) = mapped(&fs, 3 * PAGE_SIZE as usize);
        let vma = Arc::new(vma);
        let snapshot = (*vma).clone();
        let barrier = Barrier::new(8);

        thread::scope(|s| {
            for t in 0..8u64 {
                let fs = &fs;
                let vma = Arc::clone(&vma);
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for i in 0..200u64 {
                        let address = vma.start + ((t + i) % 3) * PAGE_SIZE;
                        let outcome = if i % 4 == 0 {
                            fs.page_mkwrite(&vma, &VmFault::write(&vma, address))
                        } else {
                            fs.fault(&vma, &VmFault::read(&vma, address))
                        };
                        assert!(!matches!(outcome.unwrap(), FaultOutcome::SigBus));
                        assert_eq!(vma.file, MappedFile::Upper(fh));
                    }
                });
            }
        });

        assert_eq!(*vma, snapshot);
        assert_eq!(fs.lower().fault_count(), 8 * 200);
        fs.release(fh);
    }

    struct ReadOnlyOps;

    impl LowerVmOps for ReadOnlyOps {
        fn fault(&self, _vma: &VmArea, _vmf: &VmFault) -> Result<FaultOutcome> {
            Ok(FaultOutcome::SigBus)
        }
    }

    #[test]
    fn test_missing_mkwrite_handler_succeeds() {
        let fs = stack();
        let (f, _) = create(&fs, fs.root(), "m");
        let fh = fs.open(f, libc::O_RDWR).unwrap();
        let vma = VmArea::new(MappedFile::Upper(fh), 0, PAGE_SIZE, 0, MapFlags::WRITE);
        let _ = fs.file(fh).unwrap().vm_ops.set(Arc::new(ReadOnlyOps));
        fs.mmap(fh, &vma).unwrap();

        let outcome = fs.page_mkwrite(&vma, &VmFault::write(&vma, 0)).unwrap();
        assert_eq!(outcome, FaultOutcome::Ready);
        fs.release(fh);
    }

    #[test]
    fn test_mmap_requirements() {
        let fs = stack_on(MemFs::with_capabilities(Capabilities::XATTR));
        let (f, _) = create(&fs, fs.root(), "m");
        let fh = fs.open(f, libc::O_RDONLY).unwrap();
        let vma = VmArea::new(MappedFile::Upper(fh), 0, PAGE_SIZE, 0, MapFlags::READ);
        assert!(matches!(
            fs.mmap(fh, &vma),
            Err(Error::UnsupportedOperation(_))
        ));
        // faults before a successful mmap have nothing to forward to
        assert!(matches!(
            fs.fault(&vma, &VmFault::read(&vma, 0)),
            Err(Error::InvalidArgument(_))
        ));

        let foreign = VmArea::new(MappedFile::Upper(FileIdx(999)), 0, PAGE_SIZE, 0, MapFlags::READ);
        assert!(matches!(
            fs.mmap(fh, &foreign),
            Err(Error::InvalidArgument(_))
        ));
        fs.release(fh);
    }
}
