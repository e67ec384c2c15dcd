// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Initial untyped pool and per-page untyped memory conversion.
// Author: Lukas Bower

//! Untyped memory.
//!
//! The kernel hands the root task a fixed set of untyped ranges. During
//! bootstrap, [`InitialUntypedPool`] carves the core CNodes out of them and
//! finally splits every remaining RAM range into 4 KiB untyped pages that are
//! stored in the untyped CNode at their page-frame number. From then on
//! [`UntypedMemory`] converts those pages into frames (and back) one page at a
//! time.

use thiserror::Error;

use crate::cspace::layout::{
    frame_sel, phys_index, untyped_sel, PHYS_CNODE_SEL, TOP_CNODE_SEL, UNTYPED_CNODE_SEL,
};
use crate::cspace::{Cnode, CnodeIndex};
use crate::range_alloc::{AllocError, RangeAllocator};
use crate::sel4::{
    align_addr, BootInfo, CapSel, Kernel, KernelError, ObjectType, PAGE_SIZE, PAGE_SIZE_LOG2,
    WORD_BITS,
};

/// Errors raised while consuming untyped memory.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UntypedError {
    /// A kernel invocation failed.
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    /// The physical allocator could not satisfy the request.
    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),
    /// No initial untyped range holds an object of the requested size.
    #[error("initial untyped pool cannot hold 2^{size_bits} bytes")]
    PoolExhausted {
        /// Size of the requested object as a power of two.
        size_bits: u8,
    },
    /// The page at `phys` is not untyped any more.
    #[error("page 0x{phys:x} already converted")]
    AlreadyConverted {
        /// Physical address of the page.
        phys: usize,
    },
}

/// One untyped range handed over by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UntypedRange {
    /// Selector of the untyped capability.
    pub sel: CapSel,
    /// Physical base address.
    pub phys: usize,
    /// Size of the range in bytes.
    pub size: usize,
    /// `true` for device memory.
    pub device: bool,
    /// Bytes consumed from the start of the range.
    pub free_offset: usize,
}

impl UntypedRange {
    /// Returns `true` once the range cannot hand out any further byte.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.free_offset >= self.size
    }
}

/// Kernel-provided untyped ranges, consumed front to back.
#[derive(Debug, Clone)]
pub struct InitialUntypedPool {
    ranges: Vec<UntypedRange>,
}

impl InitialUntypedPool {
    /// Collects the untyped ranges listed in `bi`.
    #[must_use]
    pub fn from_boot_info(bi: &BootInfo) -> Self {
        let ranges = bi
            .untyped
            .iter()
            .zip(bi.untyped_list.iter())
            .map(|(sel, desc)| UntypedRange {
                sel: CapSel::new(sel),
                phys: desc.paddr,
                size: 1usize << desc.size_bits,
                device: desc.is_device,
                free_offset: 0,
            })
            .collect();
        Self { ranges }
    }

    /// Retypes one `object` of `size_bits` from the first RAM range that fits and
    /// places it at `dst_index` of `dst_cnode`.
    pub fn alloc(
        &mut self,
        kernel: &dyn Kernel,
        object: ObjectType,
        size_bits: u8,
        dst_cnode: CapSel,
        dst_index: usize,
    ) -> Result<UntypedRange, UntypedError> {
        let obj_bits = usize::from(object.object_size_bits(size_bits));
        let range = self
            .ranges
            .iter_mut()
            .filter(|range| !range.device)
            .find(|range| align_addr(range.free_offset, obj_bits) + (1 << obj_bits) <= range.size)
            .ok_or(UntypedError::PoolExhausted {
                size_bits: obj_bits as u8,
            })?;
        kernel.untyped_retype(range.sel, object, size_bits, dst_cnode, dst_index, 1)?;
        range.free_offset = align_addr(range.free_offset, obj_bits) + (1 << obj_bits);
        log::debug!(
            "[untyped] {} (2^{obj_bits}) from {} -> slot 0x{dst_index:x}, offset now 0x{:x}",
            object.label(),
            range.sel,
            range.free_offset
        );
        Ok(*range)
    }

    /// Calls `f` for every range.
    pub fn for_each_range(&self, mut f: impl FnMut(&UntypedRange)) {
        for range in &self.ranges {
            f(range);
        }
    }

    /// Splits the page-aligned remainder of every RAM range into untyped
    /// pages stored in the untyped CNode at their frame number.
    pub fn turn_remainder_into_untyped_pages(
        &mut self,
        kernel: &dyn Kernel,
    ) -> Result<usize, UntypedError> {
        let mut total = 0;
        for range in self.ranges.iter_mut().filter(|range| !range.device) {
            let offset = align_addr(range.free_offset, PAGE_SIZE_LOG2);
            if offset >= range.size {
                range.free_offset = range.size;
                continue;
            }
            let base = range.phys + offset;
            let num_pages = (range.size - offset) >> PAGE_SIZE_LOG2;
            kernel.untyped_retype(
                range.sel,
                ObjectType::Untyped,
                PAGE_SIZE_LOG2 as u8,
                UNTYPED_CNODE_SEL,
                phys_index(base),
                num_pages,
            )?;
            range.free_offset = range.size;
            total += num_pages;
            log::debug!(
                "[untyped] {} pages of [0x{base:x}, 0x{:x}) now untyped pages",
                num_pages,
                range.phys + range.size
            );
        }
        Ok(total)
    }

    /// Returns `true` once every RAM range is used up.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.ranges
            .iter()
            .filter(|range| !range.device)
            .all(UntypedRange::is_exhausted)
    }

    /// Snapshot of the ranges.
    #[must_use]
    pub fn ranges(&self) -> &[UntypedRange] {
        &self.ranges
    }
}

/// Page-granular conversion between untyped pages and frames.
pub struct UntypedMemory;

impl UntypedMemory {
    /// Allocates one physical page from `phys_alloc`.
    pub fn alloc_page(phys_alloc: &mut RangeAllocator) -> Result<usize, UntypedError> {
        Ok(phys_alloc.alloc_aligned(PAGE_SIZE, PAGE_SIZE_LOG2)?)
    }

    /// Allocates `num_pages` physically contiguous pages from `phys_alloc`.
    pub fn alloc_pages(phys_alloc: &mut RangeAllocator, num_pages: usize) -> Result<usize, UntypedError> {
        Ok(phys_alloc.alloc_aligned(num_pages * PAGE_SIZE, PAGE_SIZE_LOG2)?)
    }

    /// Turns the untyped pages backing `[phys, phys + num_pages * PAGE_SIZE)`
    /// into frames stored in the phys CNode.
    ///
    /// Converting a page that is no longer untyped is a caller bug and
    /// reported as [`UntypedError::AlreadyConverted`]. On failure the pages
    /// converted so far are returned to the untyped state.
    pub fn convert_to_page_frames(
        kernel: &dyn Kernel,
        phys: usize,
        num_pages: usize,
    ) -> Result<(), UntypedError> {
        for page in 0..num_pages {
            let page_phys = phys + page * PAGE_SIZE;
            let retyped = kernel.untyped_retype(
                untyped_sel(page_phys),
                ObjectType::Page,
                0,
                PHYS_CNODE_SEL,
                phys_index(page_phys),
                1,
            );
            if let Err(err) = retyped {
                log::error!("[untyped] converting 0x{page_phys:x} to a frame failed: {err}");
                if page > 0 {
                    if let Err(cleanup) = Self::convert_to_untyped_frames(kernel, phys, page * PAGE_SIZE) {
                        log::warn!("[untyped] rolling back 0x{phys:x}: {cleanup}");
                    }
                }
                return Err(match err {
                    KernelError::DeleteFirst | KernelError::RevokeFirst => {
                        UntypedError::AlreadyConverted { phys: page_phys }
                    }
                    err => UntypedError::Kernel(err),
                });
            }
            log::trace!("[untyped] 0x{page_phys:x} -> frame {}", frame_sel(page_phys));
        }
        Ok(())
    }

    /// Returns the pages of `[phys, phys + size)` to the untyped state,
    /// destroying their frames.
    pub fn convert_to_untyped_frames(
        kernel: &dyn Kernel,
        phys: usize,
        size: usize,
    ) -> Result<(), UntypedError> {
        let top = Cnode::new(TOP_CNODE_SEL, WORD_BITS);
        for offset in (0..size).step_by(PAGE_SIZE) {
            let page_phys = phys + offset;
            top.revoke(kernel, CnodeIndex::from(untyped_sel(page_phys)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sel4::host::{HostBootConfig, HostKernel};
    use crate::sel4::{UntypedDesc, INIT_THREAD_CNODE};

    fn pool() -> (HostKernel, BootInfo, InitialUntypedPool) {
        let (kernel, bi) = HostKernel::boot(&HostBootConfig {
            init_cnode_size_bits: 12,
            untyped: vec![
                UntypedDesc {
                    paddr: 0x4800_0000,
                    size_bits: 16,
                    is_device: true,
                },
                UntypedDesc {
                    paddr: 0x8000_0000,
                    size_bits: 20,
                    is_device: false,
                },
            ],
            prog_img_beg: 0x0040_0000,
            image: vec![0; PAGE_SIZE],
            image_phys: 0x0010_0000,
            extra_len: 0,
        });
        let pool = InitialUntypedPool::from_boot_info(&bi);
        (kernel, bi, pool)
    }

    #[test]
    fn alloc_skips_device_ranges_and_advances_offset() {
        let (kernel, bi, mut pool) = pool();
        let range = pool
            .alloc(&kernel, ObjectType::CNode, 4, CapSel::new(INIT_THREAD_CNODE), bi.empty.start)
            .expect("cnode");
        assert!(!range.device);
        assert_eq!(range.free_offset, 1 << 8);
        let range = pool
            .alloc(&kernel, ObjectType::CNode, 8, CapSel::new(INIT_THREAD_CNODE), bi.empty.start + 1)
            .expect("aligned cnode");
        assert_eq!(range.free_offset, 2 << 12);
    }

    #[test]
    fn alloc_fails_when_no_range_fits() {
        let (kernel, bi, mut pool) = pool();
        let err = pool
            .alloc(&kernel, ObjectType::CNode, 20, CapSel::new(INIT_THREAD_CNODE), bi.empty.start)
            .expect_err("too large");
        assert_eq!(err, UntypedError::PoolExhausted { size_bits: 24 });
        assert_eq!(pool.ranges()[1].free_offset, 0);
    }
}
