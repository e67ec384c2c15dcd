// CLASSIFICATION: COMMUNITY
// Filename: core_mem.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Memory allocated for core's own use and mapped into its address space.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::bootstrap::PlatformError;
use crate::env::CoreEnv;
use crate::range_alloc::AllocError;
use crate::sel4::{round_page, PAGE_SIZE, PAGE_SIZE_LOG2};
use crate::untyped::UntypedMemory;

#[derive(Clone, Copy, Debug)]
struct Allocation {
    phys: usize,
    size: usize,
}

/// Allocator handing out page-granular, mapped core memory.
pub struct CoreMemAlloc {
    env: CoreEnv,
    allocations: Mutex<BTreeMap<usize, Allocation>>,
}

impl CoreMemAlloc {
    pub(crate) fn new(env: CoreEnv) -> Self {
        Self {
            env,
            allocations: Mutex::new(BTreeMap::new()),
        }
    }

    /// Allocates `size` bytes, rounded up to whole pages, and returns their
    /// virtual address within core.
    pub fn alloc(&self, size: usize) -> Result<usize, PlatformError> {
        let size = round_page(size.max(1));
        let pages = size >> PAGE_SIZE_LOG2;
        let phys = UntypedMemory::alloc_pages(&mut *self.env.phys_alloc()?, pages)?;
        let virt = match self.env.virt_alloc()?.alloc_aligned(size, PAGE_SIZE_LOG2) {
            Ok(virt) => virt,
            Err(err) => {
                self.env.free_page(phys);
                return Err(err.into());
            }
        };

        let mapped = UntypedMemory::convert_to_page_frames(self.env.kernel(), phys, pages)
            .map_err(PlatformError::from)
            .and_then(|()| {
                self.env
                    .map_local(phys, virt, pages)
                    .map_err(PlatformError::from)
            });
        if let Err(err) = mapped {
            log::error!("[core-mem] mapping {size} bytes at 0x{virt:x}: {err}");
            if let Err(err) = UntypedMemory::convert_to_untyped_frames(self.env.kernel(), phys, size) {
                log::warn!("[core-mem] returning 0x{phys:x} to untyped: {err}");
            }
            self.env.free_page(phys);
            match self.env.virt_alloc() {
                Ok(mut virt_alloc) => {
                    if let Err(err) = virt_alloc.free(virt) {
                        log::warn!("[core-mem] freeing 0x{virt:x}: {err}");
                    }
                }
                Err(err) => log::warn!("[core-mem] {err}"),
            }
            return Err(err);
        }

        self.allocations
            .lock()
            .map_err(|_| AllocError::LockPoisoned)?
            .insert(virt, Allocation { phys, size });
        log::debug!("[core-mem] 0x{virt:x} <- 0x{phys:x} ({size} bytes)");
        Ok(virt)
    }

    /// Releases the allocation starting at `virt`.
    pub fn free(&self, virt: usize) -> Result<(), PlatformError> {
        let allocation = self
            .allocations
            .lock()
            .map_err(|_| AllocError::LockPoisoned)?
            .remove(&virt)
            .ok_or(AllocError::NotAllocated(virt))?;
        self.env
            .unmap_local(virt, allocation.size / PAGE_SIZE)?;
        UntypedMemory::convert_to_untyped_frames(self.env.kernel(), allocation.phys, allocation.size)?;
        self.env.phys_alloc()?.free(allocation.phys)?;
        self.env.virt_alloc()?.free(virt)?;
        Ok(())
    }

    /// Physical address backing the allocation at `virt`.
    #[must_use]
    pub fn phys_addr(&self, virt: usize) -> Option<usize> {
        self.allocations
            .lock()
            .ok()?
            .get(&virt)
            .map(|allocation| allocation.phys)
    }

    /// Number of live allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.lock().map(|map| map.len()).unwrap_or(0)
    }

    /// Returns `true` without live allocations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
