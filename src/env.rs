// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Shared handles on core's kernel, allocators and registries.
// Author: Lukas Bower

//! Core environment.
//!
//! [`CoreEnv`] bundles the kernel interface together with the allocators and
//! registries that [`crate::bootstrap::Platform`] creates once. It is cheap to
//! clone and handed to every object that needs to create kernel objects or
//! touch core's address space.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::PlatformConfig;
use crate::cspace::{Cnode, SelAlloc};
use crate::range_alloc::{AllocError, RangeAllocator};
use crate::sel4::{CapSel, Kernel};
use crate::thread::ThreadRegistry;
use crate::untyped::{UntypedError, UntypedMemory};
use crate::vm_space::{VmError, VmSpace};

/// Handles on the process-wide state of core.
#[derive(Clone)]
pub struct CoreEnv {
    pub(crate) kernel: Arc<dyn Kernel>,
    pub(crate) sel_alloc: Arc<SelAlloc>,
    pub(crate) phys_alloc: Arc<Mutex<RangeAllocator>>,
    pub(crate) virt_alloc: Arc<Mutex<RangeAllocator>>,
    pub(crate) core_vm: Arc<Mutex<VmSpace>>,
    pub(crate) threads: Arc<ThreadRegistry>,
    pub(crate) pd_ids: Arc<AtomicU32>,
    pub(crate) core_cnode: Cnode,
    pub(crate) phys_cnode: Cnode,
    pub(crate) config: Arc<PlatformConfig>,
}

impl CoreEnv {
    /// Kernel interface.
    #[must_use]
    pub fn kernel(&self) -> &dyn Kernel {
        self.kernel.as_ref()
    }

    /// Core's own CNode.
    #[must_use]
    pub fn core_cnode(&self) -> Cnode {
        self.core_cnode
    }

    /// CNode holding one frame capability per physical page.
    #[must_use]
    pub fn phys_cnode(&self) -> Cnode {
        self.phys_cnode
    }

    /// Registry of live platform threads.
    #[must_use]
    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    /// Hands out the VM id of the next protection domain.
    pub fn next_pd_id(&self) -> u32 {
        self.pd_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Platform configuration.
    #[must_use]
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Allocates a selector of the core CNode.
    pub fn alloc_sel(&self) -> Result<CapSel, AllocError> {
        self.sel_alloc.alloc()
    }

    /// Returns a selector of the core CNode.
    pub fn free_sel(&self, sel: CapSel) {
        self.sel_alloc.free(sel);
    }

    /// Locks core's physical RAM allocator.
    pub fn phys_alloc(&self) -> Result<MutexGuard<'_, RangeAllocator>, AllocError> {
        self.phys_alloc.lock().map_err(|_| AllocError::LockPoisoned)
    }

    /// Locks core's virtual address allocator.
    pub fn virt_alloc(&self) -> Result<MutexGuard<'_, RangeAllocator>, AllocError> {
        self.virt_alloc.lock().map_err(|_| AllocError::LockPoisoned)
    }

    /// Allocates one page of physical RAM.
    pub fn alloc_page(&self) -> Result<usize, UntypedError> {
        UntypedMemory::alloc_page(&mut *self.phys_alloc()?)
    }

    /// Returns a page obtained from [`CoreEnv::alloc_page`].
    pub fn free_page(&self, phys: usize) {
        match self.phys_alloc() {
            Ok(mut alloc) => {
                if let Err(err) = alloc.free(phys) {
                    log::warn!("[core] freeing page 0x{phys:x}: {err}");
                }
            }
            Err(err) => log::error!("[core] freeing page 0x{phys:x}: {err}"),
        }
    }

    /// Maps `num_pages` frames starting at `phys` into core at `virt`.
    pub fn map_local(&self, phys: usize, virt: usize, num_pages: usize) -> Result<(), VmError> {
        let mut vm = self.core_vm.lock().map_err(|_| VmError::LockPoisoned)?;
        vm.map(self, phys, virt, num_pages, true)
    }

    /// Removes `num_pages` mappings of core starting at `virt`.
    pub fn unmap_local(&self, virt: usize, num_pages: usize) -> Result<(), VmError> {
        let mut vm = self.core_vm.lock().map_err(|_| VmError::LockPoisoned)?;
        vm.unmap(self, virt, num_pages)
    }
}
