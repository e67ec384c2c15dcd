// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Protection domains: page directory, CSpace and VM space of a component.
// Author: Lukas Bower

//! Protection domains.
//!
//! A [`Pd`] owns a page directory with an assigned ASID, a single-level CSpace
//! CNode and the [`VmSpace`] recording the mappings installed on behalf of
//! its threads. Threads address the CSpace with a guard covering the bits
//! above the CNode's radix.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use heapless::String;
use thiserror::Error;

use crate::cspace::layout::{INITIAL_SEL_CNODE, INITIAL_SEL_END, INITIAL_SEL_EP, INITIAL_SEL_LOCK};
use crate::cspace::{Cnode, CnodeIndex, SelAlloc};
use crate::env::CoreEnv;
use crate::kobj::{self, KernelObject};
use crate::page_table_registry::PageTableRegistry;
use crate::pager::Mapping;
use crate::range_alloc::AllocError;
use crate::sel4::{CapSel, KernelError, ObjectType, INIT_THREAD_ASID_POOL};
use crate::untyped::UntypedError;
use crate::vm_space::{bounded, VmError, VmSpace, LABEL_LEN};

/// Errors raised while managing a protection domain.
#[derive(Debug, Error)]
pub enum PdError {
    /// A kernel invocation failed.
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    /// The PD's CSpace is full.
    #[error("selector allocation failed: {0}")]
    Alloc(#[from] AllocError),
    /// A kernel object could not be created.
    #[error("object creation failed: {0}")]
    Untyped(#[from] UntypedError),
    /// The VM space rejected a change.
    #[error("vm space: {0}")]
    Vm(#[from] VmError),
}

/// Selectors a thread occupies in its PD's CSpace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadSels {
    /// Badged pager endpoint the kernel delivers faults to.
    pub fault_handler: CapSel,
    /// The thread's own endpoint.
    pub ep: CapSel,
    /// The thread's lock notification.
    pub lock: CapSel,
    /// `true` for the PD's first thread, which uses the well-known selectors.
    pub initial: bool,
}

/// Protection domain.
pub struct Pd {
    env: CoreEnv,
    label: String<LABEL_LEN>,
    page_directory: KernelObject,
    cspace: KernelObject,
    cspace_size_log2: u8,
    sels: SelAlloc,
    initial_thread_bound: AtomicBool,
    vm_space: Mutex<VmSpace>,
}

impl Pd {
    /// Creates a PD: a page directory registered in core's ASID pool and a
    /// CSpace CNode, each retyped from one untyped page.
    pub fn new(env: &CoreEnv, label: &str) -> Result<Self, PdError> {
        let page_directory = kobj::create(env, ObjectType::PageDirectory, 0)?;
        if let Err(err) = env
            .kernel()
            .asid_pool_assign(CapSel::new(INIT_THREAD_ASID_POOL), page_directory.sel)
        {
            log::error!("[pd:{label}] assigning ASID failed: {err}");
            if let Err(cleanup) = kobj::destroy(env, page_directory) {
                log::warn!("[pd:{label}] destroying page directory: {cleanup}");
            }
            return Err(err.into());
        }

        let cspace_size_log2 = env.config().pd_cspace_size_log2;
        let cspace = match kobj::create(env, ObjectType::CNode, cspace_size_log2) {
            Ok(cspace) => cspace,
            Err(err) => {
                if let Err(cleanup) = kobj::destroy(env, page_directory) {
                    log::warn!("[pd:{label}] destroying page directory: {cleanup}");
                }
                return Err(err.into());
            }
        };
        let cnode = Cnode::new(cspace.sel, cspace_size_log2);
        if let Err(err) = cnode.copy_to(
            env.kernel(),
            &env.core_cnode(),
            CnodeIndex::from(cspace.sel),
            CnodeIndex::new(INITIAL_SEL_CNODE),
        ) {
            log::warn!("[pd:{label}] installing own CNode at {INITIAL_SEL_CNODE}: {err}");
        }

        let id = env.next_pd_id();
        log::debug!(
            "[pd:{label}] id={id} page directory {} cspace {} (radix {cspace_size_log2})",
            page_directory.sel,
            cspace.sel
        );
        Ok(Self {
            env: env.clone(),
            label: bounded(label),
            page_directory,
            cspace,
            cspace_size_log2,
            sels: SelAlloc::new(1 << cspace_size_log2, INITIAL_SEL_END),
            initial_thread_bound: AtomicBool::new(false),
            vm_space: Mutex::new(VmSpace::new(
                page_directory.sel,
                id,
                label,
                PageTableRegistry::new(),
            )),
        })
    }

    fn vm_space(&self) -> Result<MutexGuard<'_, VmSpace>, VmError> {
        self.vm_space.lock().map_err(|_| VmError::LockPoisoned)
    }

    /// Reserves the CSpace selectors of a new thread and maps its IPC buffer
    /// `ipc_buffer_phys` at `utcb`.
    ///
    /// The first thread bound to a PD receives the well-known endpoint and
    /// lock selectors it looks up during startup.
    pub fn bind_thread(&self, utcb: usize, ipc_buffer_phys: usize) -> Result<ThreadSels, PdError> {
        self.vm_space()?
            .map(&self.env, ipc_buffer_phys, utcb, 1, true)?;

        let initial = !self.initial_thread_bound.swap(true, Ordering::AcqRel);
        let result = (|| -> Result<ThreadSels, AllocError> {
            let fault_handler = self.sels.alloc()?;
            if initial {
                return Ok(ThreadSels {
                    fault_handler,
                    ep: CapSel::new(INITIAL_SEL_EP),
                    lock: CapSel::new(INITIAL_SEL_LOCK),
                    initial,
                });
            }
            let ep = match self.sels.alloc() {
                Ok(ep) => ep,
                Err(err) => {
                    self.sels.free(fault_handler);
                    return Err(err);
                }
            };
            match self.sels.alloc() {
                Ok(lock) => Ok(ThreadSels {
                    fault_handler,
                    ep,
                    lock,
                    initial,
                }),
                Err(err) => {
                    self.sels.free(ep);
                    self.sels.free(fault_handler);
                    Err(err)
                }
            }
        })();

        match result {
            Ok(sels) => {
                log::debug!("[pd:{}] bound thread {sels:?}", self.label);
                Ok(sels)
            }
            Err(err) => {
                if initial {
                    self.initial_thread_bound.store(false, Ordering::Release);
                }
                match self.vm_space() {
                    Ok(mut vm) => {
                        if let Err(err) = vm.unmap(&self.env, utcb, 1) {
                            log::warn!("[pd:{}] unmapping IPC buffer 0x{utcb:x}: {err}", self.label);
                        }
                    }
                    Err(err) => log::warn!("[pd:{}] {err}", self.label),
                }
                Err(err.into())
            }
        }
    }

    /// Releases what [`Pd::bind_thread`] reserved.
    pub fn unbind_thread(&self, sels: ThreadSels, utcb: usize) {
        let cnode = self.cspace_cnode();
        for sel in [sels.fault_handler, sels.ep, sels.lock] {
            if let Err(err) = cnode.remove(self.env.kernel(), CnodeIndex::from(sel)) {
                log::error!("[pd:{}] deleting {sel}: {err}", self.label);
            }
        }
        self.sels.free(sels.fault_handler);
        if sels.initial {
            self.initial_thread_bound.store(false, Ordering::Release);
        } else {
            self.sels.free(sels.ep);
            self.sels.free(sels.lock);
        }
        match self.vm_space() {
            Ok(mut vm) => {
                if let Err(err) = vm.unmap(&self.env, utcb, 1) {
                    log::error!("[pd:{}] unmapping IPC buffer 0x{utcb:x}: {err}", self.label);
                }
            }
            Err(err) => log::error!("[pd:{}] {err}", self.label),
        }
    }

    /// Installs `mapping` in the PD's address space.
    pub fn install_mapping(&self, mapping: &Mapping) -> Result<(), PdError> {
        self.vm_space()?.map(
            &self.env,
            mapping.from_phys,
            mapping.to_virt,
            mapping.num_pages,
            mapping.writeable,
        )?;
        Ok(())
    }

    /// Removes `num_pages` mappings starting at `virt`.
    pub fn flush(&self, virt: usize, num_pages: usize) -> Result<(), PdError> {
        self.vm_space()?.unmap(&self.env, virt, num_pages)?;
        Ok(())
    }

    /// Allocates a free selector of the PD's CSpace.
    pub fn alloc_sel(&self) -> Result<CapSel, PdError> {
        Ok(self.sels.alloc()?)
    }

    /// Returns a selector of the PD's CSpace.
    pub fn free_sel(&self, sel: CapSel) {
        self.sels.free(sel);
    }

    /// The PD's CSpace CNode, addressed from core.
    #[must_use]
    pub fn cspace_cnode(&self) -> Cnode {
        Cnode::new(self.cspace.sel, self.cspace_size_log2)
    }

    /// Radix of the PD's CSpace CNode.
    #[must_use]
    pub fn cspace_size_log2(&self) -> u8 {
        self.cspace_size_log2
    }

    /// Core selector of the CSpace CNode.
    #[must_use]
    pub fn cspace_sel(&self) -> CapSel {
        self.cspace.sel
    }

    /// Core selector of the page directory.
    #[must_use]
    pub fn page_directory_sel(&self) -> CapSel {
        self.page_directory.sel
    }

    /// Label given at creation.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// VM id of the PD's address space.
    #[must_use]
    pub fn vm_id(&self) -> u32 {
        self.vm_space().map(|vm| vm.id()).unwrap_or(0)
    }

    /// Number of pages mapped in the PD.
    #[must_use]
    pub fn num_mappings(&self) -> usize {
        self.vm_space()
            .map(|vm| vm.registry().num_entries())
            .unwrap_or(0)
    }
}

impl Drop for Pd {
    fn drop(&mut self) {
        match self.vm_space.get_mut() {
            Ok(vm) => vm.release(&self.env),
            Err(_) => log::error!("[pd:{}] vm space poisoned, leaking mappings", self.label),
        }
        for obj in [self.cspace, self.page_directory] {
            if let Err(err) = kobj::destroy(&self.env, obj) {
                log::error!("[pd:{}] destroying {}: {err}", self.label, obj.object.label());
            }
        }
        log::debug!("[pd:{}] destroyed", self.label);
    }
}
