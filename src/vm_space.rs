// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Page mappings of one address space on top of the page-table registry.
// Author: Lukas Bower

//! Address-space mappings.
//!
//! A frame capability can back only one mapping, so every mapping works on a
//! fresh copy of the frame's selector in the phys CNode. Page tables are
//! created on demand from untyped pages.

use heapless::String;
use thiserror::Error;

use crate::cspace::layout::phys_index;
use crate::cspace::CnodeIndex;
use crate::env::CoreEnv;
use crate::kobj::{self, KernelObject};
use crate::page_table_registry::{PageTableRegistry, RegistryError};
use crate::range_alloc::AllocError;
use crate::sel4::{
    CapRights, CapSel, KernelError, ObjectType, PAGE_SIZE, PAGE_TABLE_SPAN_LOG2,
};
use crate::untyped::UntypedError;

/// Maximum length of an address-space label.
pub const LABEL_LEN: usize = 32;

/// Errors raised while changing an address space.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A kernel invocation failed.
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    /// The page-table registry rejected the change.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    /// Creating a page table failed.
    #[error("page-table creation failed: {0}")]
    Untyped(#[from] UntypedError),
    /// Selector allocation failed.
    #[error("selector allocation failed: {0}")]
    Alloc(#[from] AllocError),
    /// The address space lock was poisoned.
    #[error("vm space lock poisoned")]
    LockPoisoned,
}

/// Truncates `text` to the capacity of `String<N>`.
pub(crate) fn bounded<const N: usize>(text: &str) -> String<N> {
    let mut out = String::new();
    for ch in text.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// Mappings of one page directory.
#[derive(Debug)]
pub struct VmSpace {
    page_directory: CapSel,
    id: u32,
    label: String<LABEL_LEN>,
    registry: PageTableRegistry,
    created_tables: Vec<KernelObject>,
}

impl VmSpace {
    /// Creates a VM space over `page_directory` whose existing tables are in `registry`.
    #[must_use]
    pub fn new(page_directory: CapSel, id: u32, label: &str, registry: PageTableRegistry) -> Self {
        Self {
            page_directory,
            id,
            label: bounded(label),
            registry,
            created_tables: Vec::new(),
        }
    }

    /// Selector of the page directory.
    #[must_use]
    pub fn page_directory(&self) -> CapSel {
        self.page_directory
    }

    /// Identifier of the VM space.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Label used in log messages.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Page-table registry of this address space.
    #[must_use]
    pub fn registry(&self) -> &PageTableRegistry {
        &self.registry
    }

    fn ensure_page_table(&mut self, env: &CoreEnv, virt: usize) -> Result<(), VmError> {
        if self.registry.has_page_table(virt) {
            return Ok(());
        }
        let table = kobj::create(env, ObjectType::PageTable, 0)?;
        let table_base = (virt >> PAGE_TABLE_SPAN_LOG2) << PAGE_TABLE_SPAN_LOG2;
        env.kernel()
            .page_table_map(table.sel, self.page_directory, table_base)?;
        self.registry.insert_page_table(virt, table.sel)?;
        self.created_tables.push(table);
        log::debug!(
            "[vm:{}] page table {} for 0x{table_base:x}",
            self.label,
            table.sel
        );
        Ok(())
    }

    fn map_page(
        &mut self,
        env: &CoreEnv,
        phys: usize,
        virt: usize,
        writeable: bool,
    ) -> Result<(), VmError> {
        if self.registry.lookup_entry(virt).is_some() {
            log::debug!("[vm:{}] 0x{virt:x} already mapped", self.label);
            return Ok(());
        }
        self.ensure_page_table(env, virt)?;

        let sel = env.alloc_sel()?;
        let core = env.core_cnode();
        if let Err(err) = core.copy_to(
            env.kernel(),
            &env.phys_cnode(),
            CnodeIndex::new(phys_index(phys)),
            CnodeIndex::from(sel),
        ) {
            env.free_sel(sel);
            return Err(err.into());
        }
        let rights = if writeable {
            CapRights::read_write()
        } else {
            CapRights::read_only()
        };
        if let Err(err) = env
            .kernel()
            .page_map(sel, self.page_directory, virt, rights)
        {
            if let Err(cleanup) = core.remove(env.kernel(), CnodeIndex::from(sel)) {
                log::warn!("[vm:{}] deleting frame copy {sel}: {cleanup}", self.label);
            }
            env.free_sel(sel);
            return Err(err.into());
        }
        self.registry.insert_page_table_entry(virt, sel)?;
        Ok(())
    }

    /// Maps `num_pages` frames starting at `phys` to `virt`.
    pub fn map(
        &mut self,
        env: &CoreEnv,
        phys: usize,
        virt: usize,
        num_pages: usize,
        writeable: bool,
    ) -> Result<(), VmError> {
        for page in 0..num_pages {
            let offset = page * PAGE_SIZE;
            self.map_page(env, phys + offset, virt + offset, writeable)?;
        }
        log::trace!(
            "[vm:{}] mapped 0x{phys:x} -> 0x{virt:x} ({num_pages} pages)",
            self.label
        );
        Ok(())
    }

    /// Removes `num_pages` mappings starting at `virt`; pages that are not
    /// mapped are skipped.
    pub fn unmap(&mut self, env: &CoreEnv, virt: usize, num_pages: usize) -> Result<(), VmError> {
        for page in 0..num_pages {
            let addr = virt + page * PAGE_SIZE;
            let Ok(sel) = self.registry.remove_entry(addr) else {
                continue;
            };
            if let Err(err) = env.kernel().page_unmap(sel) {
                log::error!("[vm:{}] unmapping 0x{addr:x}: {err}", self.label);
            }
            env.core_cnode()
                .remove(env.kernel(), CnodeIndex::from(sel))?;
            env.free_sel(sel);
        }
        Ok(())
    }

    /// Removes every mapping of this address space.
    pub fn flush(&mut self, env: &CoreEnv) {
        let label = self.label.clone();
        self.registry.flush_entries(|virt, sel| {
            if let Err(err) = env.kernel().page_unmap(sel) {
                log::error!("[vm:{label}] unmapping 0x{virt:x}: {err}");
            }
            if let Err(err) = env.core_cnode().remove(env.kernel(), CnodeIndex::from(sel)) {
                log::warn!("[vm:{label}] deleting frame copy {sel}: {err}");
            }
            env.free_sel(sel);
        });
    }

    /// Removes every mapping and destroys the page tables this VM space created.
    pub fn release(&mut self, env: &CoreEnv) {
        self.flush(env);
        for table in self.created_tables.drain(..) {
            if let Err(err) = kobj::destroy(env, table) {
                log::error!("[vm:{}] destroying page table {}: {err}", self.label, table.sel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_truncated_to_capacity() {
        let label: String<4> = bounded("pd-label");
        assert_eq!(label.as_str(), "pd-l");
    }
}
