// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Bookkeeping of page tables and page-table entries per address space.
// Author: Lukas Bower

//! Page-table registry.
//!
//! Tracks which second-level page tables exist in an address space and which
//! frame selector backs every mapped page, so a mapping operation can tell
//! "table present, add entry" from "allocate a table first".

use std::collections::BTreeMap;

use thiserror::Error;

use crate::sel4::{trunc_page, CapSel, PAGE_TABLE_SPAN_LOG2};

/// Errors raised by [`PageTableRegistry`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// No page table covers the address.
    #[error("no page table covers 0x{0:x}")]
    MissingPageTable(usize),
    /// A page table already covers the address.
    #[error("page table for 0x{0:x} already registered")]
    DuplicatePageTable(usize),
    /// The page is already mapped.
    #[error("page 0x{0:x} already registered")]
    DuplicateEntry(usize),
    /// The page is not mapped.
    #[error("no entry for page 0x{0:x}")]
    MissingEntry(usize),
}

#[derive(Debug)]
struct PageTable {
    sel: CapSel,
    entries: BTreeMap<usize, CapSel>,
}

/// Registry of page tables and their entries, keyed by virtual address.
#[derive(Debug, Default)]
pub struct PageTableRegistry {
    tables: BTreeMap<usize, PageTable>,
}

const fn table_index(virt: usize) -> usize {
    virt >> PAGE_TABLE_SPAN_LOG2
}

impl PageTableRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the page table `sel` covering `virt`.
    pub fn insert_page_table(&mut self, virt: usize, sel: CapSel) -> Result<(), RegistryError> {
        let index = table_index(virt);
        if self.tables.contains_key(&index) {
            return Err(RegistryError::DuplicatePageTable(virt));
        }
        self.tables.insert(
            index,
            PageTable {
                sel,
                entries: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Registers the frame `sel` mapped at `virt`.
    pub fn insert_page_table_entry(&mut self, virt: usize, sel: CapSel) -> Result<(), RegistryError> {
        let table = self
            .tables
            .get_mut(&table_index(virt))
            .ok_or(RegistryError::MissingPageTable(virt))?;
        let page = trunc_page(virt);
        if table.entries.contains_key(&page) {
            return Err(RegistryError::DuplicateEntry(page));
        }
        table.entries.insert(page, sel);
        Ok(())
    }

    /// Returns `true` when a page table covers `virt`.
    #[must_use]
    pub fn has_page_table(&self, virt: usize) -> bool {
        self.tables.contains_key(&table_index(virt))
    }

    /// Selector of the page table covering `virt`.
    #[must_use]
    pub fn page_table_sel(&self, virt: usize) -> Option<CapSel> {
        self.tables.get(&table_index(virt)).map(|table| table.sel)
    }

    /// Frame selector mapped at `virt`.
    #[must_use]
    pub fn lookup_entry(&self, virt: usize) -> Option<CapSel> {
        self.tables
            .get(&table_index(virt))
            .and_then(|table| table.entries.get(&trunc_page(virt)).copied())
    }

    /// Forgets the entry at `virt` and returns its frame selector.
    pub fn remove_entry(&mut self, virt: usize) -> Result<CapSel, RegistryError> {
        let page = trunc_page(virt);
        self.tables
            .get_mut(&table_index(virt))
            .and_then(|table| table.entries.remove(&page))
            .ok_or(RegistryError::MissingEntry(page))
    }

    /// Drops every entry, handing each `(virt, frame_sel)` to `f`.
    pub fn flush_entries(&mut self, mut f: impl FnMut(usize, CapSel)) {
        for table in self.tables.values_mut() {
            for (virt, sel) in core::mem::take(&mut table.entries) {
                f(virt, sel);
            }
        }
    }

    /// Number of registered page tables.
    #[must_use]
    pub fn num_page_tables(&self) -> usize {
        self.tables.len()
    }

    /// Number of registered entries.
    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.tables.values().map(|table| table.entries.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_require_a_covering_table() {
        let mut registry = PageTableRegistry::new();
        assert_eq!(
            registry.insert_page_table_entry(0x0040_1000, CapSel::new(20)),
            Err(RegistryError::MissingPageTable(0x0040_1000))
        );
        registry
            .insert_page_table(0x0040_0000, CapSel::new(12))
            .expect("table");
        registry
            .insert_page_table_entry(0x0040_1000, CapSel::new(20))
            .expect("entry");
        assert!(registry.has_page_table(0x007f_f000));
        assert!(!registry.has_page_table(0x0080_0000));
        assert_eq!(registry.lookup_entry(0x0040_1abc), Some(CapSel::new(20)));
    }

    #[test]
    fn remove_and_flush_drop_entries() {
        let mut registry = PageTableRegistry::new();
        registry.insert_page_table(0x0, CapSel::new(1)).expect("table");
        for page in 0..3 {
            registry
                .insert_page_table_entry(page * 0x1000, CapSel::new(100 + page))
                .expect("entry");
        }
        assert_eq!(registry.remove_entry(0x1000), Ok(CapSel::new(101)));
        assert_eq!(
            registry.remove_entry(0x1000),
            Err(RegistryError::MissingEntry(0x1000))
        );
        let mut flushed = Vec::new();
        registry.flush_entries(|virt, sel| flushed.push((virt, sel.value())));
        assert_eq!(flushed, vec![(0x0, 100), (0x2000, 102)]);
        assert_eq!(registry.num_entries(), 0);
        assert_eq!(registry.num_page_tables(), 1);
    }
}
