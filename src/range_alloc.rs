// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: First-fit range allocator for physical, virtual, IRQ and I/O-port spaces.
// Author: Lukas Bower

//! Range allocator.
//!
//! Free space is kept as a map of disjoint, coalesced `[base, base + size)`
//! ranges. Allocations are first-fit on aligned bases and remember their
//! size so that [`RangeAllocator::free`] only needs the base address.

use core::fmt;
use std::collections::BTreeMap;

use thiserror::Error;

use crate::sel4::align_addr;

/// Errors raised by the core allocators.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// A zero-sized request.
    #[error("allocation of zero bytes")]
    ZeroSize,
    /// No free range satisfies the request.
    #[error("out of space: no free range holds 0x{size:x} bytes aligned to 2^{align_log2}")]
    Exhausted {
        /// Requested size.
        size: usize,
        /// Requested alignment.
        align_log2: usize,
    },
    /// The requested address range is not entirely free.
    #[error("range [0x{base:x}, 0x{end:x}) is not free")]
    RangeConflict {
        /// Base of the request.
        base: usize,
        /// End of the request.
        end: usize,
    },
    /// `free` was called with an address that was never allocated.
    #[error("address 0x{0:x} was not allocated")]
    NotAllocated(usize),
    /// The core CNode has no free selector left.
    #[error("core selector space exhausted")]
    OutOfSelectors,
    /// An allocator lock was poisoned.
    #[error("allocator lock poisoned")]
    LockPoisoned,
}

/// First-fit allocator over address ranges.
#[derive(Debug, Default, Clone)]
pub struct RangeAllocator {
    free: BTreeMap<usize, usize>,
    allocated: BTreeMap<usize, usize>,
}

impl RangeAllocator {
    /// Creates an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `[base, base + size)` available, coalescing with neighbours.
    pub fn add_range(&mut self, base: usize, size: usize) {
        if size == 0 {
            return;
        }
        self.remove_range(base, size);
        let mut start = base;
        let mut end = base.saturating_add(size);
        if let Some((&prev, &prev_size)) = self.free.range(..start).next_back() {
            if prev + prev_size == start {
                self.free.remove(&prev);
                start = prev;
            }
        }
        if let Some(&next_size) = self.free.get(&end) {
            self.free.remove(&end);
            end += next_size;
        }
        self.free.insert(start, end - start);
    }

    /// Withdraws every free byte within `[base, base + size)`.
    pub fn remove_range(&mut self, base: usize, size: usize) {
        let end = base.saturating_add(size);
        let overlapping: Vec<(usize, usize)> = self
            .free
            .iter()
            .filter(|&(&start, &len)| start < end && start + len > base)
            .map(|(&start, &len)| (start, len))
            .collect();
        for (start, len) in overlapping {
            self.free.remove(&start);
            if start < base {
                self.free.insert(start, base - start);
            }
            let range_end = start + len;
            if range_end > end {
                self.free.insert(end, range_end - end);
            }
        }
    }

    fn carve(&mut self, range_base: usize, addr: usize, size: usize) {
        let Some(len) = self.free.remove(&range_base) else {
            return;
        };
        let range_end = range_base + len;
        if addr > range_base {
            self.free.insert(range_base, addr - range_base);
        }
        if addr + size < range_end {
            self.free.insert(addr + size, range_end - (addr + size));
        }
        self.allocated.insert(addr, size);
    }

    /// Allocates `size` bytes at a base aligned to `1 << align_log2`.
    pub fn alloc_aligned(&mut self, size: usize, align_log2: usize) -> Result<usize, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let found = self.free.iter().find_map(|(&start, &len)| {
            let aligned = align_addr(start, align_log2);
            let end = aligned.checked_add(size)?;
            (end <= start + len).then_some((start, aligned))
        });
        let (range_base, addr) = found.ok_or(AllocError::Exhausted { size, align_log2 })?;
        self.carve(range_base, addr, size);
        Ok(addr)
    }

    /// Allocates `size` bytes anywhere.
    pub fn alloc(&mut self, size: usize) -> Result<usize, AllocError> {
        self.alloc_aligned(size, 0)
    }

    /// Allocates exactly `[addr, addr + size)`.
    pub fn alloc_addr(&mut self, addr: usize, size: usize) -> Result<usize, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let end = addr.saturating_add(size);
        let range_base = self
            .free
            .range(..=addr)
            .next_back()
            .filter(|&(&start, &len)| start + len >= end)
            .map(|(&start, _)| start)
            .ok_or(AllocError::RangeConflict { base: addr, end })?;
        self.carve(range_base, addr, size);
        Ok(addr)
    }

    /// Releases the allocation starting at `addr`.
    pub fn free(&mut self, addr: usize) -> Result<(), AllocError> {
        let size = self
            .allocated
            .remove(&addr)
            .ok_or(AllocError::NotAllocated(addr))?;
        self.add_range(addr, size);
        Ok(())
    }

    /// Total number of free bytes.
    #[must_use]
    pub fn avail(&self) -> usize {
        self.free.values().sum()
    }

    /// Returns `true` when `addr` is free.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.free
            .range(..=addr)
            .next_back()
            .is_some_and(|(&start, &len)| addr < start + len)
    }

    /// Iterates the free ranges as `(base, size)`.
    pub fn ranges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free.iter().map(|(&base, &size)| (base, size))
    }
}

impl fmt::Display for RangeAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "avail=0x{:x}", self.avail())?;
        for (base, size) in self.ranges() {
            write!(f, " [0x{:x},0x{:x})", base, base + size)?;
        }
        Ok(())
    }
}
