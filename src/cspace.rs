// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CNode handles, move/copy discipline and core selector allocation.
// Author: Lukas Bower

//! CNode handles and core selector allocation.

pub mod layout;

use std::sync::Mutex;

use crate::range_alloc::AllocError;
use crate::sel4::{Badge, CapRights, CapSel, Kernel, KernelResult, SlotPath};

/// Index of a slot within a particular CNode.
///
/// Copying a capability only needs the index, so `CnodeIndex` is `Copy`.
/// Moving one consumes a [`MovedIndex`] obtained through [`CnodeIndex::take`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CnodeIndex(usize);

impl CnodeIndex {
    /// Wraps a raw slot index.
    #[must_use]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// Returns the raw slot index.
    #[must_use]
    pub const fn value(self) -> usize {
        self.0
    }

    /// Claims the slot for a move, leaving nothing to copy from afterwards.
    #[must_use]
    pub const fn take(self) -> MovedIndex {
        MovedIndex(self.0)
    }
}

impl From<CapSel> for CnodeIndex {
    fn from(sel: CapSel) -> Self {
        Self(sel.value())
    }
}

/// Slot index whose capability is about to be moved.
///
/// The token is neither `Copy` nor `Clone`; a move consumes it, so the
/// source slot cannot be named again through the same token.
#[derive(Debug, PartialEq, Eq)]
pub struct MovedIndex(usize);

impl MovedIndex {
    /// Returns the raw slot index.
    #[must_use]
    pub const fn value(&self) -> usize {
        self.0
    }
}

/// Handle on a CNode reachable from the caller's CSpace.
///
/// `size_log2` is the depth used when addressing slots of this CNode. For a
/// CNode with a radix of `n` that is `n`; a handle on the caller's CSpace
/// root uses [`crate::sel4::WORD_BITS`] and resolves full selectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cnode {
    sel: CapSel,
    size_log2: u8,
}

impl Cnode {
    /// Wraps the CNode named by `sel`.
    #[must_use]
    pub const fn new(sel: CapSel, size_log2: u8) -> Self {
        Self { sel, size_log2 }
    }

    /// Selector of the CNode.
    #[must_use]
    pub const fn sel(&self) -> CapSel {
        self.sel
    }

    /// Addressing depth of the CNode.
    #[must_use]
    pub const fn size_log2(&self) -> u8 {
        self.size_log2
    }

    fn path(&self, index: usize) -> SlotPath {
        SlotPath::new(self.sel, index, self.size_log2)
    }

    /// Copies the capability at `index` of `from` into the same index of this CNode.
    pub fn copy(&self, kernel: &dyn Kernel, from: &Cnode, index: CnodeIndex) -> KernelResult<()> {
        self.copy_to(kernel, from, index, index)
    }

    /// Copies the capability at `from_index` of `from` to `to_index` of this CNode.
    pub fn copy_to(
        &self,
        kernel: &dyn Kernel,
        from: &Cnode,
        from_index: CnodeIndex,
        to_index: CnodeIndex,
    ) -> KernelResult<()> {
        log::trace!(
            "[cnode] copy {}:0x{:x} -> {}:0x{:x}",
            from.sel,
            from_index.0,
            self.sel,
            to_index.0
        );
        kernel.cnode_copy(
            self.path(to_index.0),
            from.path(from_index.0),
            CapRights::all(),
        )
    }

    /// Moves the capability at `index` of `from` into the same index of this CNode.
    pub fn move_from(&self, kernel: &dyn Kernel, from: &Cnode, index: MovedIndex) -> KernelResult<()> {
        let to = CnodeIndex(index.0);
        self.move_to(kernel, from, index, to)
    }

    /// Moves the capability at `from_index` of `from` to `to_index` of this CNode.
    pub fn move_to(
        &self,
        kernel: &dyn Kernel,
        from: &Cnode,
        from_index: MovedIndex,
        to_index: CnodeIndex,
    ) -> KernelResult<()> {
        log::trace!(
            "[cnode] move {}:0x{:x} -> {}:0x{:x}",
            from.sel,
            from_index.0,
            self.sel,
            to_index.0
        );
        kernel.cnode_move(self.path(to_index.0), from.path(from_index.0))
    }

    /// Mints the capability at `from_index` of `from` into `to_index`, badged
    /// with the destination index.
    pub fn mint(
        &self,
        kernel: &dyn Kernel,
        from: &Cnode,
        from_index: CnodeIndex,
        to_index: CnodeIndex,
    ) -> KernelResult<()> {
        self.mint_badged(kernel, from, from_index, to_index, Badge::new(to_index.0))
    }

    /// Mints the capability at `from_index` of `from` into `to_index` with `badge`.
    pub fn mint_badged(
        &self,
        kernel: &dyn Kernel,
        from: &Cnode,
        from_index: CnodeIndex,
        to_index: CnodeIndex,
        badge: Badge,
    ) -> KernelResult<()> {
        log::trace!(
            "[cnode] mint {}:0x{:x} -> {}:0x{:x} badge={badge}",
            from.sel,
            from_index.0,
            self.sel,
            to_index.0
        );
        kernel.cnode_mint(
            self.path(to_index.0),
            from.path(from_index.0),
            CapRights::all(),
            badge,
        )
    }

    /// Deletes the capability at `index`.
    pub fn remove(&self, kernel: &dyn Kernel, index: CnodeIndex) -> KernelResult<()> {
        kernel.cnode_delete(self.path(index.0))
    }

    /// Deletes every capability derived from the one at `index`.
    pub fn revoke(&self, kernel: &dyn Kernel, index: CnodeIndex) -> KernelResult<()> {
        kernel.cnode_revoke(self.path(index.0))
    }

    /// Saves the caller's reply capability into `index`.
    pub fn save_caller(&self, kernel: &dyn Kernel, index: CnodeIndex) -> KernelResult<()> {
        kernel.cnode_save_caller(self.path(index.0))
    }
}

struct SelBitmap {
    words: Vec<u64>,
    free: usize,
}

/// Bitmap allocator for the slots of one CNode.
///
/// Indices below `reserved` are never handed out. For the core CNode these
/// mirror the kernel-provided initial CNode.
pub struct SelAlloc {
    bitmap: Mutex<SelBitmap>,
    capacity: usize,
}

impl SelAlloc {
    /// Creates an allocator over `capacity` slots with the first `reserved` in use.
    #[must_use]
    pub fn new(capacity: usize, reserved: usize) -> Self {
        let mut words = vec![0u64; capacity.div_ceil(64)];
        let reserved = reserved.min(capacity);
        for index in 0..reserved {
            words[index / 64] |= 1 << (index % 64);
        }
        Self {
            bitmap: Mutex::new(SelBitmap {
                words,
                free: capacity - reserved,
            }),
            capacity,
        }
    }

    /// Allocates the lowest free selector.
    pub fn alloc(&self) -> Result<CapSel, AllocError> {
        let mut bitmap = self.bitmap.lock().map_err(|_| AllocError::LockPoisoned)?;
        let mut found = None;
        for (word_index, word) in bitmap.words.iter().enumerate() {
            if *word != u64::MAX {
                let index = word_index * 64 + word.trailing_ones() as usize;
                if index < self.capacity {
                    found = Some(index);
                }
                break;
            }
        }
        let index = found.ok_or(AllocError::OutOfSelectors)?;
        bitmap.words[index / 64] |= 1 << (index % 64);
        bitmap.free -= 1;
        Ok(CapSel::new(index))
    }

    /// Returns `sel` to the allocator.
    pub fn free(&self, sel: CapSel) {
        let index = sel.value();
        let Ok(mut bitmap) = self.bitmap.lock() else {
            log::error!("[cnode] selector allocator poisoned, leaking {sel}");
            return;
        };
        if index >= self.capacity {
            log::warn!("[cnode] freeing out-of-range selector {sel}");
            return;
        }
        let bit = 1u64 << (index % 64);
        if bitmap.words[index / 64] & bit == 0 {
            log::warn!("[cnode] freeing unallocated selector {sel}");
            return;
        }
        bitmap.words[index / 64] &= !bit;
        bitmap.free += 1;
    }

    /// Number of selectors still available.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bitmap.lock().map(|bitmap| bitmap.free).unwrap_or(0)
    }
}
