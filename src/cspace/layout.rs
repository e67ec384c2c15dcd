// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Fixed layout of the core CSpace hierarchy.
// Author: Lukas Bower

//! Core CSpace layout.
//!
//! Core addresses its capabilities through three CNode levels. The top-level
//! CNode indexes the core-pad CNode (which holds the core CNode at index 0),
//! the phys CNode with one frame slot per physical page and the untyped CNode
//! with one untyped slot per physical page. Selectors resolve with
//! [`crate::sel4::WORD_BITS`] of depth and no guard:
//!
//! ```text
//! | top (12) | core-pad (6) | core (14) |
//! | top (12) | phys / untyped (20)      |
//! ```

use crate::sel4::{CapSel, PAGE_SIZE_LOG2, WORD_BITS};

/// Radix of the top-level CNode.
pub const NUM_TOP_SEL_LOG2: u8 = 12;
/// Radix of the core CNode.
pub const NUM_CORE_SEL_LOG2: u8 = 14;
/// Radix of the core-pad CNode.
pub const NUM_CORE_PAD_SEL_LOG2: u8 = WORD_BITS - NUM_TOP_SEL_LOG2 - NUM_CORE_SEL_LOG2;
/// Radix of the phys CNode.
pub const NUM_PHYS_SEL_LOG2: u8 = 20;
/// Radix of the untyped-pages CNode.
pub const NUM_UNTYPED_SEL_LOG2: u8 = 20;

/// Top-level index of the core-pad CNode.
pub const TOP_CNODE_CORE_IDX: usize = 0;
/// Top-level index of the untyped-pages CNode.
pub const TOP_CNODE_UNTYPED_IDX: usize = 1;
/// Top-level index of the phys CNode.
pub const TOP_CNODE_PHYS_IDX: usize = 0xfff;

/// Statically assigned selector of the top-level CNode.
pub const TOP_CNODE_SEL: CapSel = CapSel::new(0x200);
/// Statically assigned selector of the core-pad CNode.
pub const CORE_PAD_CNODE_SEL: CapSel = CapSel::new(0x201);
/// Statically assigned selector of the core CNode.
pub const CORE_CNODE_SEL: CapSel = CapSel::new(0x202);
/// Statically assigned selector of the phys CNode.
pub const PHYS_CNODE_SEL: CapSel = CapSel::new(0x203);
/// Statically assigned selector of the untyped-pages CNode.
pub const UNTYPED_CNODE_SEL: CapSel = CapSel::new(0x204);

/// Selectors of the statically created CNodes, in creation order.
pub const STATIC_CNODE_SELS: [CapSel; 5] = [
    TOP_CNODE_SEL,
    CORE_PAD_CNODE_SEL,
    CORE_CNODE_SEL,
    PHYS_CNODE_SEL,
    UNTYPED_CNODE_SEL,
];

/// Identifier of core's own VM space.
pub const CORE_VM_ID: u32 = 1;

/// Selector of a thread's lock notification within its own CSpace.
pub const INITIAL_SEL_LOCK: usize = 1;
/// Selector of a thread's parent capability within its own CSpace.
pub const INITIAL_SEL_PARENT: usize = 2;
/// Selector of a thread's own CNode within its own CSpace.
pub const INITIAL_SEL_CNODE: usize = 3;
/// Selector of a thread's own endpoint within its own CSpace.
pub const INITIAL_SEL_EP: usize = 4;
/// First selector a protection domain may allocate freely.
pub const INITIAL_SEL_END: usize = 5;

/// Returns the selector of the frame capability backing `phys` in the phys CNode.
#[must_use]
pub const fn frame_sel(phys: usize) -> CapSel {
    CapSel::new((TOP_CNODE_PHYS_IDX << NUM_PHYS_SEL_LOG2) | (phys >> PAGE_SIZE_LOG2))
}

/// Returns the selector of the untyped page backing `phys` in the untyped CNode.
#[must_use]
pub const fn untyped_sel(phys: usize) -> CapSel {
    CapSel::new((TOP_CNODE_UNTYPED_IDX << NUM_UNTYPED_SEL_LOG2) | (phys >> PAGE_SIZE_LOG2))
}

/// Returns the phys-CNode index of the page at `phys`.
#[must_use]
pub const fn phys_index(phys: usize) -> usize {
    (phys >> PAGE_SIZE_LOG2) & ((1 << NUM_PHYS_SEL_LOG2) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_cover_a_full_selector_word() {
        assert_eq!(
            NUM_TOP_SEL_LOG2 + NUM_CORE_PAD_SEL_LOG2 + NUM_CORE_SEL_LOG2,
            WORD_BITS
        );
        assert_eq!(NUM_TOP_SEL_LOG2 + NUM_PHYS_SEL_LOG2, WORD_BITS);
    }

    #[test]
    fn phys_selectors_encode_frame_numbers() {
        assert_eq!(frame_sel(0x8000_3000).value(), 0xfff8_0003);
        assert_eq!(untyped_sel(0x8000_3000).value(), 0x0018_0003);
        assert_eq!(phys_index(0x8000_3000), 0x8_0003);
    }
}
