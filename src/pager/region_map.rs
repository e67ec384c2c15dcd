// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Fault handler resolving faults from attached dataspace regions.
// Author: Lukas Bower

//! Region map fault handler.

use crate::pager::{FaultHandler, FaultResolution, IpcPager, Mapping};
use crate::sel4::trunc_page;

/// Region of an address space backed by phys-CNode frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    /// Virtual base address, page aligned.
    pub virt: usize,
    /// Size in bytes.
    pub size: usize,
    /// Phys-CNode address backing `virt`.
    pub phys: usize,
    /// `true` if the region may be written.
    pub writeable: bool,
}

impl Region {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.virt && addr - self.virt < self.size
    }
}

/// Regions attached to one address space.
#[derive(Clone, Debug, Default)]
pub struct RegionMap {
    regions: Vec<Region>,
}

impl RegionMap {
    /// Creates an empty region map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `region`; overlapping regions are rejected.
    pub fn attach(&mut self, region: Region) -> bool {
        let overlaps = self.regions.iter().any(|other| {
            region.virt < other.virt + other.size && other.virt < region.virt + region.size
        });
        if overlaps || region.size == 0 {
            log::warn!(
                "[rm] rejecting region [0x{:x}, 0x{:x})",
                region.virt,
                region.virt + region.size
            );
            return false;
        }
        self.regions.push(region);
        true
    }

    /// Detaches the region starting at `virt`.
    pub fn detach(&mut self, virt: usize) -> Option<Region> {
        let index = self.regions.iter().position(|region| region.virt == virt)?;
        Some(self.regions.swap_remove(index))
    }

    /// Region covering `addr`.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains(addr))
    }
}

impl FaultHandler for RegionMap {
    fn pager(&mut self, pager: &mut IpcPager) -> FaultResolution {
        let addr = pager.fault_addr();
        let Some(region) = self.lookup(addr) else {
            log::debug!("[rm] no region at 0x{addr:x}");
            return FaultResolution::Unresolved;
        };
        if pager.write_fault() && !region.writeable {
            log::debug!("[rm] write to read-only region at 0x{addr:x}");
            return FaultResolution::Unresolved;
        }
        let page = trunc_page(addr);
        pager.set_reply_mapping(Mapping {
            from_phys: region.phys + (page - region.virt),
            to_virt: page,
            num_pages: 1,
            writeable: region.writeable,
        });
        FaultResolution::Resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sel4::PAGE_SIZE;

    #[test]
    fn overlapping_regions_are_rejected() {
        let mut rm = RegionMap::new();
        assert!(rm.attach(Region {
            virt: 0x1000_0000,
            size: 2 * PAGE_SIZE,
            phys: 0x10_0000,
            writeable: false,
        }));
        assert!(!rm.attach(Region {
            virt: 0x1000_1000,
            size: PAGE_SIZE,
            phys: 0x20_0000,
            writeable: true,
        }));
        assert_eq!(rm.lookup(0x1000_1fff).map(|region| region.phys), Some(0x10_0000));
        assert!(rm.lookup(0x1000_2000).is_none());
        assert!(rm.detach(0x1000_0000).is_some());
        assert!(rm.lookup(0x1000_0000).is_none());
    }
}
