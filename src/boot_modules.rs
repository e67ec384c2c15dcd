// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Boot-module headers, core image layout and module frame placement.
// Author: Lukas Bower

//! Boot modules linked into core's program image.
//!
//! The build step appends the module binaries to core's image, page aligned,
//! and emits one [`BootModuleHeader`] per module. [`CoreImage`] carries the
//! symbols describing that layout.

use heapless::String;

use crate::sel4::{round_page, trunc_page, PAGE_SIZE, PAGE_SIZE_LOG2};
use crate::vm_space::bounded;

/// Maximum length of a module name.
pub const MODULE_NAME_LEN: usize = 64;

/// Header describing one boot module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootModuleHeader {
    /// Module name.
    pub name: String<MODULE_NAME_LEN>,
    /// Virtual address of the module within core's image.
    pub base: usize,
    /// Size of the module in bytes.
    pub size: usize,
}

impl BootModuleHeader {
    /// Creates a header, truncating overlong names.
    #[must_use]
    pub fn new(name: &str, base: usize, size: usize) -> Self {
        Self {
            name: bounded(name),
            base,
            size,
        }
    }
}

/// Linker-provided layout of core's program image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreImage {
    /// First byte of the program image.
    pub prog_img_beg: usize,
    /// One past the last byte of the program image.
    pub prog_img_end: usize,
    /// Start of the boot-module binaries.
    pub modules_begin: usize,
    /// End of the boot-module binaries.
    pub modules_end: usize,
    /// One header per module.
    pub headers: Vec<BootModuleHeader>,
}

impl CoreImage {
    /// Lays out `code_len` bytes of core code followed by `modules`, each
    /// starting on its own page, and returns the layout together with the
    /// image bytes.
    #[must_use]
    pub fn assemble(prog_img_beg: usize, code_len: usize, modules: &[(&str, &[u8])]) -> (Self, Vec<u8>) {
        let modules_begin = round_page(prog_img_beg + code_len.max(1));
        let mut bytes = vec![0u8; modules_begin - prog_img_beg];
        let mut headers = Vec::with_capacity(modules.len());
        let mut cursor = modules_begin;
        for (name, data) in modules {
            let offset = cursor - prog_img_beg;
            bytes.resize(offset, 0);
            bytes.extend_from_slice(data);
            headers.push(BootModuleHeader::new(name, cursor, data.len()));
            cursor = round_page(cursor + data.len().max(1));
        }
        let modules_end = headers
            .last()
            .map_or(modules_begin, |header| header.base + header.size);
        let prog_img_end = round_page(modules_end);
        bytes.resize(prog_img_end - prog_img_beg, 0);
        (
            Self {
                prog_img_beg,
                prog_img_end,
                modules_begin,
                modules_end,
                headers,
            },
            bytes,
        )
    }

    /// Returns `true` when `virt` lies within the boot-module binaries.
    #[must_use]
    pub const fn in_modules(&self, virt: usize) -> bool {
        self.modules_begin <= virt && virt < self.modules_end
    }

    /// Page-rounded size of the boot-module binaries.
    #[must_use]
    pub const fn modules_size(&self) -> usize {
        round_page(self.modules_end - self.modules_begin)
    }

    /// Page-aligned start of core's image.
    #[must_use]
    pub const fn core_virt_beg(&self) -> usize {
        trunc_page(self.prog_img_beg)
    }

    /// Page-aligned end of core's image.
    #[must_use]
    pub const fn core_virt_end(&self) -> usize {
        round_page(self.prog_img_end)
    }
}

/// Frame placement of one boot module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModulePlacement {
    /// Byte offset of the module relative to the first module.
    pub module_offset: usize,
    /// The same offset in frames.
    pub offset_frames: usize,
    /// Number of frames backing the module.
    pub num_frames: usize,
    /// First destination frame number in the phys CNode.
    pub dst_frame: usize,
}

impl ModulePlacement {
    /// Computes the placement of `header` for modules starting at
    /// `modules_start` and a destination range starting at frame `dst_first_frame`.
    #[must_use]
    pub const fn compute(header: &BootModuleHeader, modules_start: usize, dst_first_frame: usize) -> Self {
        let module_offset = header.base - modules_start;
        let offset_frames = module_offset >> PAGE_SIZE_LOG2;
        Self {
            module_offset,
            offset_frames,
            num_frames: round_page(header.size) >> PAGE_SIZE_LOG2,
            dst_frame: dst_first_frame + offset_frames,
        }
    }

    /// Base of the module within the phys CNode address space.
    #[must_use]
    pub const fn rom_base(&self) -> usize {
        self.dst_frame << PAGE_SIZE_LOG2
    }

    /// Selector index of the module's first source frame, given the index of
    /// the frame backing the first module.
    #[must_use]
    pub const fn src_frame(&self, modules_first_frame: usize) -> usize {
        modules_first_frame + self.offset_frames
    }
}

/// Number of pages needed for `size` bytes.
#[must_use]
pub const fn num_pages(size: usize) -> usize {
    round_page(size) / PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_small_module_lands_on_first_destination_frame() {
        let header = BootModuleHeader::new("test.rom", 0x1000, 600);
        let placement = ModulePlacement::compute(&header, 0x1000, 0x100);
        assert_eq!(placement.module_offset, 0);
        assert_eq!(placement.num_frames, 1);
        assert_eq!(placement.dst_frame, 0x100);
        assert_eq!(placement.rom_base(), 0x10_0000);
    }

    #[test]
    fn later_modules_keep_their_frame_offset() {
        let header = BootModuleHeader::new("init", 0x3000, 0x1001);
        let placement = ModulePlacement::compute(&header, 0x1000, 0x100);
        assert_eq!(placement.offset_frames, 2);
        assert_eq!(placement.num_frames, 2);
        assert_eq!(placement.rom_base(), 0x10_2000);
        assert_eq!(placement.src_frame(40), 42);
    }

    #[test]
    fn assemble_places_modules_on_page_boundaries() {
        let a = [1u8; 10];
        let b = [2u8; 0x1000];
        let (image, bytes) = CoreImage::assemble(0x0040_0000, 0x1800, &[("a", &a[..]), ("b", &b[..])]);
        assert_eq!(image.modules_begin, 0x0040_2000);
        assert_eq!(image.headers[1].base, 0x0040_3000);
        assert_eq!(image.modules_end, 0x0040_4000);
        assert_eq!(image.prog_img_end, 0x0040_4000);
        assert_eq!(bytes.len(), 0x4000);
        assert_eq!(bytes[0x2000], 1);
        assert_eq!(bytes[0x3fff], 2);
        assert_eq!(image.modules_size(), 0x2000);
        assert!(image.in_modules(0x0040_3000));
        assert!(!image.in_modules(0x0040_4000));
    }
}
