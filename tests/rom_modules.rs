// CLASSIFICATION: COMMUNITY
// Filename: rom_modules.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

mod support;

use sel4_core::bootstrap::PlatformError;
use sel4_core::cspace::layout::frame_sel;
use sel4_core::sel4::{CapSel, INIT_THREAD_VSPACE, PAGE_SIZE, PAGE_SIZE_LOG2};

use support::*;

#[test]
fn modules_are_registered_at_consecutive_phys_cnode_frames() {
    let (_kernel, platform) = boot();
    let rom_fs = platform.rom_fs();
    assert_eq!(rom_fs.len(), 2);

    let init = rom_fs.lookup("init").expect("init");
    let config = rom_fs.lookup("config").expect("config");
    let first_dst_frame = platform.core_env().config().unused_phys_base >> PAGE_SIZE_LOG2;

    assert_eq!(init.base(), first_dst_frame << PAGE_SIZE_LOG2);
    assert_eq!(init.size(), 2 * PAGE_SIZE + 100);
    assert_eq!(config.base(), init.base() + 3 * PAGE_SIZE);
    assert_eq!(config.size(), 600);
}

#[test]
fn module_content_reads_back_unchanged() {
    let (_kernel, platform) = boot();
    for (name, bytes) in default_modules() {
        assert_eq!(platform.read_rom_module(name).unwrap(), bytes, "module {name}");
    }
}

#[test]
fn reading_leaves_no_mapping_behind() {
    let (_kernel, platform) = boot();
    let env = platform.core_env();
    let avail = env.virt_alloc().unwrap().avail();
    platform.read_rom_module("init").unwrap();
    assert_eq!(env.virt_alloc().unwrap().avail(), avail);
}

#[test]
fn unknown_module_is_reported() {
    let (_kernel, platform) = boot();
    assert!(matches!(
        platform.read_rom_module("missing"),
        Err(PlatformError::UnknownRom(name)) if name.as_str() == "missing"
    ));
}

#[test]
fn module_frames_move_to_the_phys_cnode() {
    let (kernel, platform) = boot();
    let image = platform.core_image();
    let init = platform.rom_fs().lookup("init").unwrap();
    let offset = image.modules_begin - PROG_IMG_BEG;

    assert_eq!(kernel.frame_phys(frame_sel(init.base())).unwrap(), IMAGE_PHYS + offset);
    let modules_first_frame = platform.boot_info().user_image_frames.start + (offset >> PAGE_SIZE_LOG2);
    assert!(!kernel.slot_occupied(CapSel::new(modules_first_frame)));
}

#[test]
fn module_pages_are_unmapped_from_core() {
    let (kernel, platform) = boot();
    let image = platform.core_image();
    let vspace = CapSel::new(INIT_THREAD_VSPACE);
    assert!(kernel.page_mapped(vspace, PROG_IMG_BEG));
    assert!(!kernel.page_mapped(vspace, image.modules_begin));
    assert!(!kernel.page_mapped(vspace, image.modules_end - 1));
}

#[test]
fn single_small_module_occupies_one_frame() {
    let modules = vec![("test.rom", module_bytes(600, 0))];
    let (kernel, platform) = try_boot_with(&modules, quiet_config(), 12);
    let platform = platform.expect("bootstrap");
    let rom = platform.rom_fs().lookup("test.rom").unwrap();
    assert_eq!(rom.base(), 0x100 << PAGE_SIZE_LOG2);
    assert_eq!(rom.size(), 600);
    assert!(kernel.slot_occupied(frame_sel(rom.base())));
    assert!(!kernel.slot_occupied(frame_sel(rom.base() + PAGE_SIZE)));
    assert_eq!(rom.to_string(), "[0x00100000,0x00100258) test.rom");
}
