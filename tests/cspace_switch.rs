// CLASSIFICATION: COMMUNITY
// Filename: cspace_switch.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

mod support;

use sel4_core::cspace::layout::{CORE_CNODE_SEL, PHYS_CNODE_SEL, STATIC_CNODE_SELS, UNTYPED_CNODE_SEL};
use sel4_core::cspace::CnodeIndex;
use sel4_core::kobj;
use sel4_core::sel4::{
    CapSel, KernelError, ObjectType, ASID_CONTROL, BOOT_INFO_FRAME, INIT_THREAD_ASID_POOL,
    INIT_THREAD_IPC_BUFFER, INIT_THREAD_TCB, INIT_THREAD_VSPACE, IRQ_CONTROL,
};

use support::*;

#[test]
fn initial_selectors_stay_reachable_through_core() {
    let (kernel, _platform) = boot();
    for sel in [
        INIT_THREAD_TCB,
        INIT_THREAD_VSPACE,
        ASID_CONTROL,
        INIT_THREAD_ASID_POOL,
        INIT_THREAD_IPC_BUFFER,
        BOOT_INFO_FRAME,
    ] {
        assert!(kernel.slot_occupied(CapSel::new(sel)), "selector 0x{sel:x}");
    }
    for sel in STATIC_CNODE_SELS {
        assert!(kernel.slot_occupied(sel), "static selector {sel}");
    }
}

#[test]
fn irq_control_exists_exactly_once() {
    let (kernel, platform) = boot();
    let env = platform.core_env();
    let core = env.core_cnode();
    assert!(kernel.slot_occupied(CapSel::new(IRQ_CONTROL)));

    let dst = env.alloc_sel().unwrap();
    let err = core
        .copy_to(kernel.as_ref(), &core, CnodeIndex::new(IRQ_CONTROL), CnodeIndex::from(dst))
        .unwrap_err();
    assert_eq!(err, KernelError::IllegalOperation);
    assert!(!kernel.slot_occupied(dst));
}

#[test]
fn retyped_untyped_ranges_were_moved_not_copied() {
    let (kernel, platform) = boot();
    let env = platform.core_env();
    let core = env.core_cnode();
    let ram = platform
        .untyped_pool()
        .ranges()
        .iter()
        .find(|range| !range.device)
        .copied()
        .unwrap();
    assert!(kernel.slot_occupied(ram.sel));

    let dst = env.alloc_sel().unwrap();
    let err = core
        .copy_to(kernel.as_ref(), &core, CnodeIndex::from(ram.sel), CnodeIndex::from(dst))
        .unwrap_err();
    assert_eq!(err, KernelError::RevokeFirst);
}

#[test]
fn core_image_frames_keep_their_physical_pages() {
    let (kernel, platform) = boot();
    let first = platform.boot_info().user_image_frames.start;
    assert_eq!(kernel.frame_phys(CapSel::new(first)).unwrap(), IMAGE_PHYS);
}

#[test]
fn core_cnodes_are_linked_into_the_top_level() {
    let (kernel, platform) = boot();
    let cnodes = platform.cnodes();
    assert!(kernel.same_object(cnodes.core.sel(), CORE_CNODE_SEL));
    assert!(kernel.same_object(cnodes.phys.sel(), PHYS_CNODE_SEL));
    assert!(kernel.same_object(cnodes.untyped.sel(), UNTYPED_CNODE_SEL));
}

#[test]
fn moved_selector_leaves_source_empty() {
    let (kernel, platform) = boot();
    let env = platform.core_env();
    let core = env.core_cnode();
    let obj = kobj::create(env, ObjectType::Notification, 0).unwrap();
    let copy = env.alloc_sel().unwrap();
    let moved = env.alloc_sel().unwrap();

    core.copy_to(kernel.as_ref(), &core, CnodeIndex::from(obj.sel), CnodeIndex::from(copy))
        .unwrap();
    core.move_to(
        kernel.as_ref(),
        &core,
        CnodeIndex::from(copy).take(),
        CnodeIndex::from(moved),
    )
    .unwrap();

    assert!(!kernel.slot_occupied(copy));
    assert!(kernel.slot_occupied(moved));
    assert!(kernel.same_object(moved, obj.sel));
    // Copies stay valid next to their parent until revoked.
    assert!(kernel.slot_occupied(obj.sel));
    core.revoke(kernel.as_ref(), CnodeIndex::from(obj.sel)).unwrap();
    assert!(!kernel.slot_occupied(moved));
    assert!(kernel.slot_occupied(obj.sel));
}
