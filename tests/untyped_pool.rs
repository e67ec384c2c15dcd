// CLASSIFICATION: COMMUNITY
// Filename: untyped_pool.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

mod support;

use sel4_core::cspace::layout::{frame_sel, untyped_sel};
use sel4_core::kobj;
use sel4_core::sel4::{CapSel, Kernel, KernelError, ObjectType, INIT_THREAD_VSPACE, PAGE_SIZE};
use sel4_core::untyped::{UntypedError, UntypedMemory};

use support::*;

#[test]
fn page_frames_convert_once_and_back() {
    let (kernel, platform) = boot();
    let env = platform.core_env();
    let phys = env.alloc_page().unwrap();

    UntypedMemory::convert_to_page_frames(kernel.as_ref(), phys, 1).unwrap();
    assert_eq!(kernel.frame_phys(frame_sel(phys)).unwrap(), phys);
    assert!(matches!(
        UntypedMemory::convert_to_page_frames(kernel.as_ref(), phys, 1),
        Err(UntypedError::AlreadyConverted { phys: p }) if p == phys
    ));

    UntypedMemory::convert_to_untyped_frames(kernel.as_ref(), phys, PAGE_SIZE).unwrap();
    assert!(!kernel.slot_occupied(frame_sel(phys)));
    assert_eq!(kernel.untyped_watermark(untyped_sel(phys)).unwrap(), 0);
    UntypedMemory::convert_to_page_frames(kernel.as_ref(), phys, 1).unwrap();
    UntypedMemory::convert_to_untyped_frames(kernel.as_ref(), phys, PAGE_SIZE).unwrap();
    env.free_page(phys);
}

#[test]
fn conversion_of_unknown_memory_reports_the_kernel_error() {
    let (kernel, _platform) = boot();
    assert!(matches!(
        UntypedMemory::convert_to_page_frames(kernel.as_ref(), 0xdead_0000, 1),
        Err(UntypedError::Kernel(KernelError::InvalidCapability))
    ));
}

#[test]
fn failed_multi_page_conversion_rolls_back() {
    let (kernel, platform) = boot();
    let env = platform.core_env();
    let phys = UntypedMemory::alloc_pages(&mut *env.phys_alloc().unwrap(), 2).unwrap();
    let second = phys + PAGE_SIZE;
    UntypedMemory::convert_to_page_frames(kernel.as_ref(), second, 1).unwrap();

    assert!(matches!(
        UntypedMemory::convert_to_page_frames(kernel.as_ref(), phys, 2),
        Err(UntypedError::AlreadyConverted { phys: p }) if p == second
    ));
    assert!(!kernel.slot_occupied(frame_sel(phys)));
    assert_eq!(kernel.untyped_watermark(untyped_sel(phys)).unwrap(), 0);
    assert_eq!(kernel.frame_phys(frame_sel(second)).unwrap(), second);

    UntypedMemory::convert_to_untyped_frames(kernel.as_ref(), phys, 2 * PAGE_SIZE).unwrap();
    env.free_page(phys);
}

#[test]
fn kernel_objects_consume_and_return_their_page() {
    let (kernel, platform) = boot();
    let env = platform.core_env();
    let avail = env.phys_alloc().unwrap().avail();

    let obj = kobj::create(env, ObjectType::Endpoint, 0).unwrap();
    assert!(kernel.untyped_watermark(untyped_sel(obj.phys)).unwrap() > 0);
    assert_eq!(env.phys_alloc().unwrap().avail(), avail - PAGE_SIZE);

    kobj::destroy(env, obj).unwrap();
    assert!(!kernel.slot_occupied(obj.sel));
    assert_eq!(kernel.untyped_watermark(untyped_sel(obj.phys)).unwrap(), 0);
    assert_eq!(env.phys_alloc().unwrap().avail(), avail);
}

#[test]
fn distinct_objects_never_share_a_page() {
    let (_kernel, platform) = boot();
    let env = platform.core_env();
    let objects: Vec<_> = [ObjectType::Tcb, ObjectType::Endpoint, ObjectType::Notification]
        .into_iter()
        .map(|object| kobj::create(env, object, 0).unwrap())
        .collect();
    for (i, a) in objects.iter().enumerate() {
        for b in &objects[i + 1..] {
            assert_ne!(a.phys, b.phys);
            assert_ne!(a.sel, b.sel);
        }
    }
    for obj in objects {
        kobj::destroy(env, obj).unwrap();
    }
}

#[test]
fn core_memory_is_mapped_and_released() {
    let (kernel, platform) = boot();
    let core_mem = platform.core_mem_alloc();
    let vspace = CapSel::new(INIT_THREAD_VSPACE);

    let virt = core_mem.alloc(PAGE_SIZE + 1).unwrap();
    assert_eq!(virt % PAGE_SIZE, 0);
    assert!(kernel.page_mapped(vspace, virt));
    assert!(kernel.page_mapped(vspace, virt + PAGE_SIZE));
    assert!(core_mem.phys_addr(virt).is_some());

    kernel.write_mapped(virt + 8, b"core").unwrap();
    let mut buf = [0u8; 4];
    kernel.read_mapped(virt + 8, &mut buf).unwrap();
    assert_eq!(&buf, b"core");

    core_mem.free(virt).unwrap();
    assert!(core_mem.is_empty());
    assert!(!kernel.page_mapped(vspace, virt));
    assert!(core_mem.free(virt).is_err());
}
