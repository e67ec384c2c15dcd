// CLASSIFICATION: COMMUNITY
// Filename: pager_dispatch.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

mod support;

use std::sync::Arc;

use sel4_core::pager::{Dispatch, PagerEntrypoint, PagerError, PagerObject, PagerState, RegionMap};
use sel4_core::pd::Pd;
use sel4_core::sel4::host::ThreadStatus;
use sel4_core::sel4::{Badge, CapSel, KernelError, PAGE_SIZE};

use support::*;

fn idle(result: Result<Dispatch, PagerError>) -> bool {
    matches!(result, Err(PagerError::Kernel(KernelError::IllegalOperation)))
}

#[test]
fn resolved_fault_is_mapped_and_replied_on_next_pass() {
    let (kernel, platform) = boot();
    let mut paged = paged(&platform);
    let tcb = paged.thread.tcb_sel();

    kernel
        .raise_page_fault(tcb, REGION_BASE, REGION_BASE + PAGE_SIZE + 0x10, false)
        .unwrap();
    assert_eq!(kernel.thread_status(tcb).unwrap(), ThreadStatus::BlockedOnFault);

    assert_eq!(paged.entrypoint.serve_one().unwrap(), Dispatch::Resolved(paged.badge));
    assert!(paged.entrypoint.reply_pending());
    assert_eq!(paged.entrypoint.ipc_pager().fault_addr(), REGION_BASE + PAGE_SIZE + 0x10);
    assert!(!kernel.page_mapped(paged.pd.page_directory_sel(), REGION_BASE + PAGE_SIZE));

    assert!(idle(paged.entrypoint.serve_one()));
    assert!(!paged.entrypoint.reply_pending());
    assert!(kernel.page_mapped(paged.pd.page_directory_sel(), REGION_BASE + PAGE_SIZE));
    assert!(!kernel.page_mapped(paged.pd.page_directory_sel(), REGION_BASE));
    assert_eq!(kernel.thread_status(tcb).unwrap(), ThreadStatus::Running);
}

#[test]
fn unresolved_fault_keeps_thread_blocked_until_wake_up() {
    let (kernel, platform) = boot();
    let mut paged = paged(&platform);
    let tcb = paged.thread.tcb_sel();

    kernel
        .raise_page_fault(tcb, REGION_BASE, REGION_BASE + 0x10_0000, true)
        .unwrap();
    assert_eq!(paged.entrypoint.serve_one().unwrap(), Dispatch::Unresolved(paged.badge));
    assert!(!paged.entrypoint.reply_pending());
    assert_eq!(paged.entrypoint.ipc_pager().state(), PagerState::Deferred);

    let reply_cap = {
        let obj = paged.entrypoint.lookup(paged.badge).unwrap();
        assert!(obj.has_unresolved_page_fault());
        obj.reply_cap_sel()
    };
    assert!(idle(paged.entrypoint.serve_one()));
    assert!(kernel.slot_occupied(reply_cap));
    assert!(!kernel.reply_pending());
    assert_eq!(kernel.thread_status(tcb).unwrap(), ThreadStatus::BlockedOnFault);

    paged.entrypoint.lookup(paged.badge).unwrap().wake_up();
    assert!(!kernel.slot_occupied(reply_cap));
    assert_eq!(kernel.thread_status(tcb).unwrap(), ThreadStatus::Running);
}

#[test]
fn write_to_read_only_region_is_unresolved() {
    let (kernel, platform) = boot();
    let mut paged = paged(&platform);
    kernel
        .raise_page_fault(paged.thread.tcb_sel(), REGION_BASE, REGION_BASE, true)
        .unwrap();
    assert_eq!(paged.entrypoint.serve_one().unwrap(), Dispatch::Unresolved(paged.badge));
    assert!(paged.entrypoint.ipc_pager().write_fault());
}

#[test]
fn deferred_reply_is_saved_before_the_next_fault_is_served() {
    let (kernel, platform) = boot();
    let env = platform.core_env();
    let pd = Arc::new(Pd::new(env, "pair").unwrap());
    let mut entrypoint = PagerEntrypoint::new(env).unwrap();
    let blocked = start_thread(&platform, &mut entrypoint, &pd, "blocked", RegionMap::new());
    let served = start_thread(
        &platform,
        &mut entrypoint,
        &pd,
        "served",
        rom_regions(&platform, "init"),
    );
    assert_ne!(blocked.pager_object_badge(), served.pager_object_badge());

    kernel
        .raise_page_fault(blocked.tcb_sel(), REGION_BASE, REGION_BASE, false)
        .unwrap();
    kernel
        .raise_page_fault(served.tcb_sel(), REGION_BASE, REGION_BASE, false)
        .unwrap();

    assert_eq!(
        entrypoint.serve_one().unwrap(),
        Dispatch::Unresolved(blocked.pager_object_badge())
    );
    assert_eq!(
        entrypoint.serve_one().unwrap(),
        Dispatch::Resolved(served.pager_object_badge())
    );
    let reply_cap = entrypoint
        .lookup(blocked.pager_object_badge())
        .unwrap()
        .reply_cap_sel();
    assert!(kernel.slot_occupied(reply_cap));

    assert!(idle(entrypoint.serve_one()));
    assert_eq!(kernel.thread_status(served.tcb_sel()).unwrap(), ThreadStatus::Running);
    assert_eq!(
        kernel.thread_status(blocked.tcb_sel()).unwrap(),
        ThreadStatus::BlockedOnFault
    );

    entrypoint.lookup(blocked.pager_object_badge()).unwrap().wake_up();
    assert_eq!(kernel.thread_status(blocked.tcb_sel()).unwrap(), ThreadStatus::Running);

    drop(served);
    drop(blocked);
    drop(entrypoint);
}

#[test]
fn entry_drains_queued_faults_and_returns_when_idle() {
    let (kernel, platform) = boot();
    let env = platform.core_env();
    let pd = Arc::new(Pd::new(env, "drain").unwrap());
    let mut entrypoint = PagerEntrypoint::new(env).unwrap();
    let first = start_thread(&platform, &mut entrypoint, &pd, "first", rom_regions(&platform, "init"));
    let second = start_thread(&platform, &mut entrypoint, &pd, "second", rom_regions(&platform, "init"));

    kernel
        .raise_page_fault(first.tcb_sel(), REGION_BASE, REGION_BASE, false)
        .unwrap();
    kernel
        .raise_page_fault(second.tcb_sel(), REGION_BASE, REGION_BASE + PAGE_SIZE, false)
        .unwrap();

    let err = entrypoint.entry();
    assert!(matches!(err, PagerError::Kernel(KernelError::IllegalOperation)));
    assert_eq!(kernel.pending_faults(entrypoint.endpoint_sel()), 0);
    for thread in [&first, &second] {
        assert_eq!(kernel.thread_status(thread.tcb_sel()).unwrap(), ThreadStatus::Running);
    }
    assert!(kernel.page_mapped(pd.page_directory_sel(), REGION_BASE));
    assert!(kernel.page_mapped(pd.page_directory_sel(), REGION_BASE + PAGE_SIZE));

    drop(second);
    drop(first);
    drop(entrypoint);
}

#[test]
fn fault_with_unknown_badge_is_dropped() {
    let (kernel, platform) = boot();
    let mut paged = paged(&platform);
    let dissolved = paged.entrypoint.dissolve(paged.badge);
    assert!(dissolved.is_some());
    assert!(paged.entrypoint.is_empty());

    kernel
        .raise_page_fault(paged.thread.tcb_sel(), REGION_BASE, REGION_BASE, false)
        .unwrap();
    assert_eq!(paged.entrypoint.serve_one().unwrap(), Dispatch::Dropped(paged.badge));
    assert!(!paged.entrypoint.reply_pending());
    assert_eq!(
        kernel.thread_status(paged.thread.tcb_sel()).unwrap(),
        ThreadStatus::BlockedOnFault
    );

    let Paged {
        thread,
        entrypoint,
        pd,
        ..
    } = paged;
    drop(thread);
    drop(dissolved);
    drop(entrypoint);
    drop(pd);
}

#[test]
fn badges_are_unique_per_entrypoint() {
    let (kernel, platform) = boot();
    let env = platform.core_env();
    let mut entrypoint = PagerEntrypoint::new(env).unwrap();
    let badge = Badge::new(0x4242);
    let object = || {
        PagerObject::new(env, CapSel::NULL, CapSel::NULL, badge, "pd", "t", Box::new(RegionMap::new()))
            .unwrap()
    };

    let cap = entrypoint.manage(object()).unwrap();
    assert!(matches!(
        entrypoint.manage(object()),
        Err(PagerError::DuplicateBadge(b)) if b == badge
    ));
    assert_eq!(entrypoint.len(), 1);
    assert_eq!(entrypoint.lookup(badge).and_then(PagerObject::cap), Some(cap));
    assert_eq!(kernel.cap_badge(cap).unwrap(), badge);
}

#[test]
fn zero_badge_is_rejected() {
    let (_kernel, platform) = boot();
    let result = PagerObject::new(
        platform.core_env(),
        CapSel::NULL,
        CapSel::NULL,
        Badge::INVALID,
        "pd",
        "t",
        Box::new(RegionMap::new()),
    );
    assert!(matches!(result, Err(PagerError::InvalidBadge)));
}
