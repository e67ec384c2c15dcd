// CLASSIFICATION: COMMUNITY
// Filename: platform_thread.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

mod support;

use std::sync::{Arc, Barrier};

use sel4_core::cspace::layout::{
    frame_sel, CORE_VM_ID, INITIAL_SEL_END, INITIAL_SEL_EP, INITIAL_SEL_LOCK,
};
use sel4_core::pager::{Mapping, PagerEntrypoint, PagerObject, RegionMap};
use sel4_core::pd::Pd;
use sel4_core::sel4::host::ThreadStatus;
use sel4_core::sel4::{CapSel, PAGE_SIZE};
use sel4_core::thread::{
    Lifecycle, PlatformThread, ThreadError, ThreadState, INITIAL_IPC_BUFFER_VIRT,
};

use support::*;

fn word(bytes: &[u8], index: usize) -> usize {
    let size = core::mem::size_of::<usize>();
    let mut raw = [0u8; core::mem::size_of::<usize>()];
    raw.copy_from_slice(&bytes[index * size..(index + 1) * size]);
    usize::from_le_bytes(raw)
}

#[test]
fn thread_moves_through_its_lifecycle() {
    let (kernel, platform) = boot();
    let env = platform.core_env();
    let pd = Arc::new(Pd::new(env, "life").unwrap());
    let mut entrypoint = PagerEntrypoint::new(env).unwrap();
    let mut thread = PlatformThread::new(env, "life-main", 120, 0).unwrap();
    assert_eq!(thread.lifecycle(), Lifecycle::Created);
    assert_eq!(thread.utcb(), INITIAL_IPC_BUFFER_VIRT);
    assert_eq!(env.threads().len(), 1);
    assert_eq!(kernel.thread_status(thread.tcb_sel()).unwrap(), ThreadStatus::Inactive);

    let badge = thread.pager_object_badge();
    let pager = PagerObject::new(
        env,
        CapSel::NULL,
        thread.tcb_sel(),
        badge,
        pd.label(),
        thread.name(),
        Box::new(RegionMap::new()),
    )
    .unwrap();
    entrypoint.manage(pager).unwrap();
    thread.set_pager(entrypoint.lookup(badge).unwrap()).unwrap();

    thread.bind_to_pd(&pd).unwrap();
    assert_eq!(thread.lifecycle(), Lifecycle::Bound);
    assert!(kernel.page_mapped(pd.page_directory_sel(), INITIAL_IPC_BUFFER_VIRT));

    thread.start(REGION_BASE, REGION_BASE + 0x4000).unwrap();
    assert_eq!(thread.lifecycle(), Lifecycle::Started);
    assert_eq!(kernel.thread_status(thread.tcb_sel()).unwrap(), ThreadStatus::Running);

    thread.pause();
    assert_eq!(thread.lifecycle(), Lifecycle::Paused);
    assert_eq!(kernel.thread_status(thread.tcb_sel()).unwrap(), ThreadStatus::Suspended);
    thread.resume();
    assert_eq!(thread.lifecycle(), Lifecycle::Started);
    assert_eq!(kernel.thread_status(thread.tcb_sel()).unwrap(), ThreadStatus::Running);

    drop(thread);
    assert!(env.threads().is_empty());
}

#[test]
fn register_state_reads_back_start_values() {
    let (_kernel, platform) = boot();
    let mut paged = paged(&platform);
    let state = paged.thread.state().unwrap();
    assert_eq!(state.ip, REGION_BASE);
    assert_eq!(state.sp, REGION_BASE + 0x8000);

    assert!(matches!(
        paged.thread.set_state(ThreadState::default()),
        Err(ThreadError::StateAccessFailed)
    ));
}

#[test]
fn first_thread_of_a_pd_gets_the_initial_selectors() {
    let (kernel, platform) = boot();
    let paged = paged(&platform);
    let sels = paged.thread.pd_sels().unwrap();
    assert!(sels.initial);
    assert_eq!(sels.ep, CapSel::new(INITIAL_SEL_EP));
    assert_eq!(sels.lock, CapSel::new(INITIAL_SEL_LOCK));
    assert!(sels.fault_handler.value() >= INITIAL_SEL_END);

    let ipc = kernel
        .frame_contents(frame_sel(paged.thread.ipc_buffer_phys()))
        .unwrap();
    assert_eq!(word(&ipc, 0), INITIAL_SEL_EP);
    assert_eq!(word(&ipc, 1), INITIAL_SEL_LOCK);
}

#[test]
fn further_threads_get_fresh_selectors() {
    let (kernel, platform) = boot();
    let mut paged = paged(&platform);
    let second = start_thread(
        &platform,
        &mut paged.entrypoint,
        &paged.pd,
        "init-second",
        rom_regions(&platform, "init"),
    );
    let first = paged.thread.pd_sels().unwrap();
    let sels = second.pd_sels().unwrap();
    assert!(!sels.initial);
    for sel in [sels.fault_handler, sels.ep, sels.lock] {
        assert!(sel.value() >= INITIAL_SEL_END);
        assert_ne!(sel, first.fault_handler);
    }

    let ipc = kernel.frame_contents(frame_sel(second.ipc_buffer_phys())).unwrap();
    assert_eq!(word(&ipc, 0), sels.ep.value());
    assert_eq!(word(&ipc, 1), sels.lock.value());
    drop(second);
}

#[test]
fn binding_twice_is_rejected() {
    let (_kernel, platform) = boot();
    let mut paged = paged(&platform);
    let other = Arc::new(Pd::new(platform.core_env(), "other").unwrap());
    assert!(matches!(
        paged.thread.bind_to_pd(&other),
        Err(ThreadError::AlreadyBound)
    ));
}

#[test]
fn pager_must_be_managed_before_use() {
    let (_kernel, platform) = boot();
    let env = platform.core_env();
    let mut thread = PlatformThread::new(env, "orphan", 100, 0).unwrap();
    let pager = PagerObject::new(
        env,
        CapSel::NULL,
        thread.tcb_sel(),
        thread.pager_object_badge(),
        "pd",
        thread.name(),
        Box::new(RegionMap::new()),
    )
    .unwrap();
    assert!(matches!(
        thread.set_pager(&pager),
        Err(ThreadError::PagerNotManaged)
    ));
    assert!(matches!(
        thread.install_mapping(&Mapping {
            from_phys: 0,
            to_virt: REGION_BASE,
            num_pages: 1,
            writeable: false,
        }),
        Err(ThreadError::NotBound)
    ));
}

#[test]
fn mapping_reaches_the_thread_address_space() {
    let (kernel, platform) = boot();
    let paged = paged(&platform);
    let rom = platform.rom_fs().lookup("config").unwrap().clone();
    let before = paged.pd.num_mappings();

    paged
        .thread
        .install_mapping(&Mapping {
            from_phys: rom.base(),
            to_virt: 0x2000_0000,
            num_pages: 1,
            writeable: false,
        })
        .unwrap();
    assert!(kernel.page_mapped(paged.pd.page_directory_sel(), 0x2000_0000));
    assert_eq!(paged.pd.num_mappings(), before + 1);

    paged.pd.flush(0x2000_0000, 1).unwrap();
    assert!(!kernel.page_mapped(paged.pd.page_directory_sel(), 0x2000_0000));
    let weak = paged.thread.address_space().unwrap();
    assert!(Arc::ptr_eq(&weak.upgrade().unwrap(), &paged.pd));
}

#[test]
fn started_thread_is_suspended_before_its_capabilities_are_revoked() {
    let (kernel, platform) = boot();
    let paged = paged(&platform);
    let tcb = paged.thread.tcb_sel();
    let pager_cap = paged.entrypoint.lookup(paged.badge).unwrap().cap().unwrap();

    kernel.clear_call_log();
    let Paged {
        thread,
        entrypoint,
        pd,
        ..
    } = paged;
    drop(thread);
    let log = kernel.call_log();

    let suspend = log
        .iter()
        .position(|call| *call == format!("tcb_suspend {tcb}"))
        .expect("suspend");
    let revoke = log
        .iter()
        .position(|call| *call == format!("cnode_revoke 0x{:x}", pager_cap.value()))
        .expect("revoke");
    assert!(suspend < revoke);
    assert!(kernel.thread_status(tcb).is_err());

    drop(entrypoint);
    drop(pd);
}

#[test]
fn unstarted_thread_is_destroyed_without_suspend() {
    let (kernel, platform) = boot();
    let env = platform.core_env();
    let thread = PlatformThread::new(env, "idle", 100, 0).unwrap();
    let tcb = thread.tcb_sel();

    kernel.clear_call_log();
    drop(thread);
    assert!(!kernel
        .call_log()
        .iter()
        .any(|call| call.starts_with("tcb_suspend")));
    assert!(!kernel.slot_occupied(tcb));
    assert!(env.threads().is_empty());
}

#[test]
fn destroyed_threads_and_pds_return_their_memory() {
    let (_kernel, platform) = boot();
    let env = platform.core_env();
    // Core's first temporary mapping creates a page table that stays.
    drop(paged(&platform));

    let avail = env.phys_alloc().unwrap().avail();
    drop(paged(&platform));
    assert_eq!(env.phys_alloc().unwrap().avail(), avail);
    assert!(env.threads().is_empty());
}

#[test]
fn cancel_blocking_signals_the_lock() {
    let (kernel, platform) = boot();
    let paged = paged(&platform);
    kernel.clear_call_log();
    paged.thread.cancel_blocking();
    assert!(kernel.call_log().iter().any(|call| call.starts_with("signal")));
}

#[test]
fn mappings_stop_once_the_thread_is_gone() {
    const VIRT: usize = 0x2000_0000;
    const PAGES: usize = 16;

    let (kernel, platform) = boot();
    let Paged {
        thread,
        entrypoint,
        pd,
        badge,
    } = paged(&platform);
    let rom_base = platform.rom_fs().lookup("config").unwrap().base();
    let registry = Arc::clone(platform.core_env().threads());
    let mapping = |page: usize| Mapping {
        from_phys: rom_base,
        to_virt: VIRT + page * PAGE_SIZE,
        num_pages: 1,
        writeable: false,
    };
    let before = pd.num_mappings();
    let barrier = Barrier::new(2);

    let results: Vec<usize> = std::thread::scope(|scope| {
        let installer = scope.spawn(|| {
            barrier.wait();
            (0..PAGES)
                .map(|page| registry.install_mapping(&mapping(page), badge).unwrap())
                .collect()
        });
        barrier.wait();
        drop(thread);
        installer.join().unwrap()
    });

    let installed = results.iter().take_while(|&&n| n == 1).count();
    assert!(results[installed..].iter().all(|&n| n == 0));
    for page in 0..PAGES {
        assert_eq!(
            kernel.page_mapped(pd.page_directory_sel(), VIRT + page * PAGE_SIZE),
            page < installed
        );
    }
    assert_eq!(pd.num_mappings(), before - 1 + installed);
    assert_eq!(registry.install_mapping(&mapping(PAGES), badge).unwrap(), 0);
    assert!(registry.is_empty());

    drop(entrypoint);
    drop(pd);
}

#[test]
fn pd_ids_are_counted_per_platform() {
    let (_first_kernel, first) = boot();
    let (_second_kernel, second) = boot();
    let a = Pd::new(first.core_env(), "a").unwrap();
    let b = Pd::new(second.core_env(), "b").unwrap();
    let c = Pd::new(first.core_env(), "c").unwrap();
    assert_eq!(a.vm_id(), CORE_VM_ID + 1);
    assert_eq!(b.vm_id(), CORE_VM_ID + 1);
    assert_eq!(c.vm_id(), CORE_VM_ID + 2);
}
