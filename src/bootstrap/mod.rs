// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Core platform bootstrap running as the seL4 root task.
// Author: Lukas Bower

//! Core platform bootstrap.
//!
//! [`Platform::bootstrap`] runs the phases listed in [`phases::ORDERING`]
//! exactly once and in order. A [`Platform`] value exists only after every
//! phase succeeded; a failing phase aborts the boot with a
//! [`BootstrapError`].

pub mod core_mem;
pub mod phases;

use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

use heapless::String;
use thiserror::Error;

use crate::boot_modules::{num_pages, CoreImage, ModulePlacement};
use crate::config::PlatformConfig;
use crate::cspace::layout::{
    CORE_CNODE_SEL, CORE_PAD_CNODE_SEL, CORE_VM_ID, INITIAL_SEL_LOCK, NUM_CORE_PAD_SEL_LOG2,
    NUM_CORE_SEL_LOG2, NUM_PHYS_SEL_LOG2, NUM_TOP_SEL_LOG2, NUM_UNTYPED_SEL_LOG2,
    PHYS_CNODE_SEL, STATIC_CNODE_SELS, TOP_CNODE_CORE_IDX, TOP_CNODE_PHYS_IDX, TOP_CNODE_SEL,
    TOP_CNODE_UNTYPED_IDX, UNTYPED_CNODE_SEL,
};
use crate::cspace::{Cnode, CnodeIndex, SelAlloc};
use crate::env::CoreEnv;
use crate::kobj::{self, KernelObject};
use crate::page_table_registry::PageTableRegistry;
use crate::range_alloc::{AllocError, RangeAllocator};
use crate::rom_fs::{RomFs, RomModule};
use crate::sel4::{
    align_addr, round_page, trunc_page, Badge, BootInfo, CapData, CapSel, Kernel, KernelError, ObjectType,
    ASID_CONTROL, BOOT_INFO_FRAME, DOMAIN, INIT_THREAD_ASID_POOL, INIT_THREAD_CNODE,
    INIT_THREAD_IPC_BUFFER, INIT_THREAD_TCB, INIT_THREAD_VSPACE, IO_PORT, IRQ_CONTROL,
    PAGE_SIZE, PAGE_SIZE_LOG2, PAGE_TABLE_ENTRIES, WORD_BITS,
};
use crate::thread::ThreadRegistry;
use crate::untyped::{InitialUntypedPool, UntypedError};
use crate::vm_space::{bounded, VmError, VmSpace};

use self::core_mem::CoreMemAlloc;
pub use self::phases::{BootstrapError, BootstrapPhase, BootstrapSequencer};
use self::phases::ktry;

/// Well-known selectors copied verbatim into the core CNode.
const COPIED_INITIAL_SELS: [usize; 8] = [
    INIT_THREAD_TCB,
    INIT_THREAD_VSPACE,
    ASID_CONTROL,
    INIT_THREAD_ASID_POOL,
    IO_PORT,
    BOOT_INFO_FRAME,
    INIT_THREAD_IPC_BUFFER,
    DOMAIN,
];

/// Errors raised by platform services after bootstrap.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// No ROM module carries the requested name.
    #[error("no ROM module named '{0}'")]
    UnknownRom(String<64>),
    /// A kernel invocation failed.
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    /// An allocator was exhausted.
    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),
    /// Core's address space could not be changed.
    #[error("vm space: {0}")]
    Vm(#[from] VmError),
    /// Untyped memory could not be converted.
    #[error("untyped memory: {0}")]
    Untyped(#[from] UntypedError),
}

/// Handles on the CNodes making up core's CSpace.
#[derive(Clone, Copy, Debug)]
pub struct CoreCnodes {
    /// Top-level CNode.
    pub top: Cnode,
    /// Second-level pad CNode holding the core CNode.
    pub core_pad: Cnode,
    /// Core's own CNode.
    pub core: Cnode,
    /// CNode with one frame selector per physical page.
    pub phys: Cnode,
    /// CNode with one untyped selector per physical page.
    pub untyped: Cnode,
}

impl CoreCnodes {
    const fn new() -> Self {
        Self {
            top: Cnode::new(TOP_CNODE_SEL, NUM_TOP_SEL_LOG2),
            core_pad: Cnode::new(CORE_PAD_CNODE_SEL, NUM_CORE_PAD_SEL_LOG2),
            core: Cnode::new(CORE_CNODE_SEL, NUM_CORE_SEL_LOG2),
            phys: Cnode::new(PHYS_CNODE_SEL, NUM_PHYS_SEL_LOG2),
            untyped: Cnode::new(UNTYPED_CNODE_SEL, NUM_UNTYPED_SEL_LOG2),
        }
    }
}

/// Core's platform state after a completed bootstrap.
pub struct Platform {
    env: CoreEnv,
    boot_info: BootInfo,
    image: CoreImage,
    cnodes: CoreCnodes,
    untyped_pool: InitialUntypedPool,
    unused_phys_alloc: RangeAllocator,
    io_mem_alloc: RangeAllocator,
    io_port_alloc: RangeAllocator,
    irq_alloc: RangeAllocator,
    core_mem_alloc: CoreMemAlloc,
    core_lock: KernelObject,
    lock_sel: CapSel,
    rom_fs: RomFs,
    phases: BootstrapSequencer,
}

struct Allocators {
    irq: RangeAllocator,
    io_mem: RangeAllocator,
    phys: RangeAllocator,
    virt: RangeAllocator,
}

fn init_unused_phys_alloc(config: &PlatformConfig) -> RangeAllocator {
    let mut alloc = RangeAllocator::new();
    alloc.add_range(
        config.unused_phys_base,
        config.unused_phys_limit - config.unused_phys_base,
    );
    alloc
}

fn validate_boot_info(bi: &BootInfo, image: &CoreImage) -> Result<(), BootstrapError> {
    let capacity = 1usize << bi.init_cnode_size_bits;
    if bi.empty.is_empty() || bi.empty.end > capacity {
        return Err(BootstrapError::boot_info(format_args!(
            "empty window [0x{:04x}..0x{:04x}) outside init CNode capacity 0x{capacity:x}",
            bi.empty.start, bi.empty.end
        )));
    }
    if let Some(sel) = STATIC_CNODE_SELS
        .iter()
        .find(|sel| !bi.empty.contains(sel.value()))
    {
        return Err(BootstrapError::boot_info(format_args!(
            "static CNode selector {sel} not within empty window [0x{:04x}..0x{:04x})",
            bi.empty.start, bi.empty.end
        )));
    }
    if bi.untyped.len() != bi.untyped_list.len() {
        return Err(BootstrapError::boot_info(format_args!(
            "{} untyped selectors but {} descriptors",
            bi.untyped.len(),
            bi.untyped_list.len()
        )));
    }
    let image_pages = (image.core_virt_end() - image.core_virt_beg()) >> PAGE_SIZE_LOG2;
    if bi.user_image_frames.len() < image_pages {
        return Err(BootstrapError::boot_info(format_args!(
            "{} image frames cover less than the {image_pages} pages of core",
            bi.user_image_frames.len()
        )));
    }
    if image.modules_begin < image.prog_img_beg || image.modules_end > image.prog_img_end {
        return Err(BootstrapError::boot_info(format_args!(
            "boot modules [0x{:x}, 0x{:x}) outside core image",
            image.modules_begin, image.modules_end
        )));
    }
    Ok(())
}

fn create_core_cnodes(
    kernel: &dyn Kernel,
    pool: &mut InitialUntypedPool,
    cnodes: &CoreCnodes,
) -> Result<(), BootstrapError> {
    let initial = CapSel::new(INIT_THREAD_CNODE);
    for cnode in [
        cnodes.top,
        cnodes.core_pad,
        cnodes.core,
        cnodes.phys,
        cnodes.untyped,
    ] {
        pool.alloc(
            kernel,
            ObjectType::CNode,
            cnode.size_log2(),
            initial,
            cnode.sel().value(),
        )?;
    }
    Ok(())
}

fn init_ipc_buffer(bi: &BootInfo) {
    // The IPC buffer needs no segment setup on ARM.
    log::debug!("[boot] initial IPC buffer at 0x{:x}", bi.ipc_buffer);
}

fn switch_to_core_cspace(
    kernel: &dyn Kernel,
    bi: &BootInfo,
    image: &CoreImage,
    cnodes: &CoreCnodes,
) -> Result<(), BootstrapError> {
    let initial = Cnode::new(CapSel::new(INIT_THREAD_CNODE), WORD_BITS);
    let core = cnodes.core;

    for sel in COPIED_INITIAL_SELS {
        if let Err(err) = core.copy(kernel, &initial, CnodeIndex::new(sel)) {
            log::error!("[boot] copying initial selector 0x{sel:x}: {err}");
        }
    }
    // IRQ control may exist only once.
    ktry(
        "move IRQ control",
        core.move_from(kernel, &initial, CnodeIndex::new(IRQ_CONTROL).take()),
    )?;

    // The top-level CNode takes over the initial CNode's well-known selector.
    ktry(
        "install top-level CNode",
        core.copy_to(
            kernel,
            &initial,
            CnodeIndex::from(TOP_CNODE_SEL),
            CnodeIndex::new(INIT_THREAD_CNODE),
        ),
    )?;

    // Retyped untyped ranges cannot be copied.
    for sel in bi.untyped.iter() {
        ktry(
            "move untyped selector",
            core.move_from(kernel, &initial, CnodeIndex::new(sel).take()),
        )?;
    }

    let mut virt = image.prog_img_beg;
    for sel in bi.user_image_frames.iter() {
        if image.in_modules(virt) {
            if let Err(err) = kernel.page_unmap(CapSel::new(sel)) {
                log::error!("[boot] unmapping boot modules 0x{virt:x}: {err}");
            }
        }
        ktry(
            "move core image frame",
            core.move_from(kernel, &initial, CnodeIndex::new(sel).take()),
        )?;
        virt += PAGE_SIZE;
    }

    for sel in STATIC_CNODE_SELS {
        ktry(
            "copy static CNode selector",
            core.copy(kernel, &initial, CnodeIndex::from(sel)),
        )?;
    }

    ktry(
        "link core CNode",
        cnodes
            .core_pad
            .copy_to(kernel, &initial, CnodeIndex::from(CORE_CNODE_SEL), CnodeIndex::new(0)),
    )?;
    for (sel, index) in [
        (CORE_PAD_CNODE_SEL, TOP_CNODE_CORE_IDX),
        (PHYS_CNODE_SEL, TOP_CNODE_PHYS_IDX),
        (UNTYPED_CNODE_SEL, TOP_CNODE_UNTYPED_IDX),
    ] {
        ktry(
            "link top-level CNode",
            cnodes
                .top
                .copy_to(kernel, &initial, CnodeIndex::from(sel), CnodeIndex::new(index)),
        )?;
    }

    if let Err(err) = kernel.tcb_set_space(
        CapSel::new(INIT_THREAD_TCB),
        CapSel::NULL,
        TOP_CNODE_SEL,
        CapData::Null,
        CapSel::new(INIT_THREAD_VSPACE),
        CapData::Null,
    ) {
        log::error!("[boot] switch_to_core_cspace: seL4_TCB_SetSpace returned {}", err.code());
    }
    Ok(())
}

fn init_core_page_table_registry(
    bi: &BootInfo,
    image: &CoreImage,
) -> Result<PageTableRegistry, BootstrapError> {
    let mut registry = PageTableRegistry::new();

    let mut virt = image.prog_img_beg;
    for sel in bi.user_image_paging.iter() {
        registry.insert_page_table(virt, CapSel::new(sel))?;
        virt += PAGE_TABLE_ENTRIES * PAGE_SIZE;
    }

    let mut virt = image.prog_img_beg;
    for sel in bi.user_image_frames.iter() {
        if !image.in_modules(virt) {
            registry.insert_page_table_entry(virt, CapSel::new(sel))?;
        }
        virt += PAGE_SIZE;
    }
    log::debug!(
        "[boot] registry: {} page tables, {} entries",
        registry.num_page_tables(),
        registry.num_entries()
    );
    Ok(registry)
}

fn init_allocators(
    kernel: &dyn Kernel,
    bi: &BootInfo,
    image: &CoreImage,
    config: &PlatformConfig,
    pool: &mut InitialUntypedPool,
    unused_phys: &mut RangeAllocator,
) -> Result<Allocators, BootstrapError> {
    let mut allocs = Allocators {
        irq: RangeAllocator::new(),
        io_mem: RangeAllocator::new(),
        phys: RangeAllocator::new(),
        virt: RangeAllocator::new(),
    };
    allocs.irq.add_range(0, config.num_irqs);

    pool.for_each_range(|range| {
        if range.device {
            let phys = trunc_page(range.phys);
            let size = round_page(range.phys - phys + range.size);
            allocs.io_mem.add_range(phys, size);
            unused_phys.remove_range(phys, size);
            return;
        }
        unused_phys.remove_range(range.phys, range.size);
        let offset = align_addr(range.free_offset, PAGE_SIZE_LOG2);
        if offset >= range.size {
            return;
        }
        let base = range.phys + offset;
        allocs.phys.add_range(base, range.size - offset);
    });

    let pages = pool.turn_remainder_into_untyped_pages(kernel)?;
    log::debug!("[boot] {pages} untyped pages available");

    allocs.virt.add_range(config.vm_base, config.vm_size);
    let core_virt_beg = image.core_virt_beg();
    allocs
        .virt
        .remove_range(core_virt_beg, image.modules_begin - core_virt_beg);
    allocs.virt.remove_range(bi.ipc_buffer, PAGE_SIZE);
    let boot_info_size = PAGE_SIZE + bi.extra_len;
    allocs.virt.remove_range(bi.boot_info_vaddr, boot_info_size);
    allocs
        .virt
        .remove_range(config.stack_area_base, config.stack_area_size);

    if config.verbose_boot_info {
        log::info!("virtual address layout of core:");
        log::info!(
            " overall    [0x{:08x},0x{:08x})",
            config.vm_base,
            config.vm_base + config.vm_size
        );
        log::info!(
            " core image [0x{:08x},0x{:08x})",
            core_virt_beg,
            image.core_virt_end()
        );
        log::info!(
            " ipc buffer [0x{:08x},0x{:08x})",
            bi.ipc_buffer,
            bi.ipc_buffer + PAGE_SIZE
        );
        log::info!(
            " boot_info  [0x{:08x},0x{:08x})",
            bi.boot_info_vaddr,
            bi.boot_info_vaddr + boot_info_size
        );
        log::info!(
            " stack area [0x{:08x},0x{:08x})",
            config.stack_area_base,
            config.stack_area_base + config.stack_area_size
        );
    }
    Ok(allocs)
}

fn lock_self_test(env: &CoreEnv) -> Result<(KernelObject, CapSel), BootstrapError> {
    let notification = kobj::create(env, ObjectType::Notification, 0)?;
    let lock_sel = env.alloc_sel()?;
    let core = env.core_cnode();
    ktry(
        "mint lock notification",
        core.mint_badged(
            env.kernel(),
            &core,
            CnodeIndex::from(notification.sel),
            CnodeIndex::from(lock_sel),
            Badge::new(INITIAL_SEL_LOCK),
        ),
    )?;
    ktry("signal lock", env.kernel().signal(lock_sel))?;
    let sender = ktry("wait lock", env.kernel().wait(lock_sel))?;
    if sender.value() != INITIAL_SEL_LOCK {
        return Err(BootstrapError::LockSelfTest {
            sender: sender.value(),
        });
    }
    Ok((notification, lock_sel))
}

fn init_rom_modules(
    kernel: &dyn Kernel,
    bi: &BootInfo,
    image: &CoreImage,
    cnodes: &CoreCnodes,
    unused_phys: &mut RangeAllocator,
) -> Result<RomFs, BootstrapError> {
    let mut rom_fs = RomFs::new();
    if image.headers.is_empty() {
        return Ok(rom_fs);
    }

    let range_start = unused_phys
        .alloc_aligned(image.modules_size(), PAGE_SIZE_LOG2)
        .map_err(|err| {
            log::error!("[boot] could not reserve phys CNode space for boot modules");
            BootstrapError::InitRomModulesFailed(err)
        })?;
    let first_dst_frame = range_start >> PAGE_SIZE_LOG2;
    let modules_first_frame =
        bi.user_image_frames.start + ((image.modules_begin - image.prog_img_beg) >> PAGE_SIZE_LOG2);

    let initial = Cnode::new(CapSel::new(INIT_THREAD_CNODE), WORD_BITS);
    for header in &image.headers {
        let placement = ModulePlacement::compute(header, image.modules_begin, first_dst_frame);
        let first_src = placement.src_frame(modules_first_frame);
        for frame in 0..placement.num_frames {
            ktry(
                "move boot module frame",
                cnodes.phys.move_to(
                    kernel,
                    &initial,
                    CnodeIndex::new(first_src + frame).take(),
                    CnodeIndex::new(placement.dst_frame + frame),
                ),
            )?;
        }
        log::info!("boot module '{}' ({} bytes)", header.name, header.size);
        rom_fs.insert(RomModule::new(placement.rom_base(), header.size, &header.name));
    }
    Ok(rom_fs)
}

impl Platform {
    /// Runs every bootstrap phase on `kernel` and returns the resulting platform.
    pub fn bootstrap(
        kernel: Arc<dyn Kernel>,
        boot_info: BootInfo,
        image: CoreImage,
        config: PlatformConfig,
    ) -> Result<Self, BootstrapError> {
        let mut phases = BootstrapSequencer::new();
        let cnodes = CoreCnodes::new();

        phases.advance(BootstrapPhase::UnusedPhysInit)?;
        validate_boot_info(&boot_info, &image)?;
        let mut unused_phys_alloc = init_unused_phys_alloc(&config);

        phases.advance(BootstrapPhase::CoreCnodesCreate)?;
        let mut untyped_pool = InitialUntypedPool::from_boot_info(&boot_info);
        create_core_cnodes(kernel.as_ref(), &mut untyped_pool, &cnodes)?;

        phases.advance(BootstrapPhase::IpcBufferInit)?;
        init_ipc_buffer(&boot_info);

        phases.advance(BootstrapPhase::CspaceSwitch)?;
        switch_to_core_cspace(kernel.as_ref(), &boot_info, &image, &cnodes)?;

        phases.advance(BootstrapPhase::PageTableRegistryInit)?;
        let registry = init_core_page_table_registry(&boot_info, &image)?;

        phases.advance(BootstrapPhase::AllocatorsInit)?;
        let allocs = init_allocators(
            kernel.as_ref(),
            &boot_info,
            &image,
            &config,
            &mut untyped_pool,
            &mut unused_phys_alloc,
        )?;

        phases.advance(BootstrapPhase::CoreVmSpaceInit)?;
        let core_vm = VmSpace::new(
            CapSel::new(INIT_THREAD_VSPACE),
            CORE_VM_ID,
            "core",
            registry,
        );
        let env = CoreEnv {
            kernel,
            sel_alloc: Arc::new(SelAlloc::new(
                1 << NUM_CORE_SEL_LOG2,
                1 << boot_info.init_cnode_size_bits,
            )),
            phys_alloc: Arc::new(Mutex::new(allocs.phys)),
            virt_alloc: Arc::new(Mutex::new(allocs.virt)),
            core_vm: Arc::new(Mutex::new(core_vm)),
            threads: Arc::new(ThreadRegistry::new()),
            pd_ids: Arc::new(AtomicU32::new(CORE_VM_ID + 1)),
            core_cnode: cnodes.core,
            phys_cnode: cnodes.phys,
            config: Arc::new(config),
        };

        phases.advance(BootstrapPhase::LockSelfTest)?;
        let (core_lock, lock_sel) = lock_self_test(&env)?;

        phases.advance(BootstrapPhase::IoPortInit)?;
        let mut io_port_alloc = RangeAllocator::new();
        io_port_alloc.add_range(0, env.config().io_port_range);
        if env.config().verbose_boot_info {
            log::info!(":phys_alloc:        {}", *env.phys_alloc()?);
            log::info!(":unused_phys_alloc: {unused_phys_alloc}");
            log::info!(":virt_alloc:        {}", *env.virt_alloc()?);
            log::info!(":io_mem_alloc:      {}", allocs.io_mem);
        }

        phases.advance(BootstrapPhase::RomModulesInit)?;
        let rom_fs = init_rom_modules(
            env.kernel(),
            &boot_info,
            &image,
            &cnodes,
            &mut unused_phys_alloc,
        )?;

        Ok(Self {
            core_mem_alloc: CoreMemAlloc::new(env.clone()),
            env,
            boot_info,
            image,
            cnodes,
            untyped_pool,
            unused_phys_alloc,
            io_mem_alloc: allocs.io_mem,
            io_port_alloc,
            irq_alloc: allocs.irq,
            core_lock,
            lock_sel,
            rom_fs,
            phases,
        })
    }

    /// Handles shared with pagers, protection domains and threads.
    #[must_use]
    pub fn core_env(&self) -> &CoreEnv {
        &self.env
    }

    /// Boot info the platform was built from.
    #[must_use]
    pub fn boot_info(&self) -> &BootInfo {
        &self.boot_info
    }

    /// Layout of core's program image.
    #[must_use]
    pub fn core_image(&self) -> &CoreImage {
        &self.image
    }

    /// Handles on the CNodes of core's CSpace.
    #[must_use]
    pub fn cnodes(&self) -> &CoreCnodes {
        &self.cnodes
    }

    /// Phases completed during bootstrap.
    #[must_use]
    pub fn phases(&self) -> &BootstrapSequencer {
        &self.phases
    }

    /// The initial untyped pool, exhausted by bootstrap.
    #[must_use]
    pub fn untyped_pool(&self) -> &InitialUntypedPool {
        &self.untyped_pool
    }

    /// Physical address ranges not backed by RAM or device memory.
    #[must_use]
    pub fn unused_phys_alloc(&self) -> &RangeAllocator {
        &self.unused_phys_alloc
    }

    /// Device memory ranges.
    #[must_use]
    pub fn io_mem_alloc(&self) -> &RangeAllocator {
        &self.io_mem_alloc
    }

    /// I/O-port space.
    #[must_use]
    pub fn io_port_alloc(&self) -> &RangeAllocator {
        &self.io_port_alloc
    }

    /// Interrupt lines.
    #[must_use]
    pub fn irq_alloc(&self) -> &RangeAllocator {
        &self.irq_alloc
    }

    /// Allocator for memory mapped into core.
    #[must_use]
    pub fn core_mem_alloc(&self) -> &CoreMemAlloc {
        &self.core_mem_alloc
    }

    /// Selector of the badged lock notification created by the self test.
    #[must_use]
    pub fn core_lock_sel(&self) -> CapSel {
        self.lock_sel
    }

    /// Notification object backing the core lock.
    #[must_use]
    pub fn core_lock(&self) -> &KernelObject {
        &self.core_lock
    }

    /// Imported ROM modules.
    #[must_use]
    pub fn rom_fs(&self) -> &RomFs {
        &self.rom_fs
    }

    /// Allocates a core selector and makes it the receive slot for capabilities.
    pub fn alloc_core_rcv_sel(&self) -> Result<CapSel, PlatformError> {
        let sel = self.env.alloc_sel()?;
        let core = self.env.core_cnode();
        self.env
            .kernel()
            .set_cap_receive_path(core.sel(), sel.value(), core.size_log2());
        Ok(sel)
    }

    /// Clears the core CNode slot `sel` so it can receive again.
    pub fn reset_sel(&self, sel: CapSel) -> Result<(), PlatformError> {
        self.env
            .core_cnode()
            .remove(self.env.kernel(), CnodeIndex::from(sel))?;
        Ok(())
    }

    /// Maps `num_pages` frames of the phys CNode starting at `phys` into core at `virt`.
    pub fn map_local(&self, phys: usize, virt: usize, num_pages: usize) -> Result<(), PlatformError> {
        Ok(self.env.map_local(phys, virt, num_pages)?)
    }

    /// Removes `num_pages` core mappings starting at `virt`.
    pub fn unmap_local(&self, virt: usize, num_pages: usize) -> Result<(), PlatformError> {
        Ok(self.env.unmap_local(virt, num_pages)?)
    }

    /// Reads the content of the ROM module `name` by temporarily mapping it into core.
    pub fn read_rom_module(&self, name: &str) -> Result<Vec<u8>, PlatformError> {
        let module = self
            .rom_fs
            .lookup(name)
            .cloned()
            .ok_or_else(|| PlatformError::UnknownRom(bounded(name)))?;
        let pages = num_pages(module.size());
        let virt = self
            .env
            .virt_alloc()?
            .alloc_aligned(pages * PAGE_SIZE, PAGE_SIZE_LOG2)?;

        let result = self
            .env
            .map_local(module.base(), virt, pages)
            .map_err(PlatformError::from)
            .and_then(|()| {
                let mut bytes = vec![0u8; module.size()];
                self.env.kernel().read_mapped(virt, &mut bytes)?;
                Ok(bytes)
            });

        if let Err(err) = self.env.unmap_local(virt, pages) {
            log::error!("[rom] unmapping '{name}' at 0x{virt:x}: {err}");
        }
        self.env.virt_alloc()?.free(virt)?;
        result
    }

    /// Blocks the calling thread forever.
    pub fn wait_for_exit(&self) -> ! {
        loop {
            std::thread::park();
        }
    }
}
