// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Host-mode model of the seL4 kernel used for developer testing.
// Author: Lukas Bower

//! Host-mode kernel model.
//!
//! [`HostKernel`] keeps a table of kernel objects and the capabilities that
//! name them. It enforces the rules core relies on: capability derivation and
//! revocation, untyped watermarks, guarded CNode resolution, one mapping per
//! frame capability, TCB scheduling state and fault delivery through badged
//! endpoints. Operations that would block forever on hardware (receive on an
//! idle endpoint, wait on an idle notification) fail with
//! [`KernelError::IllegalOperation`] instead.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{
    align_addr, round_page, trunc_page, Badge, BootInfo, CapData, CapRights, CapSel, Kernel,
    KernelError, KernelResult, MessageInfo, ObjectType, SlotPath, SlotRegion, UntypedDesc,
    UserContext, ASID_CONTROL, BOOT_INFO_FRAME, DOMAIN, INIT_THREAD_ASID_POOL, INIT_THREAD_CNODE,
    INIT_THREAD_IPC_BUFFER, INIT_THREAD_TCB, INIT_THREAD_VSPACE, IO_PORT, IRQ_CONTROL,
    NUM_INITIAL_CAPS, PAGE_SIZE, PAGE_SIZE_LOG2, PAGE_TABLE_SPAN_LOG2, VM_FAULT_LABEL,
    VM_FAULT_LENGTH, WORD_BITS,
};

type ObjId = usize;

const NUM_MRS: usize = 8;

/// Scheduling state of a modelled thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created but never started.
    Inactive,
    /// Runnable.
    Running,
    /// Suspended via `TCB_Suspend`.
    Suspended,
    /// Blocked until its page fault is replied to.
    BlockedOnFault,
}

/// Machine description used to boot the host-mode kernel.
#[derive(Clone, Debug)]
pub struct HostBootConfig {
    /// Radix of the initial thread's CNode.
    pub init_cnode_size_bits: u8,
    /// Untyped memory handed to the root task.
    pub untyped: Vec<UntypedDesc>,
    /// Virtual address where the root task's program image starts.
    pub prog_img_beg: usize,
    /// Contents of the program image, boot modules included.
    pub image: Vec<u8>,
    /// Physical address backing the first page of the program image.
    pub image_phys: usize,
    /// Size of the extra boot-info area.
    pub extra_len: usize,
}

#[derive(Clone, Debug)]
struct Cap {
    id: u64,
    object: ObjId,
    badge: Badge,
    rights: CapRights,
    guard: usize,
    guard_bits: u8,
    mapping: Option<(ObjId, usize)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Irq,
    AsidControl,
    AsidPool,
    IoPort,
    Domain,
}

#[derive(Debug)]
struct Tcb {
    status: ThreadStatus,
    cspace_root: Option<Cap>,
    vspace: Option<ObjId>,
    fault_ep: usize,
    ipc_buffer: usize,
    ipc_frame: Option<ObjId>,
    regs: UserContext,
    priority: u8,
}

impl Tcb {
    fn new() -> Self {
        Self {
            status: ThreadStatus::Inactive,
            cspace_root: None,
            vspace: None,
            fault_ep: 0,
            ipc_buffer: 0,
            ipc_frame: None,
            regs: UserContext::default(),
            priority: 0,
        }
    }
}

#[derive(Clone, Debug)]
struct PendingFault {
    sender: ObjId,
    badge: Badge,
    mrs: [usize; NUM_MRS],
}

#[derive(Debug)]
enum Object {
    Untyped {
        phys: usize,
        size_bits: u8,
        device: bool,
        watermark: usize,
    },
    Frame {
        phys: usize,
        data: Option<Vec<u8>>,
    },
    PageTable {
        mapped: bool,
    },
    PageDirectory {
        asid: bool,
        tables: BTreeMap<usize, ObjId>,
        pages: BTreeMap<usize, ObjId>,
    },
    CNode {
        radix: u8,
        slots: BTreeMap<usize, Cap>,
    },
    Tcb(Box<Tcb>),
    Endpoint {
        queue: VecDeque<PendingFault>,
    },
    Notification {
        word: usize,
        pending: bool,
    },
    Reply {
        caller: ObjId,
    },
    Control(Control),
}

struct HostState {
    objects: Vec<Object>,
    parents: HashMap<u64, Option<u64>>,
    next_cap_id: u64,
    root_tcb: ObjId,
    caller_reply: Option<ObjId>,
    mrs: [usize; NUM_MRS],
    receive_path: Option<(CapSel, usize, u8)>,
    log: Vec<String>,
}

fn mask(bits: u32) -> usize {
    if bits as usize >= usize::BITS as usize {
        usize::MAX
    } else {
        (1usize << bits) - 1
    }
}

impl HostState {
    fn add_object(&mut self, object: Object) -> ObjId {
        self.objects.push(object);
        self.objects.len() - 1
    }

    fn new_cap(&mut self, object: ObjId, parent: Option<u64>) -> Cap {
        let id = self.next_cap_id;
        self.next_cap_id += 1;
        self.parents.insert(id, parent);
        Cap {
            id,
            object,
            badge: Badge::INVALID,
            rights: CapRights::all(),
            guard: 0,
            guard_bits: 0,
            mapping: None,
        }
    }

    fn derive(&mut self, src: &Cap) -> Cap {
        let mut cap = self.new_cap(src.object, Some(src.id));
        cap.badge = src.badge;
        cap.rights = src.rights;
        cap.guard = src.guard;
        cap.guard_bits = src.guard_bits;
        cap
    }

    fn slot(&self, cnode: ObjId, index: usize) -> Option<&Cap> {
        match &self.objects[cnode] {
            Object::CNode { slots, .. } => slots.get(&index),
            _ => None,
        }
    }

    fn slot_mut(&mut self, cnode: ObjId, index: usize) -> Option<&mut Cap> {
        match &mut self.objects[cnode] {
            Object::CNode { slots, .. } => slots.get_mut(&index),
            _ => None,
        }
    }

    fn put(&mut self, cnode: ObjId, index: usize, cap: Cap) {
        if let Object::CNode { slots, .. } = &mut self.objects[cnode] {
            slots.insert(index, cap);
        }
    }

    fn take(&mut self, cnode: ObjId, index: usize) -> Option<Cap> {
        match &mut self.objects[cnode] {
            Object::CNode { slots, .. } => slots.remove(&index),
            _ => None,
        }
    }

    fn radix(&self, cnode: ObjId) -> Option<u8> {
        match &self.objects[cnode] {
            Object::CNode { radix, .. } => Some(*radix),
            _ => None,
        }
    }

    fn caller_root(&self) -> KernelResult<Cap> {
        match &self.objects[self.root_tcb] {
            Object::Tcb(tcb) => tcb.cspace_root.clone().ok_or(KernelError::FailedLookup),
            _ => Err(KernelError::FailedLookup),
        }
    }

    fn resolve(&self, root: &Cap, index: usize, depth: u8) -> KernelResult<(ObjId, usize)> {
        let mut cap = root.clone();
        let mut remaining = u32::from(depth);
        loop {
            let radix = u32::from(self.radix(cap.object).ok_or(KernelError::FailedLookup)?);
            let guard_bits = u32::from(cap.guard_bits);
            if remaining < guard_bits + radix {
                return Err(KernelError::FailedLookup);
            }
            if guard_bits > 0 {
                let guard = (index >> (remaining - guard_bits)) & mask(guard_bits);
                if guard != cap.guard {
                    return Err(KernelError::FailedLookup);
                }
            }
            remaining -= guard_bits;
            let slot = (index >> (remaining - radix)) & mask(radix);
            remaining -= radix;
            if remaining == 0 {
                return Ok((cap.object, slot));
            }
            match self.slot(cap.object, slot) {
                Some(next) if self.radix(next.object).is_some() => cap = next.clone(),
                _ => return Ok((cap.object, slot)),
            }
        }
    }

    /// Locates the slot named by `sel` in the caller's CSpace.
    fn locate(&self, sel: CapSel) -> KernelResult<(ObjId, usize)> {
        let root = self.caller_root()?;
        self.resolve(&root, sel.value(), WORD_BITS)
    }

    fn lookup_cap(&self, sel: CapSel) -> KernelResult<Cap> {
        let (cnode, index) = self.locate(sel)?;
        self.slot(cnode, index)
            .cloned()
            .ok_or(KernelError::InvalidCapability)
    }

    fn lookup_path(&self, path: SlotPath) -> KernelResult<(ObjId, usize)> {
        let root = self.lookup_cap(path.root).map_err(|_| KernelError::FailedLookup)?;
        if self.radix(root.object).is_none() {
            return Err(KernelError::FailedLookup);
        }
        let root = if path.depth == self.radix(root.object).unwrap_or(0) {
            Cap {
                guard_bits: 0,
                guard: 0,
                ..root
            }
        } else {
            root
        };
        self.resolve(&root, path.index, path.depth)
    }

    fn tcb(&self, sel: CapSel) -> KernelResult<ObjId> {
        let cap = self.lookup_cap(sel)?;
        match &self.objects[cap.object] {
            Object::Tcb(_) => Ok(cap.object),
            _ => Err(KernelError::InvalidCapability),
        }
    }

    fn tcb_mut(&mut self, object: ObjId) -> KernelResult<&mut Tcb> {
        match &mut self.objects[object] {
            Object::Tcb(tcb) => Ok(tcb),
            _ => Err(KernelError::InvalidCapability),
        }
    }

    fn page_directory(&self, sel: CapSel) -> KernelResult<ObjId> {
        let cap = self.lookup_cap(sel)?;
        match &self.objects[cap.object] {
            Object::PageDirectory { asid: true, .. } => Ok(cap.object),
            _ => Err(KernelError::InvalidCapability),
        }
    }

    fn is_ancestor(&self, ancestor: u64, mut id: u64) -> bool {
        while let Some(Some(parent)) = self.parents.get(&id) {
            if *parent == ancestor {
                return true;
            }
            id = *parent;
        }
        false
    }

    fn slots_where(&self, pred: impl Fn(&Cap) -> bool) -> Vec<(ObjId, usize)> {
        let mut found = Vec::new();
        for (object_id, object) in self.objects.iter().enumerate() {
            if let Object::CNode { slots, .. } = object {
                for (index, cap) in slots {
                    if pred(cap) {
                        found.push((object_id, *index));
                    }
                }
            }
        }
        found
    }

    fn delete_cap(&mut self, cnode: ObjId, index: usize) {
        let Some(cap) = self.take(cnode, index) else {
            return;
        };
        if let Some((pd, vaddr)) = cap.mapping {
            if let Object::PageDirectory { pages, .. } = &mut self.objects[pd] {
                pages.remove(&vaddr);
            }
        }
        let parent = self.parents.remove(&cap.id).flatten();
        for link in self.parents.values_mut() {
            if *link == Some(cap.id) {
                *link = parent;
            }
        }
    }

    fn check_derivable(&self, cap: &Cap) -> KernelResult<()> {
        match &self.objects[cap.object] {
            Object::Control(Control::Irq) => Err(KernelError::IllegalOperation),
            Object::Untyped { watermark, .. } if *watermark > 0 => Err(KernelError::RevokeFirst),
            Object::Reply { .. } => Err(KernelError::IllegalOperation),
            _ => Ok(()),
        }
    }

    fn resume(&mut self, object: ObjId) {
        if let Object::Tcb(tcb) = &mut self.objects[object] {
            if tcb.status == ThreadStatus::BlockedOnFault {
                tcb.status = ThreadStatus::Running;
            }
        }
    }

    fn frame_at(&self, vaddr: usize) -> KernelResult<ObjId> {
        let pd = match &self.objects[self.root_tcb] {
            Object::Tcb(tcb) => tcb.vspace.ok_or(KernelError::FailedLookup)?,
            _ => return Err(KernelError::FailedLookup),
        };
        match &self.objects[pd] {
            Object::PageDirectory { pages, .. } => pages
                .get(&trunc_page(vaddr))
                .copied()
                .ok_or(KernelError::FailedLookup),
            _ => Err(KernelError::FailedLookup),
        }
    }

    fn record(&mut self, entry: String) {
        log::trace!("[host] {entry}");
        self.log.push(entry);
    }
}

/// Host-mode implementation of [`Kernel`].
pub struct HostKernel {
    state: Mutex<HostState>,
}

impl HostKernel {
    /// Boots the model and returns it together with the boot info handed to the root task.
    #[must_use]
    pub fn boot(config: &HostBootConfig) -> (Self, BootInfo) {
        let mut state = HostState {
            objects: Vec::new(),
            parents: HashMap::new(),
            next_cap_id: 1,
            root_tcb: 0,
            caller_reply: None,
            mrs: [0; NUM_MRS],
            receive_path: None,
            log: Vec::new(),
        };

        let radix = config.init_cnode_size_bits;
        let cnode = state.add_object(Object::CNode {
            radix,
            slots: BTreeMap::new(),
        });
        let mut cnode_cap = state.new_cap(cnode, None);
        cnode_cap.guard_bits = WORD_BITS - radix;
        state.put(cnode, INIT_THREAD_CNODE, cnode_cap.clone());

        let tcb = state.add_object(Object::Tcb(Box::new(Tcb::new())));
        state.root_tcb = tcb;
        let vspace = state.add_object(Object::PageDirectory {
            asid: true,
            tables: BTreeMap::new(),
            pages: BTreeMap::new(),
        });

        let install = |state: &mut HostState, index: usize, object: Object| -> ObjId {
            let id = state.add_object(object);
            let cap = state.new_cap(id, None);
            state.put(cnode, index, cap);
            id
        };
        let tcb_cap = state.new_cap(tcb, None);
        state.put(cnode, INIT_THREAD_TCB, tcb_cap);
        let vspace_cap = state.new_cap(vspace, None);
        state.put(cnode, INIT_THREAD_VSPACE, vspace_cap);
        install(&mut state, IRQ_CONTROL, Object::Control(Control::Irq));
        install(&mut state, ASID_CONTROL, Object::Control(Control::AsidControl));
        install(&mut state, INIT_THREAD_ASID_POOL, Object::Control(Control::AsidPool));
        install(&mut state, IO_PORT, Object::Control(Control::IoPort));
        install(&mut state, DOMAIN, Object::Control(Control::Domain));

        let image_pages = round_page(config.image.len()) >> PAGE_SIZE_LOG2;
        let ipc_buffer = config.prog_img_beg + image_pages * PAGE_SIZE;
        let boot_info_vaddr = ipc_buffer + PAGE_SIZE;
        let span_end = boot_info_vaddr + PAGE_SIZE;

        let ipc_frame = install(
            &mut state,
            INIT_THREAD_IPC_BUFFER,
            Object::Frame {
                phys: config.image_phys + image_pages * PAGE_SIZE,
                data: None,
            },
        );
        let bi_frame = install(
            &mut state,
            BOOT_INFO_FRAME,
            Object::Frame {
                phys: config.image_phys + (image_pages + 1) * PAGE_SIZE,
                data: None,
            },
        );

        let mut next = NUM_INITIAL_CAPS;

        let first_table = config.prog_img_beg >> PAGE_TABLE_SPAN_LOG2;
        let last_table = (span_end - 1) >> PAGE_TABLE_SPAN_LOG2;
        let paging_start = next;
        let mut tables = BTreeMap::new();
        for table in first_table..=last_table {
            let id = install(&mut state, next, Object::PageTable { mapped: true });
            tables.insert(table, id);
            next += 1;
        }
        let user_image_paging = SlotRegion::new(paging_start, next);

        let frames_start = next;
        let mut pages = BTreeMap::new();
        for page in 0..image_pages {
            let begin = page * PAGE_SIZE;
            let end = (begin + PAGE_SIZE).min(config.image.len());
            let mut data = vec![0u8; PAGE_SIZE];
            data[..end - begin].copy_from_slice(&config.image[begin..end]);
            let id = install(
                &mut state,
                next,
                Object::Frame {
                    phys: config.image_phys + begin,
                    data: Some(data),
                },
            );
            let vaddr = config.prog_img_beg + begin;
            pages.insert(vaddr, id);
            if let Some(cap) = state.slot_mut(cnode, next) {
                cap.mapping = Some((vspace, vaddr));
            }
            next += 1;
        }
        let user_image_frames = SlotRegion::new(frames_start, next);

        for (index, (vaddr, frame)) in [
            (INIT_THREAD_IPC_BUFFER, (ipc_buffer, ipc_frame)),
            (BOOT_INFO_FRAME, (boot_info_vaddr, bi_frame)),
        ] {
            pages.insert(vaddr, frame);
            if let Some(cap) = state.slot_mut(cnode, index) {
                cap.mapping = Some((vspace, vaddr));
            }
        }

        if let Object::PageDirectory {
            tables: pd_tables,
            pages: pd_pages,
            ..
        } = &mut state.objects[vspace]
        {
            *pd_tables = tables;
            *pd_pages = pages;
        }

        let untyped_start = next;
        for desc in &config.untyped {
            install(
                &mut state,
                next,
                Object::Untyped {
                    phys: desc.paddr,
                    size_bits: desc.size_bits,
                    device: desc.is_device,
                    watermark: 0,
                },
            );
            next += 1;
        }
        let untyped = SlotRegion::new(untyped_start, next);

        if let Object::Tcb(root) = &mut state.objects[tcb] {
            root.status = ThreadStatus::Running;
            root.cspace_root = Some(cnode_cap);
            root.vspace = Some(vspace);
            root.ipc_buffer = ipc_buffer;
            root.ipc_frame = Some(ipc_frame);
        }

        let boot_info = BootInfo {
            init_cnode_size_bits: radix,
            empty: SlotRegion::new(next, 1 << radix),
            untyped,
            user_image_frames,
            user_image_paging,
            untyped_list: config.untyped.clone(),
            ipc_buffer,
            boot_info_vaddr,
            extra_len: config.extra_len,
        };

        (
            Self {
                state: Mutex::new(state),
            },
            boot_info,
        )
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Delivers a VM fault raised by the thread `tcb` to its fault endpoint.
    pub fn raise_page_fault(&self, tcb: CapSel, ip: usize, addr: usize, write: bool) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("fault tcb={tcb} ip=0x{ip:x} addr=0x{addr:x} write={write}"));
        let thread = state.tcb(tcb)?;
        let (root, fault_ep) = match &state.objects[thread] {
            Object::Tcb(t) if t.status == ThreadStatus::Running => {
                (t.cspace_root.clone().ok_or(KernelError::FailedLookup)?, t.fault_ep)
            }
            _ => return Err(KernelError::IllegalOperation),
        };
        let (cnode, index) = state.resolve(&root, fault_ep, WORD_BITS)?;
        let ep_cap = state
            .slot(cnode, index)
            .cloned()
            .ok_or(KernelError::FailedLookup)?;
        let mut mrs = [0usize; NUM_MRS];
        mrs[0] = ip;
        mrs[1] = addr;
        mrs[3] = if write { 0x2 } else { 0x0 };
        let fault = PendingFault {
            sender: thread,
            badge: ep_cap.badge,
            mrs,
        };
        match &mut state.objects[ep_cap.object] {
            Object::Endpoint { queue } => queue.push_back(fault),
            _ => return Err(KernelError::InvalidCapability),
        }
        state.tcb_mut(thread)?.status = ThreadStatus::BlockedOnFault;
        Ok(())
    }

    /// Returns the scheduling state of the thread named by `tcb`.
    pub fn thread_status(&self, tcb: CapSel) -> KernelResult<ThreadStatus> {
        let state = self.state();
        let thread = state.tcb(tcb)?;
        match &state.objects[thread] {
            Object::Tcb(t) => Ok(t.status),
            _ => Err(KernelError::InvalidCapability),
        }
    }

    /// Returns `true` when `sel` names an occupied slot of the caller's CSpace.
    #[must_use]
    pub fn slot_occupied(&self, sel: CapSel) -> bool {
        self.state().lookup_cap(sel).is_ok()
    }

    /// Returns `true` when `path` names an occupied slot.
    #[must_use]
    pub fn slot_occupied_at(&self, path: SlotPath) -> bool {
        let state = self.state();
        state
            .lookup_path(path)
            .map(|(cnode, index)| state.slot(cnode, index).is_some())
            .unwrap_or(false)
    }

    /// Returns `true` when both selectors name the same kernel object.
    #[must_use]
    pub fn same_object(&self, a: CapSel, b: CapSel) -> bool {
        let state = self.state();
        match (state.lookup_cap(a), state.lookup_cap(b)) {
            (Ok(a), Ok(b)) => a.object == b.object,
            _ => false,
        }
    }

    /// Returns the badge carried by the capability at `sel`.
    pub fn cap_badge(&self, sel: CapSel) -> KernelResult<Badge> {
        self.state().lookup_cap(sel).map(|cap| cap.badge)
    }

    /// Returns the watermark of the untyped object named by `sel`.
    pub fn untyped_watermark(&self, sel: CapSel) -> KernelResult<usize> {
        let state = self.state();
        let cap = state.lookup_cap(sel)?;
        match &state.objects[cap.object] {
            Object::Untyped { watermark, .. } => Ok(*watermark),
            _ => Err(KernelError::InvalidCapability),
        }
    }

    /// Returns `true` when `vaddr` is mapped in the page directory named by `vspace`.
    #[must_use]
    pub fn page_mapped(&self, vspace: CapSel, vaddr: usize) -> bool {
        let state = self.state();
        let Ok(cap) = state.lookup_cap(vspace) else {
            return false;
        };
        match &state.objects[cap.object] {
            Object::PageDirectory { pages, .. } => pages.contains_key(&trunc_page(vaddr)),
            _ => false,
        }
    }

    /// Returns the physical address of the frame named by `sel`.
    pub fn frame_phys(&self, sel: CapSel) -> KernelResult<usize> {
        let state = self.state();
        let cap = state.lookup_cap(sel)?;
        match &state.objects[cap.object] {
            Object::Frame { phys, .. } => Ok(*phys),
            _ => Err(KernelError::InvalidCapability),
        }
    }

    /// Returns the contents of the frame named by `sel`.
    pub fn frame_contents(&self, sel: CapSel) -> KernelResult<Vec<u8>> {
        let state = self.state();
        let cap = state.lookup_cap(sel)?;
        match &state.objects[cap.object] {
            Object::Frame { data, .. } => Ok(data.clone().unwrap_or_else(|| vec![0; PAGE_SIZE])),
            _ => Err(KernelError::InvalidCapability),
        }
    }

    /// Returns `true` when the notification named by `sel` has a pending signal.
    #[must_use]
    pub fn notification_pending(&self, sel: CapSel) -> bool {
        let state = self.state();
        let Ok(cap) = state.lookup_cap(sel) else {
            return false;
        };
        matches!(state.objects[cap.object], Object::Notification { pending: true, .. })
    }

    /// Returns the number of faults queued on the endpoint named by `sel`.
    #[must_use]
    pub fn pending_faults(&self, sel: CapSel) -> usize {
        let state = self.state();
        let Ok(cap) = state.lookup_cap(sel) else {
            return 0;
        };
        match &state.objects[cap.object] {
            Object::Endpoint { queue } => queue.len(),
            _ => 0,
        }
    }

    /// Returns `true` while the caller holds an unreplied reply capability.
    #[must_use]
    pub fn reply_pending(&self) -> bool {
        self.state().caller_reply.is_some()
    }

    /// Returns the last receive path set by the caller.
    #[must_use]
    pub fn receive_path(&self) -> Option<(CapSel, usize, u8)> {
        self.state().receive_path
    }

    /// Returns the instrumented invocation log.
    #[must_use]
    pub fn call_log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    /// Clears the invocation log.
    pub fn clear_call_log(&self) {
        self.state().log.clear();
    }
}

impl Kernel for HostKernel {
    fn cnode_copy(&self, dst: SlotPath, src: SlotPath, rights: CapRights) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("cnode_copy dst=0x{:x} src=0x{:x}", dst.index, src.index));
        let (src_cnode, src_index) = state.lookup_path(src)?;
        let src_cap = state
            .slot(src_cnode, src_index)
            .cloned()
            .ok_or(KernelError::FailedLookup)?;
        state.check_derivable(&src_cap)?;
        let (dst_cnode, dst_index) = state.lookup_path(dst)?;
        if state.slot(dst_cnode, dst_index).is_some() {
            return Err(KernelError::DeleteFirst);
        }
        let mut cap = state.derive(&src_cap);
        cap.rights = src_cap.rights & rights;
        state.put(dst_cnode, dst_index, cap);
        Ok(())
    }

    fn cnode_mint(
        &self,
        dst: SlotPath,
        src: SlotPath,
        rights: CapRights,
        badge: Badge,
    ) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!(
            "cnode_mint dst=0x{:x} src=0x{:x} badge={badge}",
            dst.index, src.index
        ));
        let (src_cnode, src_index) = state.lookup_path(src)?;
        let src_cap = state
            .slot(src_cnode, src_index)
            .cloned()
            .ok_or(KernelError::FailedLookup)?;
        state.check_derivable(&src_cap)?;
        let (dst_cnode, dst_index) = state.lookup_path(dst)?;
        if state.slot(dst_cnode, dst_index).is_some() {
            return Err(KernelError::DeleteFirst);
        }
        let mut cap = state.derive(&src_cap);
        cap.rights = src_cap.rights & rights;
        if !src_cap.badge.is_valid() {
            cap.badge = badge;
        }
        state.put(dst_cnode, dst_index, cap);
        Ok(())
    }

    fn cnode_move(&self, dst: SlotPath, src: SlotPath) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("cnode_move dst=0x{:x} src=0x{:x}", dst.index, src.index));
        let (src_cnode, src_index) = state.lookup_path(src)?;
        if state.slot(src_cnode, src_index).is_none() {
            return Err(KernelError::FailedLookup);
        }
        let (dst_cnode, dst_index) = state.lookup_path(dst)?;
        if state.slot(dst_cnode, dst_index).is_some() {
            return Err(KernelError::DeleteFirst);
        }
        if let Some(cap) = state.take(src_cnode, src_index) {
            state.put(dst_cnode, dst_index, cap);
        }
        Ok(())
    }

    fn cnode_delete(&self, slot: SlotPath) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("cnode_delete 0x{:x}", slot.index));
        let (cnode, index) = state.lookup_path(slot)?;
        state.delete_cap(cnode, index);
        Ok(())
    }

    fn cnode_revoke(&self, slot: SlotPath) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("cnode_revoke 0x{:x}", slot.index));
        let (cnode, index) = state.lookup_path(slot)?;
        let Some(cap) = state.slot(cnode, index).cloned() else {
            return Ok(());
        };
        let doomed = state.slots_where(|other| state.is_ancestor(cap.id, other.id));
        for (doomed_cnode, doomed_index) in doomed {
            state.delete_cap(doomed_cnode, doomed_index);
        }
        if let Object::Untyped { watermark, .. } = &mut state.objects[cap.object] {
            *watermark = 0;
        }
        Ok(())
    }

    fn cnode_save_caller(&self, slot: SlotPath) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("cnode_save_caller 0x{:x}", slot.index));
        let (cnode, index) = state.lookup_path(slot)?;
        let Some(caller) = state.caller_reply else {
            return Ok(());
        };
        if state.slot(cnode, index).is_some() {
            return Err(KernelError::DeleteFirst);
        }
        let reply = state.add_object(Object::Reply { caller });
        let cap = state.new_cap(reply, None);
        state.put(cnode, index, cap);
        state.caller_reply = None;
        Ok(())
    }

    fn untyped_retype(
        &self,
        untyped: CapSel,
        object: ObjectType,
        size_bits: u8,
        dst_cnode: CapSel,
        dst_offset: usize,
        num_objects: usize,
    ) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!(
            "untyped_retype ut={untyped} type={} dst_offset=0x{dst_offset:x} n={num_objects}",
            object.label()
        ));
        let ut_cap = state.lookup_cap(untyped)?;
        let (phys, ut_bits, device, watermark) = match &state.objects[ut_cap.object] {
            Object::Untyped {
                phys,
                size_bits,
                device,
                watermark,
            } => (*phys, *size_bits, *device, *watermark),
            _ => return Err(KernelError::InvalidCapability),
        };
        if device && !matches!(object, ObjectType::Page | ObjectType::Untyped) {
            return Err(KernelError::InvalidArgument);
        }
        if num_objects == 0 {
            return Err(KernelError::RangeError);
        }
        if matches!(object, ObjectType::Untyped) && (size_bits < 4 || size_bits > ut_bits) {
            return Err(KernelError::RangeError);
        }
        if matches!(object, ObjectType::CNode) && size_bits == 0 {
            return Err(KernelError::RangeError);
        }
        let cnode_cap = state.lookup_cap(dst_cnode)?;
        let radix = state.radix(cnode_cap.object).ok_or(KernelError::FailedLookup)?;
        if dst_offset + num_objects > (1usize << radix) {
            return Err(KernelError::RangeError);
        }
        for slot in dst_offset..dst_offset + num_objects {
            if state.slot(cnode_cap.object, slot).is_some() {
                return Err(KernelError::DeleteFirst);
            }
        }

        let obj_bits = usize::from(object.object_size_bits(size_bits));
        let start = align_addr(watermark, obj_bits);
        let end = start + (num_objects << obj_bits);
        if end > (1usize << ut_bits) {
            return Err(KernelError::NotEnoughMemory);
        }

        for n in 0..num_objects {
            let obj_phys = phys + start + (n << obj_bits);
            let created = match object {
                ObjectType::Untyped => Object::Untyped {
                    phys: obj_phys,
                    size_bits,
                    device,
                    watermark: 0,
                },
                ObjectType::Tcb => Object::Tcb(Box::new(Tcb::new())),
                ObjectType::Endpoint => Object::Endpoint {
                    queue: VecDeque::new(),
                },
                ObjectType::Notification => Object::Notification {
                    word: 0,
                    pending: false,
                },
                ObjectType::CNode => Object::CNode {
                    radix: size_bits,
                    slots: BTreeMap::new(),
                },
                ObjectType::Page => Object::Frame {
                    phys: obj_phys,
                    data: None,
                },
                ObjectType::PageTable => Object::PageTable { mapped: false },
                ObjectType::PageDirectory => Object::PageDirectory {
                    asid: false,
                    tables: BTreeMap::new(),
                    pages: BTreeMap::new(),
                },
            };
            let id = state.add_object(created);
            let cap = state.new_cap(id, Some(ut_cap.id));
            state.put(cnode_cap.object, dst_offset + n, cap);
        }
        if let Object::Untyped { watermark, .. } = &mut state.objects[ut_cap.object] {
            *watermark = end;
        }
        Ok(())
    }

    fn page_map(
        &self,
        page: CapSel,
        vspace: CapSel,
        vaddr: usize,
        rights: CapRights,
    ) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("page_map page={page} vaddr=0x{vaddr:x} rights={rights:?}"));
        let (cnode, index) = state.locate(page)?;
        let cap = state
            .slot(cnode, index)
            .cloned()
            .ok_or(KernelError::InvalidCapability)?;
        if !matches!(state.objects[cap.object], Object::Frame { .. }) || cap.mapping.is_some() {
            return Err(KernelError::InvalidCapability);
        }
        let pd = state.page_directory(vspace)?;
        if vaddr % PAGE_SIZE != 0 {
            return Err(KernelError::AlignmentError);
        }
        if let Object::PageDirectory { tables, pages, .. } = &mut state.objects[pd] {
            if !tables.contains_key(&(vaddr >> PAGE_TABLE_SPAN_LOG2)) {
                return Err(KernelError::FailedLookup);
            }
            if pages.contains_key(&vaddr) {
                return Err(KernelError::DeleteFirst);
            }
            pages.insert(vaddr, cap.object);
        }
        if let Some(slot) = state.slot_mut(cnode, index) {
            slot.mapping = Some((pd, vaddr));
        }
        Ok(())
    }

    fn page_unmap(&self, page: CapSel) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("page_unmap page={page}"));
        let (cnode, index) = state.locate(page)?;
        let cap = state
            .slot(cnode, index)
            .cloned()
            .ok_or(KernelError::InvalidCapability)?;
        if !matches!(state.objects[cap.object], Object::Frame { .. }) {
            return Err(KernelError::InvalidCapability);
        }
        if let Some((pd, vaddr)) = cap.mapping {
            if let Object::PageDirectory { pages, .. } = &mut state.objects[pd] {
                pages.remove(&vaddr);
            }
            if let Some(slot) = state.slot_mut(cnode, index) {
                slot.mapping = None;
            }
        }
        Ok(())
    }

    fn page_table_map(&self, table: CapSel, vspace: CapSel, vaddr: usize) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("page_table_map table={table} vaddr=0x{vaddr:x}"));
        let cap = state.lookup_cap(table)?;
        match &state.objects[cap.object] {
            Object::PageTable { mapped: false } => {}
            _ => return Err(KernelError::InvalidCapability),
        }
        let pd = state.page_directory(vspace)?;
        if let Object::PageDirectory { tables, .. } = &mut state.objects[pd] {
            let key = vaddr >> PAGE_TABLE_SPAN_LOG2;
            if tables.contains_key(&key) {
                return Err(KernelError::DeleteFirst);
            }
            tables.insert(key, cap.object);
        }
        if let Object::PageTable { mapped } = &mut state.objects[cap.object] {
            *mapped = true;
        }
        Ok(())
    }

    fn asid_pool_assign(&self, pool: CapSel, vspace: CapSel) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("asid_pool_assign vspace={vspace}"));
        let pool_cap = state.lookup_cap(pool)?;
        if !matches!(state.objects[pool_cap.object], Object::Control(Control::AsidPool)) {
            return Err(KernelError::InvalidCapability);
        }
        let pd_cap = state.lookup_cap(vspace)?;
        match &mut state.objects[pd_cap.object] {
            Object::PageDirectory { asid, .. } if !*asid => {
                *asid = true;
                Ok(())
            }
            _ => Err(KernelError::InvalidCapability),
        }
    }

    fn tcb_configure(
        &self,
        tcb: CapSel,
        ipc_buffer_vaddr: usize,
        ipc_buffer_frame: CapSel,
    ) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("tcb_configure tcb={tcb} ipc=0x{ipc_buffer_vaddr:x}"));
        let thread = state.tcb(tcb)?;
        let frame = state.lookup_cap(ipc_buffer_frame)?;
        if !matches!(state.objects[frame.object], Object::Frame { .. }) {
            return Err(KernelError::InvalidCapability);
        }
        let t = state.tcb_mut(thread)?;
        t.ipc_buffer = ipc_buffer_vaddr;
        t.ipc_frame = Some(frame.object);
        Ok(())
    }

    fn tcb_set_space(
        &self,
        tcb: CapSel,
        fault_ep: CapSel,
        cspace_root: CapSel,
        cspace_data: CapData,
        vspace_root: CapSel,
        _vspace_data: CapData,
    ) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!(
            "tcb_set_space tcb={tcb} fault_ep={fault_ep} cspace={cspace_root}"
        ));
        let thread = state.tcb(tcb)?;
        let root = state.lookup_cap(cspace_root)?;
        if state.radix(root.object).is_none() {
            return Err(KernelError::InvalidCapability);
        }
        let vspace = state.page_directory(vspace_root)?;
        let mut root = state.derive(&root);
        if let CapData::Guard { guard, guard_bits } = cspace_data {
            root.guard = guard;
            root.guard_bits = guard_bits;
        }
        let t = state.tcb_mut(thread)?;
        t.fault_ep = fault_ep.value();
        t.cspace_root = Some(root);
        t.vspace = Some(vspace);
        Ok(())
    }

    fn tcb_set_priority(&self, tcb: CapSel, authority: CapSel, priority: u8) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("tcb_set_priority tcb={tcb} prio={priority}"));
        let thread = state.tcb(tcb)?;
        state.tcb(authority)?;
        state.tcb_mut(thread)?.priority = priority;
        Ok(())
    }

    fn tcb_suspend(&self, tcb: CapSel) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("tcb_suspend {tcb}"));
        let thread = state.tcb(tcb)?;
        state.tcb_mut(thread)?.status = ThreadStatus::Suspended;
        Ok(())
    }

    fn tcb_resume(&self, tcb: CapSel) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("tcb_resume {tcb}"));
        let thread = state.tcb(tcb)?;
        let t = state.tcb_mut(thread)?;
        if matches!(t.status, ThreadStatus::Inactive | ThreadStatus::Suspended) {
            t.status = ThreadStatus::Running;
        }
        Ok(())
    }

    fn tcb_read_registers(&self, tcb: CapSel, suspend_source: bool) -> KernelResult<UserContext> {
        let mut state = self.state();
        state.record(format!("tcb_read_registers {tcb}"));
        let thread = state.tcb(tcb)?;
        let t = state.tcb_mut(thread)?;
        if suspend_source {
            t.status = ThreadStatus::Suspended;
        }
        Ok(t.regs)
    }

    fn tcb_write_registers(
        &self,
        tcb: CapSel,
        resume_target: bool,
        regs: &UserContext,
    ) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!(
            "tcb_write_registers {tcb} pc=0x{:x} sp=0x{:x}",
            regs.pc, regs.sp
        ));
        let thread = state.tcb(tcb)?;
        let t = state.tcb_mut(thread)?;
        t.regs = *regs;
        if resume_target {
            t.status = ThreadStatus::Running;
        }
        Ok(())
    }

    fn signal(&self, notification: CapSel) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("signal {notification}"));
        let cap = state.lookup_cap(notification)?;
        match &mut state.objects[cap.object] {
            Object::Notification { word, pending } => {
                *word |= cap.badge.value();
                *pending = true;
                Ok(())
            }
            _ => Err(KernelError::InvalidCapability),
        }
    }

    fn wait(&self, notification: CapSel) -> KernelResult<Badge> {
        let mut state = self.state();
        state.record(format!("wait {notification}"));
        let cap = state.lookup_cap(notification)?;
        match &mut state.objects[cap.object] {
            Object::Notification { word, pending } if *pending => {
                let badge = Badge::new(*word);
                *word = 0;
                *pending = false;
                Ok(badge)
            }
            Object::Notification { .. } => Err(KernelError::IllegalOperation),
            _ => Err(KernelError::InvalidCapability),
        }
    }

    fn send(&self, dst: CapSel, _info: MessageInfo) -> KernelResult<()> {
        let mut state = self.state();
        state.record(format!("send {dst}"));
        let (cnode, index) = state.locate(dst)?;
        let cap = state
            .slot(cnode, index)
            .cloned()
            .ok_or(KernelError::InvalidCapability)?;
        match &mut state.objects[cap.object] {
            Object::Reply { caller } => {
                let caller = *caller;
                state.resume(caller);
                state.delete_cap(cnode, index);
                Ok(())
            }
            Object::Notification { word, pending } => {
                *word |= cap.badge.value();
                *pending = true;
                Ok(())
            }
            _ => Err(KernelError::IllegalOperation),
        }
    }

    fn recv(&self, endpoint: CapSel) -> KernelResult<(MessageInfo, Badge)> {
        let mut state = self.state();
        state.record(format!("recv {endpoint}"));
        let cap = state.lookup_cap(endpoint)?;
        let fault = match &mut state.objects[cap.object] {
            Object::Endpoint { queue } => queue.pop_front().ok_or(KernelError::IllegalOperation)?,
            _ => return Err(KernelError::InvalidCapability),
        };
        state.mrs = fault.mrs;
        state.caller_reply = Some(fault.sender);
        Ok((
            MessageInfo::new(VM_FAULT_LABEL, 0, 0, VM_FAULT_LENGTH),
            fault.badge,
        ))
    }

    fn reply_recv(&self, endpoint: CapSel, _reply: MessageInfo) -> KernelResult<(MessageInfo, Badge)> {
        {
            let mut state = self.state();
            state.record(format!("reply {endpoint}"));
            if let Some(caller) = state.caller_reply.take() {
                state.resume(caller);
            }
        }
        self.recv(endpoint)
    }

    fn get_mr(&self, index: usize) -> usize {
        self.state().mrs.get(index).copied().unwrap_or(0)
    }

    fn set_cap_receive_path(&self, root: CapSel, index: usize, depth: u8) {
        let mut state = self.state();
        state.record(format!("set_cap_receive_path root={root} index=0x{index:x}"));
        state.receive_path = Some((root, index, depth));
    }

    fn write_mapped(&self, vaddr: usize, bytes: &[u8]) -> KernelResult<()> {
        let mut state = self.state();
        let mut done = 0;
        while done < bytes.len() {
            let addr = vaddr + done;
            let frame = state.frame_at(addr)?;
            let offset = addr - trunc_page(addr);
            let chunk = (PAGE_SIZE - offset).min(bytes.len() - done);
            if let Object::Frame { data, .. } = &mut state.objects[frame] {
                let page = data.get_or_insert_with(|| vec![0; PAGE_SIZE]);
                page[offset..offset + chunk].copy_from_slice(&bytes[done..done + chunk]);
            }
            done += chunk;
        }
        Ok(())
    }

    fn read_mapped(&self, vaddr: usize, buf: &mut [u8]) -> KernelResult<()> {
        let state = self.state();
        let mut done = 0;
        while done < buf.len() {
            let addr = vaddr + done;
            let frame = state.frame_at(addr)?;
            let offset = addr - trunc_page(addr);
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            match &state.objects[frame] {
                Object::Frame { data: Some(page), .. } => {
                    buf[done..done + chunk].copy_from_slice(&page[offset..offset + chunk]);
                }
                _ => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot() -> (HostKernel, BootInfo) {
        HostKernel::boot(&HostBootConfig {
            init_cnode_size_bits: 12,
            untyped: vec![UntypedDesc {
                paddr: 0x8000_0000,
                size_bits: 20,
                is_device: false,
            }],
            prog_img_beg: 0x0040_0000,
            image: vec![0xab; 3 * PAGE_SIZE],
            image_phys: 0x0010_0000,
            extra_len: 0,
        })
    }

    fn init(index: usize) -> SlotPath {
        SlotPath::new(CapSel::new(INIT_THREAD_CNODE), index, WORD_BITS)
    }

    #[test]
    fn boot_info_lays_out_regions_after_initial_caps() {
        let (_kernel, bi) = boot();
        assert_eq!(bi.user_image_paging.start, NUM_INITIAL_CAPS);
        assert_eq!(bi.user_image_frames.len(), 3);
        assert_eq!(bi.untyped.len(), 1);
        assert_eq!(bi.empty.end, 1 << 12);
        assert_eq!(bi.ipc_buffer, 0x0040_0000 + 3 * PAGE_SIZE);
    }

    #[test]
    fn irq_control_cannot_be_copied_but_can_be_moved() {
        let (kernel, bi) = boot();
        let dst = bi.empty.start;
        assert_eq!(
            kernel.cnode_copy(init(dst), init(IRQ_CONTROL), CapRights::all()),
            Err(KernelError::IllegalOperation)
        );
        kernel.cnode_move(init(dst), init(IRQ_CONTROL)).expect("move");
        assert!(!kernel.slot_occupied(CapSel::new(IRQ_CONTROL)));
        assert!(kernel.slot_occupied(CapSel::new(dst)));
    }

    #[test]
    fn retyped_untyped_refuses_derivation() {
        let (kernel, bi) = boot();
        let ut = CapSel::new(bi.untyped.start);
        kernel
            .untyped_retype(ut, ObjectType::Endpoint, 0, CapSel::new(INIT_THREAD_CNODE), bi.empty.start, 1)
            .expect("retype");
        assert_eq!(kernel.untyped_watermark(ut), Ok(16));
        assert_eq!(
            kernel.cnode_copy(init(bi.empty.start + 1), init(bi.untyped.start), CapRights::all()),
            Err(KernelError::RevokeFirst)
        );
    }

    #[test]
    fn revoke_resets_untyped_watermark() {
        let (kernel, bi) = boot();
        let ut = CapSel::new(bi.untyped.start);
        let dst = bi.empty.start;
        kernel
            .untyped_retype(ut, ObjectType::Page, 0, CapSel::new(INIT_THREAD_CNODE), dst, 2)
            .expect("retype");
        kernel.cnode_revoke(init(bi.untyped.start)).expect("revoke");
        assert!(!kernel.slot_occupied(CapSel::new(dst)));
        assert_eq!(kernel.untyped_watermark(ut), Ok(0));
    }

    #[test]
    fn notification_delivers_minted_badge() {
        let (kernel, bi) = boot();
        let ut = CapSel::new(bi.untyped.start);
        let slot = bi.empty.start;
        kernel
            .untyped_retype(ut, ObjectType::Notification, 0, CapSel::new(INIT_THREAD_CNODE), slot, 1)
            .expect("retype");
        kernel
            .cnode_mint(init(slot + 1), init(slot), CapRights::all(), Badge::new(0x40))
            .expect("mint");
        kernel.signal(CapSel::new(slot + 1)).expect("signal");
        assert_eq!(kernel.wait(CapSel::new(slot + 1)), Ok(Badge::new(0x40)));
        assert_eq!(kernel.wait(CapSel::new(slot)), Err(KernelError::IllegalOperation));
    }

    #[test]
    fn mapped_memory_reads_back_image_bytes() {
        let (kernel, _bi) = boot();
        let mut buf = [0u8; 4];
        kernel.read_mapped(0x0040_0ffe, &mut buf).expect("read");
        assert_eq!(buf, [0xab; 4]);
        kernel.write_mapped(0x0040_0ffe, &[1, 2, 3, 4]).expect("write");
        kernel.read_mapped(0x0040_0ffe, &mut buf).expect("read");
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
