// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Lifecycle of a thread created by core on behalf of a protection domain.
// Author: Lukas Bower

//! Platform threads.
//!
//! A thread moves through [`Lifecycle::Created`], [`Lifecycle::Bound`] and
//! [`Lifecycle::Started`]; a started thread may be paused and resumed. Its
//! pager-object selector doubles as the badge the pager dispatches its faults
//! by, see [`PlatformThread::pager_object_badge`].

use std::sync::{Arc, Weak};

use heapless::String;

use crate::cspace::{Cnode, CnodeIndex};
use crate::env::CoreEnv;
use crate::pager::{Mapping, PagerObject};
use crate::pd::{Pd, ThreadSels};
use crate::sel4::{
    Badge, CapData, CapSel, UserContext, INIT_THREAD_CNODE, PAGE_SIZE, PAGE_SIZE_LOG2, WORD_BITS,
};
use crate::thread::{
    ThreadError, ThreadInfo, INITIAL_IPC_BUFFER_VIRT, UTCB_EP_SEL_OFFSET, UTCB_LOCK_SEL_OFFSET,
};
use crate::vm_space::bounded;

/// Maximum length of a thread name.
pub const THREAD_NAME_LEN: usize = 32;

/// Lifecycle of a [`PlatformThread`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Kernel objects exist; the thread has no address space yet.
    Created,
    /// The thread is bound to a protection domain.
    Bound,
    /// The thread runs.
    Started,
    /// The thread was suspended after being started.
    Paused,
}

/// Register state of a thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadState {
    /// Instruction pointer.
    pub ip: usize,
    /// Stack pointer.
    pub sp: usize,
    /// Program status register.
    pub cpsr: usize,
    /// General-purpose registers r0..=r12.
    pub r: [usize; 13],
}

impl From<UserContext> for ThreadState {
    fn from(regs: UserContext) -> Self {
        Self {
            ip: regs.pc,
            sp: regs.sp,
            cpsr: regs.cpsr,
            r: regs.r,
        }
    }
}

/// Thread created by core.
pub struct PlatformThread {
    env: CoreEnv,
    name: String<THREAD_NAME_LEN>,
    utcb: usize,
    info: Option<ThreadInfo>,
    pager_obj_sel: CapSel,
    pd: Option<Arc<Pd>>,
    sels: Option<ThreadSels>,
    pager_cap: Option<CapSel>,
    lifecycle: Lifecycle,
}

impl PlatformThread {
    /// Creates the kernel objects of a thread and lists it in the thread
    /// registry. A `utcb` of zero places the IPC buffer at
    /// [`INITIAL_IPC_BUFFER_VIRT`].
    pub fn new(env: &CoreEnv, name: &str, priority: u8, utcb: usize) -> Result<Self, ThreadError> {
        let pager_obj_sel = env.alloc_sel()?;
        let utcb = if utcb == 0 { INITIAL_IPC_BUFFER_VIRT } else { utcb };
        let info = match ThreadInfo::init(env, utcb, priority) {
            Ok(info) => info,
            Err(err) => {
                env.free_sel(pager_obj_sel);
                return Err(err);
            }
        };
        let thread = Self {
            env: env.clone(),
            name: bounded(name),
            utcb,
            info: Some(info),
            pager_obj_sel,
            pd: None,
            sels: None,
            pager_cap: None,
            lifecycle: Lifecycle::Created,
        };
        env.threads().insert(thread.pager_object_badge())?;
        log::debug!("[thread:{}] created, pager badge {}", thread.name, pager_obj_sel);
        Ok(thread)
    }

    fn info(&self) -> Result<&ThreadInfo, ThreadError> {
        self.info.as_ref().ok_or(ThreadError::StateAccessFailed)
    }

    /// Binds the thread to `pd`: reserves its selectors there and maps its IPC buffer.
    pub fn bind_to_pd(&mut self, pd: &Arc<Pd>) -> Result<(), ThreadError> {
        if self.pd.is_some() {
            return Err(ThreadError::AlreadyBound);
        }
        let ipc_buffer_phys = self.info()?.ipc_buffer_phys;
        let sels = pd.bind_thread(self.utcb, ipc_buffer_phys)?;
        if let Err(err) = self.env.threads().bind(self.pager_object_badge(), pd) {
            pd.unbind_thread(sels, self.utcb);
            return Err(err);
        }
        self.pd = Some(Arc::clone(pd));
        self.sels = Some(sels);
        self.lifecycle = Lifecycle::Bound;
        log::debug!("[thread:{}] bound to pd '{}'", self.name, pd.label());
        Ok(())
    }

    /// Selects the pager object serving the thread's page faults. The object
    /// must already be managed by a pager entrypoint.
    pub fn set_pager(&mut self, pager: &PagerObject) -> Result<(), ThreadError> {
        let cap = pager.cap().ok_or(ThreadError::PagerNotManaged)?;
        self.pager_cap = Some(cap);
        Ok(())
    }

    /// Starts the thread at `ip` with stack pointer `sp`.
    ///
    /// # Panics
    ///
    /// Panics if the thread is not bound to a PD or has no pager.
    pub fn start(&mut self, ip: usize, sp: usize) -> Result<(), ThreadError> {
        assert!(self.pd.is_some(), "starting unbound thread '{}'", self.name);
        assert!(self.pager_cap.is_some(), "starting thread '{}' without pager", self.name);
        let (Some(pd), Some(sels), Some(pager_cap)) = (self.pd.as_ref(), self.sels, self.pager_cap)
        else {
            return Err(ThreadError::NotBound);
        };
        let info = self.info.as_ref().ok_or(ThreadError::StateAccessFailed)?;
        let kernel = self.env.kernel();
        let core = self.env.core_cnode();

        pd.cspace_cnode().copy_to(
            kernel,
            &core,
            CnodeIndex::from(pager_cap),
            CnodeIndex::from(sels.fault_handler),
        )?;
        pd.cspace_cnode().copy_to(
            kernel,
            &core,
            CnodeIndex::from(info.ep.sel),
            CnodeIndex::from(sels.ep),
        )?;
        pd.cspace_cnode().mint(
            kernel,
            &core,
            CnodeIndex::from(info.lock.sel),
            CnodeIndex::from(sels.lock),
        )?;

        prepopulate_ipc_buffer(&self.env, info.ipc_buffer_phys, sels.ep, sels.lock)?;

        let guard = CapData::guard(0, WORD_BITS - pd.cspace_size_log2());
        kernel.tcb_set_space(
            info.tcb.sel,
            sels.fault_handler,
            pd.cspace_sel(),
            guard,
            pd.page_directory_sel(),
            CapData::Null,
        )?;

        let regs = UserContext {
            pc: ip,
            sp,
            ..UserContext::default()
        };
        kernel.tcb_write_registers(info.tcb.sel, false, &regs)?;
        kernel.tcb_resume(info.tcb.sel)?;
        log::info!(
            "[thread:{}] started ip=0x{ip:x} sp=0x{sp:x} in pd '{}'",
            self.name,
            pd.label()
        );
        self.lifecycle = Lifecycle::Started;
        Ok(())
    }

    /// Suspends the thread.
    pub fn pause(&mut self) {
        let Some(info) = self.info.as_ref() else {
            return;
        };
        match self.env.kernel().tcb_suspend(info.tcb.sel) {
            Ok(()) => {
                if self.lifecycle == Lifecycle::Started {
                    self.lifecycle = Lifecycle::Paused;
                }
            }
            Err(err) => log::error!("[thread:{}] pausing failed: {err}", self.name),
        }
    }

    /// Resumes a paused thread.
    pub fn resume(&mut self) {
        let Some(info) = self.info.as_ref() else {
            return;
        };
        match self.env.kernel().tcb_resume(info.tcb.sel) {
            Ok(()) => {
                if self.lifecycle == Lifecycle::Paused {
                    self.lifecycle = Lifecycle::Started;
                }
            }
            Err(err) => log::error!("[thread:{}] resuming failed: {err}", self.name),
        }
    }

    /// Reads the thread's register state without suspending it.
    pub fn state(&self) -> Result<ThreadState, ThreadError> {
        let info = self.info()?;
        match self.env.kernel().tcb_read_registers(info.tcb.sel, false) {
            Ok(regs) => Ok(regs.into()),
            Err(err) => {
                log::error!("[thread:{}] reading thread state: {err}", self.name);
                Err(ThreadError::StateAccessFailed)
            }
        }
    }

    /// Writing the register state is not supported.
    pub fn set_state(&mut self, _state: ThreadState) -> Result<(), ThreadError> {
        log::warn!("[thread:{}] set_state not implemented", self.name);
        Err(ThreadError::StateAccessFailed)
    }

    /// Wakes the thread if it blocks on its lock.
    pub fn cancel_blocking(&self) {
        let Some(info) = self.info.as_ref() else {
            return;
        };
        if let Err(err) = self.env.kernel().signal(info.lock.sel) {
            log::error!("[thread:{}] cancel_blocking: {err}", self.name);
        }
    }

    /// Address space the thread is bound to.
    #[must_use]
    pub fn address_space(&self) -> Option<Weak<Pd>> {
        self.pd.as_ref().map(Arc::downgrade)
    }

    /// Installs `mapping` in the thread's address space.
    pub fn install_mapping(&self, mapping: &Mapping) -> Result<(), ThreadError> {
        let pd = self.pd.as_ref().ok_or(ThreadError::NotBound)?;
        pd.install_mapping(mapping)?;
        Ok(())
    }

    /// Badge of the pager object serving this thread.
    #[must_use]
    pub fn pager_object_badge(&self) -> Badge {
        Badge::new(self.pager_obj_sel.value())
    }

    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Virtual address of the IPC buffer.
    #[must_use]
    pub fn utcb(&self) -> usize {
        self.utcb
    }

    /// Current lifecycle stage.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Core selector of the TCB.
    #[must_use]
    pub fn tcb_sel(&self) -> CapSel {
        self.info.as_ref().map_or(CapSel::NULL, |info| info.tcb.sel)
    }

    /// Physical page holding the IPC buffer.
    #[must_use]
    pub fn ipc_buffer_phys(&self) -> usize {
        self.info.as_ref().map_or(0, |info| info.ipc_buffer_phys)
    }

    /// Selectors occupied in the PD's CSpace.
    #[must_use]
    pub fn pd_sels(&self) -> Option<ThreadSels> {
        self.sels
    }
}

/// Writes the endpoint and lock selectors into the IPC buffer at
/// `ipc_buffer_phys` through a temporary core mapping.
fn prepopulate_ipc_buffer(
    env: &CoreEnv,
    ipc_buffer_phys: usize,
    ep: CapSel,
    lock: CapSel,
) -> Result<(), ThreadError> {
    let virt = env.virt_alloc()?.alloc_aligned(PAGE_SIZE, PAGE_SIZE_LOG2)?;
    let result = (|| -> Result<(), ThreadError> {
        env.map_local(ipc_buffer_phys, virt, 1)?;
        let mut words = [0u8; 2 * core::mem::size_of::<usize>()];
        let word = core::mem::size_of::<usize>();
        words[UTCB_EP_SEL_OFFSET..UTCB_EP_SEL_OFFSET + word]
            .copy_from_slice(&ep.value().to_le_bytes());
        words[UTCB_LOCK_SEL_OFFSET..UTCB_LOCK_SEL_OFFSET + word]
            .copy_from_slice(&lock.value().to_le_bytes());
        let written = env.kernel().write_mapped(virt, &words);
        env.unmap_local(virt, 1)?;
        written?;
        Ok(())
    })();
    if let Err(err) = env.virt_alloc().and_then(|mut alloc| alloc.free(virt)) {
        log::error!("[thread] releasing core range 0x{virt:x}: {err}");
    }
    result
}

impl Drop for PlatformThread {
    fn drop(&mut self) {
        let kernel = self.env.kernel();
        let tcb = self.tcb_sel();
        if let (Some(pd), Some(sels)) = (self.pd.as_ref(), self.sels.take()) {
            if let Err(err) = kernel.tcb_suspend(tcb) {
                log::error!("[thread:{}] suspending {tcb}: {err}", self.name);
            }
            pd.unbind_thread(sels, self.utcb);
        }

        let root = Cnode::new(CapSel::new(INIT_THREAD_CNODE), WORD_BITS);
        if let Some(pager_cap) = self.pager_cap.take() {
            if let Err(err) = root.revoke(kernel, CnodeIndex::from(pager_cap)) {
                log::error!("[thread:{}] revoking pager cap {pager_cap}: {err}", self.name);
            }
        }
        if let Some(info) = self.info.take() {
            for sel in [info.lock.sel, info.ep.sel] {
                if let Err(err) = root.revoke(kernel, CnodeIndex::from(sel)) {
                    log::error!("[thread:{}] revoking {sel}: {err}", self.name);
                }
            }
            info.destruct(&self.env);
        }

        self.env.threads().remove(self.pager_object_badge());
        self.env.free_sel(self.pager_obj_sel);
        log::debug!("[thread:{}] destroyed", self.name);
    }
}
