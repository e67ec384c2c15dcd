// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Per-thread pager state addressed by fault badge.
// Author: Lukas Bower

use core::fmt;

use heapless::String;

use crate::cspace::{Cnode, CnodeIndex};
use crate::env::CoreEnv;
use crate::pager::{FaultHandler, FaultResolution, IpcPager, PagerError};
use crate::sel4::{Badge, CapSel, MessageInfo, INIT_THREAD_CNODE, WORD_BITS};
use crate::vm_space::{bounded, LABEL_LEN};

/// Maximum length of a thread name.
pub const NAME_LEN: usize = 32;

/// Pager state of one faulting thread.
pub struct PagerObject {
    env: CoreEnv,
    badge: Badge,
    cpu_session: CapSel,
    thread: CapSel,
    reply_cap: CapSel,
    pd_label: String<LABEL_LEN>,
    name: String<NAME_LEN>,
    unresolved_page_fault: bool,
    cap: Option<CapSel>,
    handler: Box<dyn FaultHandler + Send>,
}

impl PagerObject {
    /// Creates a pager object identified by `badge`; its reply selector is
    /// allocated from the core CNode.
    pub fn new(
        env: &CoreEnv,
        cpu_session: CapSel,
        thread: CapSel,
        badge: Badge,
        pd_label: &str,
        name: &str,
        handler: Box<dyn FaultHandler + Send>,
    ) -> Result<Self, PagerError> {
        if !badge.is_valid() {
            return Err(PagerError::InvalidBadge);
        }
        let reply_cap = env.alloc_sel()?;
        Ok(Self {
            env: env.clone(),
            badge,
            cpu_session,
            thread,
            reply_cap,
            pd_label: bounded(pd_label),
            name: bounded(name),
            unresolved_page_fault: false,
            cap: None,
            handler,
        })
    }

    /// Lets the fault handler serve the fault currently held by `pager`.
    pub fn pager(&mut self, pager: &mut IpcPager) -> FaultResolution {
        self.handler.pager(pager)
    }

    /// Resumes the thread whose fault reply was saved into the reply selector.
    pub fn wake_up(&self) {
        if let Err(err) = self
            .env
            .kernel()
            .send(self.reply_cap, MessageInfo::new(0, 0, 0, 0))
        {
            log::error!("[pager] waking up {self} failed: {err}");
        }
    }

    /// Records that a fault of this thread could not be resolved.
    pub fn unresolved_page_fault_occurred(&mut self) {
        self.unresolved_page_fault = true;
    }

    /// Returns `true` once an unresolved fault was recorded.
    #[must_use]
    pub fn has_unresolved_page_fault(&self) -> bool {
        self.unresolved_page_fault
    }

    /// Dispatch badge.
    #[must_use]
    pub fn badge(&self) -> Badge {
        self.badge
    }

    /// Selector receiving the saved reply capability of a deferred fault.
    #[must_use]
    pub fn reply_cap_sel(&self) -> CapSel {
        self.reply_cap
    }

    /// Badged endpoint selector installed by [`crate::pager::PagerEntrypoint::manage`].
    #[must_use]
    pub fn cap(&self) -> Option<CapSel> {
        self.cap
    }

    pub(crate) fn set_cap(&mut self, cap: CapSel) {
        self.cap = Some(cap);
    }

    /// CPU session the thread belongs to.
    #[must_use]
    pub fn cpu_session(&self) -> CapSel {
        self.cpu_session
    }

    /// Thread capability.
    #[must_use]
    pub fn thread(&self) -> CapSel {
        self.thread
    }

    /// Label of the thread's protection domain.
    #[must_use]
    pub fn pd_label(&self) -> &str {
        &self.pd_label
    }

    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for PagerObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pager_object: pd='{}' thread='{}'", self.pd_label, self.name)
    }
}

impl Drop for PagerObject {
    fn drop(&mut self) {
        let kernel = self.env.kernel();
        let core = self.env.core_cnode();
        if let Some(cap) = self.cap.take() {
            if let Err(err) = core.revoke(kernel, CnodeIndex::from(cap)) {
                log::error!("[pager] revoking {cap} of {self}: {err}");
            }
            if let Err(err) = core.remove(kernel, CnodeIndex::from(cap)) {
                log::error!("[pager] deleting {cap} of {self}: {err}");
            }
            self.env.free_sel(cap);
        }
        let root = Cnode::new(CapSel::new(INIT_THREAD_CNODE), WORD_BITS);
        if let Err(err) = root.remove(kernel, CnodeIndex::from(self.reply_cap)) {
            log::error!("[pager] deleting reply cap of {self}: {err}");
        }
        self.env.free_sel(self.reply_cap);
        self.reply_cap = CapSel::NULL;
    }
}
