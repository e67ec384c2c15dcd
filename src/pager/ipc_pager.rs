// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Request/reply protocol of one in-flight page fault.
// Author: Lukas Bower

//! IPC side of the pager.
//!
//! [`IpcPager`] holds exactly one fault transaction at a time. A fault is
//! either answered by the combined reply+receive of
//! [`IpcPager::reply_and_wait_for_fault`] or deferred through
//! [`IpcPager::reply_save_caller`], in which case the next
//! [`IpcPager::wait_for_fault`] parks the caller's reply capability in the
//! selected slot before blocking again.

use core::fmt;

use crate::cspace::{Cnode, CnodeIndex};
use crate::env::CoreEnv;
use crate::pager::{FaultInfo, Mapping, PagerError};
use crate::sel4::{Badge, CapSel, MessageInfo, INIT_THREAD_CNODE, VM_FAULT_LABEL, WORD_BITS};

/// Progress of the current fault transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagerState {
    /// No fault is held.
    Idle,
    /// A fault was received and awaits its reply.
    FaultReceived,
    /// The reply is deferred; the caller's reply capability will be saved.
    Deferred,
}

impl fmt::Display for PagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::FaultReceived => "fault-received",
            Self::Deferred => "deferred",
        })
    }
}

/// Page-fault IPC state of one pager entrypoint.
pub struct IpcPager {
    env: CoreEnv,
    ep_sel: CapSel,
    last: Badge,
    reply_sel: CapSel,
    fault: FaultInfo,
    reply_mapping: Option<Mapping>,
    state: PagerState,
}

impl IpcPager {
    /// Creates a pager receiving faults on the endpoint `ep_sel`.
    #[must_use]
    pub fn new(env: CoreEnv, ep_sel: CapSel) -> Self {
        Self {
            env,
            ep_sel,
            last: Badge::INVALID,
            reply_sel: CapSel::NULL,
            fault: FaultInfo::default(),
            reply_mapping: None,
            state: PagerState::Idle,
        }
    }

    /// Waits for a fault without replying to the previous one.
    ///
    /// A deferred fault's reply capability is saved into the selector given to
    /// [`IpcPager::reply_save_caller`] first.
    pub fn wait_for_fault(&mut self) -> Result<(), PagerError> {
        if self.last.is_valid() && !self.reply_sel.is_null() {
            let root = Cnode::new(CapSel::new(INIT_THREAD_CNODE), WORD_BITS);
            if let Err(err) = root.save_caller(self.env.kernel(), CnodeIndex::from(self.reply_sel)) {
                log::error!("[pager] saving reply cap into {} failed: {err}", self.reply_sel);
            }
        }
        self.reply_sel = CapSel::NULL;
        self.last = Badge::INVALID;
        self.reply_mapping = None;
        self.state = PagerState::Idle;
        self.reply_and_wait_for_fault()
    }

    /// Installs the pending reply mapping, replies to the current fault and
    /// waits for the next one.
    pub fn reply_and_wait_for_fault(&mut self) -> Result<(), PagerError> {
        let replying = self.last.is_valid();
        if replying {
            if let Some(mapping) = self.reply_mapping.take() {
                match self.env.threads().install_mapping(&mapping, self.last) {
                    Ok(0) => log::warn!(
                        "[pager] no thread with pager badge {} for mapping at 0x{:x}",
                        self.last,
                        mapping.to_virt
                    ),
                    Ok(_) => {}
                    Err(err) => log::error!("[pager] installing mapping for {}: {err}", self.last),
                }
            }
        }

        let kernel = self.env.kernel();
        let received = if replying {
            kernel.reply_recv(self.ep_sel, MessageInfo::new(0, 0, 0, 0))
        } else {
            kernel.recv(self.ep_sel)
        };
        let (info, badge) = match received {
            Ok(received) => received,
            Err(err) => {
                self.last = Badge::INVALID;
                self.state = PagerState::Idle;
                return Err(err.into());
            }
        };
        if info.label() != VM_FAULT_LABEL {
            log::debug!("[pager] message label {} from {badge} is not a VM fault", info.label());
        }

        self.fault = FaultInfo::from_message_registers(kernel);
        self.last = badge;
        self.state = PagerState::FaultReceived;
        log::trace!(
            "[pager] fault from {badge} ip=0x{:x} addr=0x{:x} write={}",
            self.fault.ip,
            self.fault.addr,
            self.fault.write
        );
        Ok(())
    }

    /// Sets the mapping installed before the next reply.
    pub fn set_reply_mapping(&mut self, mapping: Mapping) {
        self.reply_mapping = Some(mapping);
    }

    /// Defers the reply to the current fault: the next
    /// [`IpcPager::wait_for_fault`] saves the caller's reply capability at `sel`.
    pub fn reply_save_caller(&mut self, sel: CapSel) {
        self.reply_sel = sel;
        self.state = PagerState::Deferred;
    }

    /// Badge of the thread that raised the current fault.
    #[must_use]
    pub fn badge(&self) -> Badge {
        self.last
    }

    /// Instruction pointer of the current fault.
    #[must_use]
    pub fn fault_ip(&self) -> usize {
        self.fault.ip
    }

    /// Address of the current fault.
    #[must_use]
    pub fn fault_addr(&self) -> usize {
        self.fault.addr
    }

    /// Returns `true` if the current fault is a write access.
    #[must_use]
    pub fn write_fault(&self) -> bool {
        self.fault.write
    }

    /// Decoded current fault.
    #[must_use]
    pub fn fault(&self) -> FaultInfo {
        self.fault
    }

    /// Mapping queued for the next reply.
    #[must_use]
    pub fn reply_mapping(&self) -> Option<&Mapping> {
        self.reply_mapping.as_ref()
    }

    /// Progress of the current fault transaction.
    #[must_use]
    pub fn state(&self) -> PagerState {
        self.state
    }

    /// Endpoint faults are received on.
    #[must_use]
    pub fn endpoint(&self) -> CapSel {
        self.ep_sel
    }
}
