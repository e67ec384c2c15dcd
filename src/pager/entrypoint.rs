// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Pager entrypoint dispatching page faults to pager objects by badge.
// Author: Lukas Bower

//! Pager entrypoint.
//!
//! One blocking loop serves every managed [`PagerObject`]. The badge
//! delivered with a fault is the only dispatch key; badges are unique per
//! entrypoint.

use std::collections::HashMap;

use crate::cspace::CnodeIndex;
use crate::env::CoreEnv;
use crate::kobj::{self, KernelObject};
use crate::pager::{FaultResolution, IpcPager, PagerError, PagerObject, PagerState};
use crate::sel4::{Badge, CapSel, ObjectType};

/// Outcome of one pass of the dispatch loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// The fault was resolved; the next pass replies to it.
    Resolved(Badge),
    /// The fault stays unresolved; its reply capability is saved on the next pass.
    Unresolved(Badge),
    /// No pager object carries the badge; the fault was dropped.
    Dropped(Badge),
}

/// Entrypoint serving page faults.
pub struct PagerEntrypoint {
    env: CoreEnv,
    endpoint: KernelObject,
    pager: IpcPager,
    objects: HashMap<Badge, PagerObject>,
    reply_pending: bool,
}

impl PagerEntrypoint {
    /// Creates the entrypoint together with its fault endpoint.
    pub fn new(env: &CoreEnv) -> Result<Self, PagerError> {
        let endpoint = kobj::create(env, ObjectType::Endpoint, 0)?;
        log::info!("[pager] entrypoint endpoint at {}", endpoint.sel);
        Ok(Self {
            env: env.clone(),
            pager: IpcPager::new(env.clone(), endpoint.sel),
            endpoint,
            objects: HashMap::new(),
            reply_pending: false,
        })
    }

    /// Endpoint faults are delivered to.
    #[must_use]
    pub fn endpoint_sel(&self) -> CapSel {
        self.endpoint.sel
    }

    /// Makes `obj` dispatchable: mints an endpoint capability badged with the
    /// object's badge and returns its selector.
    pub fn manage(&mut self, mut obj: PagerObject) -> Result<CapSel, PagerError> {
        let badge = obj.badge();
        if self.objects.contains_key(&badge) {
            return Err(PagerError::DuplicateBadge(badge));
        }
        let sel = self.env.alloc_sel()?;
        let core = self.env.core_cnode();
        if let Err(err) = core.mint_badged(
            self.env.kernel(),
            &core,
            CnodeIndex::from(self.endpoint.sel),
            CnodeIndex::from(sel),
            badge,
        ) {
            self.env.free_sel(sel);
            return Err(err.into());
        }
        obj.set_cap(sel);
        log::debug!("[pager] managing {obj} badge={badge} cap={sel}");
        self.objects.insert(badge, obj);
        Ok(sel)
    }

    /// Removes the pager object with `badge` from dispatch and hands it back.
    pub fn dissolve(&mut self, badge: Badge) -> Option<PagerObject> {
        let obj = self.objects.remove(&badge);
        if let Some(obj) = &obj {
            log::debug!("[pager] dissolving {obj}");
        }
        obj
    }

    /// Pager object managed under `badge`.
    #[must_use]
    pub fn lookup(&self, badge: Badge) -> Option<&PagerObject> {
        self.objects.get(&badge)
    }

    /// Mutable access to the pager object managed under `badge`.
    pub fn lookup_mut(&mut self, badge: Badge) -> Option<&mut PagerObject> {
        self.objects.get_mut(&badge)
    }

    /// Number of managed pager objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` when no pager object is managed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// IPC state of the entrypoint.
    #[must_use]
    pub fn ipc_pager(&self) -> &IpcPager {
        &self.pager
    }

    /// Returns `true` when the next pass replies to a resolved fault.
    #[must_use]
    pub fn reply_pending(&self) -> bool {
        self.reply_pending
    }

    /// Runs one pass of the dispatch loop: receive a fault (replying to the
    /// previous one if it was resolved) and dispatch it by badge.
    pub fn serve_one(&mut self) -> Result<Dispatch, PagerError> {
        if std::mem::take(&mut self.reply_pending) {
            self.pager.reply_and_wait_for_fault()?;
        } else {
            self.pager.wait_for_fault()?;
        }

        let badge = self.pager.badge();
        let Some(obj) = self.objects.get_mut(&badge) else {
            log::debug!(
                "[pager] dropping fault with unknown badge {badge} addr=0x{:x}",
                self.pager.fault_addr()
            );
            return Ok(Dispatch::Dropped(badge));
        };

        match obj.pager(&mut self.pager) {
            FaultResolution::Resolved => {
                self.reply_pending = true;
                Ok(Dispatch::Resolved(badge))
            }
            FaultResolution::Unresolved => {
                log::warn!(
                    "[pager] page-fault, {obj} ip=0x{:x} pf-addr=0x{:x}",
                    self.pager.fault_ip(),
                    self.pager.fault_addr()
                );
                obj.unresolved_page_fault_occurred();
                self.pager.reply_save_caller(obj.reply_cap_sel());
                debug_assert_eq!(self.pager.state(), PagerState::Deferred);
                Ok(Dispatch::Unresolved(badge))
            }
        }
    }

    /// Serves faults until receiving from the endpoint fails and returns that error.
    pub fn entry(&mut self) -> PagerError {
        loop {
            match self.serve_one() {
                Ok(dispatch) => log::trace!("[pager] {dispatch:?}"),
                Err(err @ PagerError::Kernel(_)) => {
                    log::info!("[pager] entrypoint leaving: {err}");
                    return err;
                }
                Err(err) => log::error!("[pager] {err}"),
            }
        }
    }
}

impl Drop for PagerEntrypoint {
    fn drop(&mut self) {
        self.objects.clear();
        if let Err(err) = kobj::destroy(&self.env, self.endpoint) {
            log::error!("[pager] destroying endpoint {}: {err}", self.endpoint.sel);
        }
    }
}
