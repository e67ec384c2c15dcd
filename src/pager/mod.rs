// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Page-fault pager: fault decoding, IPC protocol and dispatch.
// Author: Lukas Bower

//! Page-fault pager.
//!
//! Threads started by core carry a badged copy of the pager entrypoint's
//! endpoint as their fault handler. The kernel turns every page fault into an
//! IPC on that endpoint; [`PagerEntrypoint`] receives it, looks the faulting
//! [`PagerObject`] up by badge and lets its [`FaultHandler`] decide on a
//! mapping.

pub mod entrypoint;
pub mod ipc_pager;
pub mod object;
pub mod region_map;

use thiserror::Error;

use crate::range_alloc::AllocError;
use crate::sel4::{Badge, Kernel, KernelError};
use crate::thread::ThreadError;
use crate::untyped::UntypedError;

pub use self::entrypoint::{Dispatch, PagerEntrypoint};
pub use self::ipc_pager::{IpcPager, PagerState};
pub use self::object::PagerObject;
pub use self::region_map::{Region, RegionMap};

/// Bit of message register 3 set for write accesses.
pub const FAULT_WRITE_MASK: usize = 0x2;

/// Errors raised by the pager.
#[derive(Debug, Error)]
pub enum PagerError {
    /// A kernel invocation failed.
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    /// Selector allocation failed.
    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),
    /// The pager endpoint could not be created.
    #[error("endpoint creation failed: {0}")]
    Untyped(#[from] UntypedError),
    /// A pager object with the same badge is already managed.
    #[error("badge {0} already managed")]
    DuplicateBadge(Badge),
    /// Badge zero cannot identify a pager object.
    #[error("invalid pager badge")]
    InvalidBadge,
    /// Installing the reply mapping failed.
    #[error("mapping installation failed: {0}")]
    Mapping(#[from] ThreadError),
}

/// Page fault as decoded from the kernel's fault message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultInfo {
    /// Faulting instruction pointer.
    pub ip: usize,
    /// Faulting address.
    pub addr: usize,
    /// `true` for write accesses.
    pub write: bool,
}

impl FaultInfo {
    /// Reads the fault from the message registers of the last received message.
    #[must_use]
    pub fn from_message_registers(kernel: &dyn Kernel) -> Self {
        Self {
            ip: kernel.get_mr(0),
            addr: kernel.get_mr(1),
            write: kernel.get_mr(3) & FAULT_WRITE_MASK != 0,
        }
    }
}

/// Mapping installed in reply to a resolved fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// Phys-CNode address of the first backing frame.
    pub from_phys: usize,
    /// Virtual address in the faulting address space.
    pub to_virt: usize,
    /// Number of pages.
    pub num_pages: usize,
    /// `true` for writeable mappings.
    pub writeable: bool,
}

/// Outcome of a fault handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultResolution {
    /// A reply mapping was set; the faulting thread may resume.
    Resolved,
    /// The fault cannot be served now; the thread stays blocked.
    Unresolved,
}

/// Decides how a page fault is served.
pub trait FaultHandler {
    /// Handles the fault currently held by `pager`, setting a reply mapping on success.
    fn pager(&mut self, pager: &mut IpcPager) -> FaultResolution;
}
