// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Thread facility of core: kernel objects, registry and lifecycle of threads.
// Author: Lukas Bower

//! Thread facility.
//!
//! A [`PlatformThread`] owns the kernel objects of one thread
//! ([`ThreadInfo`]), is bound to a [`crate::pd::Pd`] and started with a
//! badged pager capability as its fault handler. Every thread is listed in
//! the [`ThreadRegistry`] under its pager-object badge so the pager can find
//! the address space a resolved fault's mapping belongs to.

pub mod info;
pub mod platform_thread;
pub mod registry;

use thiserror::Error;

use crate::pd::PdError;
use crate::range_alloc::AllocError;
use crate::sel4::KernelError;
use crate::untyped::UntypedError;
use crate::vm_space::VmError;

pub use self::info::ThreadInfo;
pub use self::platform_thread::{Lifecycle, PlatformThread, ThreadState};
pub use self::registry::ThreadRegistry;

/// Virtual address of the IPC buffer of a thread created without an explicit UTCB.
pub const INITIAL_IPC_BUFFER_VIRT: usize = 0x1000;

/// Offset of the endpoint selector within a prepopulated IPC buffer.
pub const UTCB_EP_SEL_OFFSET: usize = 0;

/// Offset of the lock selector within a prepopulated IPC buffer.
pub const UTCB_LOCK_SEL_OFFSET: usize = core::mem::size_of::<usize>();

/// Errors raised by the thread facility.
#[derive(Debug, Error)]
pub enum ThreadError {
    /// A kernel invocation failed.
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    /// A selector or address range could not be allocated.
    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),
    /// Creating a kernel object failed.
    #[error("object creation failed: {0}")]
    Untyped(#[from] UntypedError),
    /// Core's address space could not be changed.
    #[error("vm space: {0}")]
    Vm(#[from] VmError),
    /// The protection domain rejected the request.
    #[error("protection domain: {0}")]
    Pd(#[from] PdError),
    /// The register state of the thread cannot be accessed.
    #[error("thread state access failed")]
    StateAccessFailed,
    /// The pager object has no capability yet.
    #[error("pager object is not managed by an entrypoint")]
    PagerNotManaged,
    /// The thread is not bound to a protection domain.
    #[error("thread is not bound to a protection domain")]
    NotBound,
    /// The thread is already bound to a protection domain.
    #[error("thread is already bound to a protection domain")]
    AlreadyBound,
    /// The thread registry lock was poisoned.
    #[error("thread registry lock poisoned")]
    LockPoisoned,
}
