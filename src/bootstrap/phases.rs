// Author: Lukas Bower
//! Linear bootstrap phase tracking and bootstrap errors.

use core::fmt::{self, Write};

use heapless::String;
use thiserror::Error;

use crate::page_table_registry::RegistryError;
use crate::range_alloc::AllocError;
use crate::sel4::{KernelError, KernelResult};
use crate::untyped::UntypedError;
use crate::vm_space::VmError;

/// Capacity of bootstrap diagnostic messages.
pub const MESSAGE_LEN: usize = 160;

/// Fatal error aborting [`crate::bootstrap::Platform::bootstrap`].
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// A phase was entered out of order.
    #[error("bootstrap phase order violation: expected {expected}, saw {saw}")]
    PhaseOrder {
        /// Phase the sequencer expected.
        expected: BootstrapPhase,
        /// Phase that was requested.
        saw: BootstrapPhase,
    },
    /// A phase was entered after the last one completed.
    #[error("bootstrap phase advance attempted after completion")]
    AlreadyComplete,
    /// The boot info violates an invariant core depends on.
    #[error("invalid boot info: {0}")]
    BootInfo(String<MESSAGE_LEN>),
    /// A mandatory kernel invocation failed.
    #[error("{step}: {err}")]
    Kernel {
        /// Bootstrap step issuing the invocation.
        step: &'static str,
        /// Kernel error.
        err: KernelError,
    },
    /// Untyped memory could not be consumed.
    #[error("untyped memory: {0}")]
    Untyped(#[from] UntypedError),
    /// The boot page tables could not be registered.
    #[error("page-table registry: {0}")]
    Registry(#[from] RegistryError),
    /// An allocator was exhausted.
    #[error("allocator: {0}")]
    Alloc(#[from] AllocError),
    /// Core's address space could not be changed.
    #[error("vm space: {0}")]
    Vm(#[from] VmError),
    /// The lock notification delivered a wrong badge.
    #[error("lock self test received badge 0x{sender:x}")]
    LockSelfTest {
        /// Badge delivered by the notification.
        sender: usize,
    },
    /// No phys CNode space is left for the boot modules.
    #[error("could not reserve phys CNode space for boot modules: {0}")]
    InitRomModulesFailed(AllocError),
}

impl BootstrapError {
    /// Builds a [`BootstrapError::BootInfo`] from formatted arguments.
    pub(crate) fn boot_info(args: fmt::Arguments<'_>) -> Self {
        let mut msg = String::<MESSAGE_LEN>::new();
        let _ = msg.write_fmt(args);
        Self::BootInfo(msg)
    }
}

/// Maps a failed mandatory kernel invocation to a [`BootstrapError`].
pub(crate) fn ktry<T>(step: &'static str, result: KernelResult<T>) -> Result<T, BootstrapError> {
    result.map_err(|err| {
        log::error!("[boot] {step}: seL4 err={}", err.code());
        BootstrapError::Kernel { step, err }
    })
}

/// Bootstrap phases executed exactly once in order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BootstrapPhase {
    UnusedPhysInit,
    CoreCnodesCreate,
    IpcBufferInit,
    CspaceSwitch,
    PageTableRegistryInit,
    AllocatorsInit,
    CoreVmSpaceInit,
    LockSelfTest,
    IoPortInit,
    RomModulesInit,
}

impl BootstrapPhase {
    const fn as_str(self) -> &'static str {
        match self {
            Self::UnusedPhysInit => "UnusedPhysInit",
            Self::CoreCnodesCreate => "CoreCnodesCreate",
            Self::IpcBufferInit => "IpcBufferInit",
            Self::CspaceSwitch => "CspaceSwitch",
            Self::PageTableRegistryInit => "PageTableRegistryInit",
            Self::AllocatorsInit => "AllocatorsInit",
            Self::CoreVmSpaceInit => "CoreVmSpaceInit",
            Self::LockSelfTest => "LockSelfTest",
            Self::IoPortInit => "IoPortInit",
            Self::RomModulesInit => "RomModulesInit",
        }
    }
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order in which the phases run.
pub const ORDERING: &[BootstrapPhase] = &[
    BootstrapPhase::UnusedPhysInit,
    BootstrapPhase::CoreCnodesCreate,
    BootstrapPhase::IpcBufferInit,
    BootstrapPhase::CspaceSwitch,
    BootstrapPhase::PageTableRegistryInit,
    BootstrapPhase::AllocatorsInit,
    BootstrapPhase::CoreVmSpaceInit,
    BootstrapPhase::LockSelfTest,
    BootstrapPhase::IoPortInit,
    BootstrapPhase::RomModulesInit,
];

/// Tracks bootstrap progress and rejects re-entry or phase reordering.
#[derive(Debug, Default)]
pub struct BootstrapSequencer {
    next: usize,
}

impl BootstrapSequencer {
    /// Constructs a new sequencer positioned before the first phase.
    #[must_use]
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    fn expect_next(&self, phase: BootstrapPhase) -> Result<(), BootstrapError> {
        let Some(&expected) = ORDERING.get(self.next) else {
            return Err(BootstrapError::AlreadyComplete);
        };
        if expected != phase {
            return Err(BootstrapError::PhaseOrder {
                expected,
                saw: phase,
            });
        }
        Ok(())
    }

    /// Marks the supplied phase as entered.
    pub fn advance(&mut self, phase: BootstrapPhase) -> Result<(), BootstrapError> {
        self.expect_next(phase)?;
        log::info!("[boot] {phase}");
        self.next += 1;
        Ok(())
    }

    /// Phases entered so far.
    #[must_use]
    pub fn completed(&self) -> &'static [BootstrapPhase] {
        &ORDERING[..self.next]
    }

    /// Returns `true` once every phase was entered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.next == ORDERING.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_must_run_in_order() {
        let mut seq = BootstrapSequencer::new();
        seq.advance(BootstrapPhase::UnusedPhysInit).expect("first");
        let err = seq
            .advance(BootstrapPhase::CspaceSwitch)
            .expect_err("skipped phase");
        assert!(matches!(
            err,
            BootstrapError::PhaseOrder {
                expected: BootstrapPhase::CoreCnodesCreate,
                saw: BootstrapPhase::CspaceSwitch
            }
        ));
        assert_eq!(seq.completed(), &[BootstrapPhase::UnusedPhysInit]);
    }

    #[test]
    fn sequencer_rejects_reentry_after_completion() {
        let mut seq = BootstrapSequencer::new();
        for phase in ORDERING {
            seq.advance(*phase).expect("in order");
        }
        assert!(seq.is_complete());
        assert!(matches!(
            seq.advance(BootstrapPhase::RomModulesInit),
            Err(BootstrapError::AlreadyComplete)
        ));
    }

    #[test]
    fn boot_info_messages_are_bounded() {
        let err = BootstrapError::boot_info(format_args!("{}", "x".repeat(400)));
        match err {
            BootstrapError::BootInfo(msg) => assert!(msg.len() <= MESSAGE_LEN),
            other => panic!("unexpected error {other}"),
        }
    }
}
