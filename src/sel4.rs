// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: seL4 kernel interface consumed by the core platform and pager.
// Author: Lukas Bower

//! seL4 kernel interface used by core.
//!
//! Every kernel invocation issued by the bootstrap, the pager and the thread
//! facility goes through the [`Kernel`] trait. The seL4 syscall layer plugs in
//! at this seam; [`host::HostKernel`] models the kernel on the host so that
//! bootstrap and fault handling can be exercised without hardware.

pub mod host;

use core::fmt;

use bitflags::bitflags;
use thiserror::Error;

/// Width of a capability pointer in bits.
pub const WORD_BITS: u8 = 32;

/// Base-2 logarithm of the page size.
pub const PAGE_SIZE_LOG2: usize = 12;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_LOG2;

/// Number of entries held by one page table.
pub const PAGE_TABLE_ENTRIES: usize = 1024;

/// Base-2 logarithm of the virtual range covered by one page table.
pub const PAGE_TABLE_SPAN_LOG2: usize = PAGE_SIZE_LOG2 + 10;

/// Size in bytes of one CNode slot, as a power of two.
pub const SLOT_SIZE_LOG2: u8 = 4;

/// Null capability slot.
pub const CAP_NULL: usize = 0;
/// Initial thread's TCB.
pub const INIT_THREAD_TCB: usize = 1;
/// Initial thread's root CNode.
pub const INIT_THREAD_CNODE: usize = 2;
/// Initial thread's VSpace (page directory).
pub const INIT_THREAD_VSPACE: usize = 3;
/// Global IRQ controller capability.
pub const IRQ_CONTROL: usize = 4;
/// Global ASID controller capability.
pub const ASID_CONTROL: usize = 5;
/// Initial thread's ASID pool.
pub const INIT_THREAD_ASID_POOL: usize = 6;
/// Global I/O port capability (x86 only).
pub const IO_PORT: usize = 7;
/// Global I/O space capability (IOMMU only).
pub const IO_SPACE: usize = 8;
/// Boot-info frame capability.
pub const BOOT_INFO_FRAME: usize = 9;
/// Initial thread's IPC buffer frame.
pub const INIT_THREAD_IPC_BUFFER: usize = 10;
/// Global domain controller capability.
pub const DOMAIN: usize = 11;
/// Number of well-known selectors installed by the kernel.
pub const NUM_INITIAL_CAPS: usize = 12;

/// Truncates `addr` to the start of its page.
#[must_use]
pub const fn trunc_page(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary.
#[must_use]
pub const fn round_page(addr: usize) -> usize {
    trunc_page(addr + PAGE_SIZE - 1)
}

/// Aligns `addr` upwards to a `1 << align_log2` boundary.
#[must_use]
pub const fn align_addr(addr: usize, align_log2: usize) -> usize {
    let mask = (1usize << align_log2) - 1;
    (addr + mask) & !mask
}

/// Opaque capability selector naming a slot reachable from a CSpace root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapSel(usize);

impl CapSel {
    /// The null selector.
    pub const NULL: Self = Self(CAP_NULL);

    /// Wraps a raw selector value.
    #[must_use]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// Returns the raw selector value.
    #[must_use]
    pub const fn value(self) -> usize {
        self.0
    }

    /// Returns `true` for the null selector.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == CAP_NULL
    }
}

impl fmt::Display for CapSel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Badge minted into a capability and delivered with every IPC sent through it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Badge(usize);

impl Badge {
    /// Badge value meaning "no badge".
    pub const INVALID: Self = Self(0);

    /// Wraps a raw badge value.
    #[must_use]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// Returns the raw badge value.
    #[must_use]
    pub const fn value(self) -> usize {
        self.0
    }

    /// Returns `true` unless this is [`Badge::INVALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Badge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

bitflags! {
    /// Access rights attached to a capability.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct CapRights: u8 {
        /// Read access.
        const READ = 0b0001;
        /// Write access.
        const WRITE = 0b0010;
        /// Permission to transfer capabilities.
        const GRANT = 0b0100;
        /// Permission to grant via reply.
        const GRANT_REPLY = 0b1000;
    }
}

impl CapRights {
    /// Read-only rights.
    #[must_use]
    pub const fn read_only() -> Self {
        Self::READ
    }

    /// Read and write rights without grant.
    #[must_use]
    pub const fn read_write() -> Self {
        Self::READ.union(Self::WRITE)
    }
}

/// Kernel object types that core creates by retyping untyped memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// Untyped memory of a caller-provided size.
    Untyped,
    /// Thread control block.
    Tcb,
    /// Synchronous IPC endpoint.
    Endpoint,
    /// Asynchronous notification object.
    Notification,
    /// CNode with a caller-provided number of slots (as radix).
    CNode,
    /// 4 KiB page frame.
    Page,
    /// Second-level page table.
    PageTable,
    /// Top-level page directory.
    PageDirectory,
}

impl ObjectType {
    /// Returns the object size in bits; `size_bits` applies to variable-sized types.
    #[must_use]
    pub const fn object_size_bits(self, size_bits: u8) -> u8 {
        match self {
            Self::Untyped => size_bits,
            Self::Tcb => 10,
            Self::Endpoint | Self::Notification => 4,
            Self::CNode => size_bits + SLOT_SIZE_LOG2,
            Self::Page | Self::PageTable | Self::PageDirectory => PAGE_SIZE_LOG2 as u8,
        }
    }

    /// Human-readable label used in boot logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Untyped => "untyped",
            Self::Tcb => "tcb",
            Self::Endpoint => "endpoint",
            Self::Notification => "notification",
            Self::CNode => "cnode",
            Self::Page => "page",
            Self::PageTable => "page-table",
            Self::PageDirectory => "page-directory",
        }
    }
}

/// Capability data word supplied when installing a CSpace root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapData {
    /// Leave the capability's guard unchanged.
    Null,
    /// Replace the guard with `guard_bits` bits of value `guard`.
    Guard {
        /// Guard value compared against the selector's leading bits.
        guard: usize,
        /// Number of guard bits.
        guard_bits: u8,
    },
}

impl CapData {
    /// Builds a guard data word, mirroring `seL4_CapData_Guard_new`.
    #[must_use]
    pub const fn guard(guard: usize, guard_bits: u8) -> Self {
        Self::Guard { guard, guard_bits }
    }
}

/// Address of a slot: a CNode reachable from the caller's CSpace plus an
/// index resolved through that CNode with `depth` bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotPath {
    /// Selector of the CNode used as resolution root.
    pub root: CapSel,
    /// Index resolved relative to `root`.
    pub index: usize,
    /// Number of selector bits to resolve.
    pub depth: u8,
}

impl SlotPath {
    /// Constructs a slot path.
    #[must_use]
    pub const fn new(root: CapSel, index: usize, depth: u8) -> Self {
        Self { root, index, depth }
    }
}

/// IPC message descriptor word.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageInfo {
    /// Encoded label, capability counts and length.
    pub words: [usize; 1],
}

impl MessageInfo {
    /// Encodes a message info word, mirroring `seL4_MessageInfo_new`.
    #[inline(always)]
    #[must_use]
    pub const fn new(label: usize, caps_unwrapped: usize, extra_caps: usize, length: usize) -> Self {
        let mut value = 0usize;
        value |= (label & 0x000f_ffff) << 12;
        value |= (caps_unwrapped & 0x7) << 9;
        value |= (extra_caps & 0x3) << 7;
        value |= length & 0x7f;
        Self { words: [value] }
    }

    /// Returns the message label.
    #[inline(always)]
    #[must_use]
    pub const fn label(self) -> usize {
        (self.words[0] >> 12) & 0x000f_ffff
    }

    /// Returns the number of message registers carried.
    #[inline(always)]
    #[must_use]
    pub const fn length(self) -> usize {
        self.words[0] & 0x7f
    }
}

/// Label of a kernel-generated VM fault message.
pub const VM_FAULT_LABEL: usize = 5;

/// Number of message registers in a VM fault message.
pub const VM_FAULT_LENGTH: usize = 4;

/// Architecture register file as transferred by `TCB_ReadRegisters`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserContext {
    /// Program counter.
    pub pc: usize,
    /// Stack pointer.
    pub sp: usize,
    /// Current program status register.
    pub cpsr: usize,
    /// General-purpose registers r0..=r12.
    pub r: [usize; 13],
    /// Link register.
    pub r14: usize,
}

/// Region of consecutive slots in the initial CNode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotRegion {
    /// First slot of the region.
    pub start: usize,
    /// One past the last slot.
    pub end: usize,
}

impl SlotRegion {
    /// Constructs a slot region.
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Number of slots in the region.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Returns `true` when the region holds no slot.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Returns `true` when `slot` lies inside the region.
    #[must_use]
    pub const fn contains(&self, slot: usize) -> bool {
        slot >= self.start && slot < self.end
    }

    /// Iterates the slots of the region.
    pub fn iter(&self) -> core::ops::Range<usize> {
        self.start..self.end
    }
}

/// Descriptor of one untyped capability handed to the root task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UntypedDesc {
    /// Physical base address.
    pub paddr: usize,
    /// Size of the range as a power of two.
    pub size_bits: u8,
    /// `true` for device memory.
    pub is_device: bool,
}

/// Boot information provided by the kernel to the root task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootInfo {
    /// Radix of the initial thread's CNode.
    pub init_cnode_size_bits: u8,
    /// Empty slots of the initial CNode.
    pub empty: SlotRegion,
    /// Slots holding untyped capabilities, one per entry of `untyped_list`.
    pub untyped: SlotRegion,
    /// Slots holding the frames backing the root task's program image.
    pub user_image_frames: SlotRegion,
    /// Slots holding the page tables created for the program image.
    pub user_image_paging: SlotRegion,
    /// Descriptors of the untyped capabilities.
    pub untyped_list: Vec<UntypedDesc>,
    /// Virtual address of the initial IPC buffer.
    pub ipc_buffer: usize,
    /// Virtual address of the boot-info page itself.
    pub boot_info_vaddr: usize,
    /// Size of the extra boot-info area following the boot-info page.
    pub extra_len: usize,
}

/// seL4 error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum KernelError {
    /// `seL4_InvalidArgument`.
    #[error("invalid argument")]
    InvalidArgument,
    /// `seL4_InvalidCapability`.
    #[error("invalid capability")]
    InvalidCapability,
    /// `seL4_IllegalOperation`.
    #[error("illegal operation")]
    IllegalOperation,
    /// `seL4_RangeError`.
    #[error("range error")]
    RangeError,
    /// `seL4_AlignmentError`.
    #[error("alignment error")]
    AlignmentError,
    /// `seL4_FailedLookup`.
    #[error("failed lookup")]
    FailedLookup,
    /// `seL4_TruncatedMessage`.
    #[error("truncated message")]
    TruncatedMessage,
    /// `seL4_DeleteFirst`.
    #[error("delete first")]
    DeleteFirst,
    /// `seL4_RevokeFirst`.
    #[error("revoke first")]
    RevokeFirst,
    /// `seL4_NotEnoughMemory`.
    #[error("not enough memory")]
    NotEnoughMemory,
}

impl KernelError {
    /// Returns the numeric seL4 error code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::InvalidArgument => 1,
            Self::InvalidCapability => 2,
            Self::IllegalOperation => 3,
            Self::RangeError => 4,
            Self::AlignmentError => 5,
            Self::FailedLookup => 6,
            Self::TruncatedMessage => 7,
            Self::DeleteFirst => 8,
            Self::RevokeFirst => 9,
            Self::NotEnoughMemory => 10,
        }
    }

    /// Decodes a raw seL4 return value; `0` (`seL4_NoError`) maps to `Ok`.
    pub const fn from_code(code: i32) -> Result<(), KernelError> {
        match code {
            0 => Ok(()),
            1 => Err(Self::InvalidArgument),
            2 => Err(Self::InvalidCapability),
            3 => Err(Self::IllegalOperation),
            4 => Err(Self::RangeError),
            5 => Err(Self::AlignmentError),
            6 => Err(Self::FailedLookup),
            7 => Err(Self::TruncatedMessage),
            8 => Err(Self::DeleteFirst),
            9 => Err(Self::RevokeFirst),
            _ => Err(Self::NotEnoughMemory),
        }
    }
}

/// Result alias for kernel invocations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel invocations issued by core on behalf of the calling thread.
///
/// Selectors passed to these methods are resolved through the caller's
/// current CSpace root with [`WORD_BITS`] of depth.
pub trait Kernel: Send + Sync {
    /// `seL4_CNode_Copy`.
    fn cnode_copy(&self, dst: SlotPath, src: SlotPath, rights: CapRights) -> KernelResult<()>;

    /// `seL4_CNode_Mint`.
    fn cnode_mint(
        &self,
        dst: SlotPath,
        src: SlotPath,
        rights: CapRights,
        badge: Badge,
    ) -> KernelResult<()>;

    /// `seL4_CNode_Move`.
    fn cnode_move(&self, dst: SlotPath, src: SlotPath) -> KernelResult<()>;

    /// `seL4_CNode_Delete`.
    fn cnode_delete(&self, slot: SlotPath) -> KernelResult<()>;

    /// `seL4_CNode_Revoke`: deletes every capability derived from `slot`.
    fn cnode_revoke(&self, slot: SlotPath) -> KernelResult<()>;

    /// `seL4_CNode_SaveCaller`: moves the implicit reply capability into `slot`.
    fn cnode_save_caller(&self, slot: SlotPath) -> KernelResult<()>;

    /// `seL4_Untyped_Retype` placing `num_objects` objects at
    /// `dst_offset..dst_offset + num_objects` of the CNode `dst_cnode`.
    fn untyped_retype(
        &self,
        untyped: CapSel,
        object: ObjectType,
        size_bits: u8,
        dst_cnode: CapSel,
        dst_offset: usize,
        num_objects: usize,
    ) -> KernelResult<()>;

    /// `seL4_Page_Map`.
    fn page_map(&self, page: CapSel, vspace: CapSel, vaddr: usize, rights: CapRights)
        -> KernelResult<()>;

    /// `seL4_Page_Unmap`.
    fn page_unmap(&self, page: CapSel) -> KernelResult<()>;

    /// `seL4_PageTable_Map`.
    fn page_table_map(&self, table: CapSel, vspace: CapSel, vaddr: usize) -> KernelResult<()>;

    /// `seL4_ASIDPool_Assign`.
    fn asid_pool_assign(&self, pool: CapSel, vspace: CapSel) -> KernelResult<()>;

    /// `seL4_TCB_SetIPCBuffer`.
    fn tcb_configure(&self, tcb: CapSel, ipc_buffer_vaddr: usize, ipc_buffer_frame: CapSel)
        -> KernelResult<()>;

    /// `seL4_TCB_SetSpace`.
    fn tcb_set_space(
        &self,
        tcb: CapSel,
        fault_ep: CapSel,
        cspace_root: CapSel,
        cspace_data: CapData,
        vspace_root: CapSel,
        vspace_data: CapData,
    ) -> KernelResult<()>;

    /// `seL4_TCB_SetPriority`.
    fn tcb_set_priority(&self, tcb: CapSel, authority: CapSel, priority: u8) -> KernelResult<()>;

    /// `seL4_TCB_Suspend`.
    fn tcb_suspend(&self, tcb: CapSel) -> KernelResult<()>;

    /// `seL4_TCB_Resume`.
    fn tcb_resume(&self, tcb: CapSel) -> KernelResult<()>;

    /// `seL4_TCB_ReadRegisters`.
    fn tcb_read_registers(&self, tcb: CapSel, suspend_source: bool) -> KernelResult<UserContext>;

    /// `seL4_TCB_WriteRegisters`.
    fn tcb_write_registers(&self, tcb: CapSel, resume_target: bool, regs: &UserContext)
        -> KernelResult<()>;

    /// `seL4_Signal`.
    fn signal(&self, notification: CapSel) -> KernelResult<()>;

    /// `seL4_Wait`; returns the accumulated badge word.
    fn wait(&self, notification: CapSel) -> KernelResult<Badge>;

    /// `seL4_Send`.
    fn send(&self, dst: CapSel, info: MessageInfo) -> KernelResult<()>;

    /// `seL4_Recv`; blocks until a message arrives and returns its sender badge.
    fn recv(&self, endpoint: CapSel) -> KernelResult<(MessageInfo, Badge)>;

    /// `seL4_ReplyRecv`: replies to the current caller, then receives.
    fn reply_recv(&self, endpoint: CapSel, reply: MessageInfo)
        -> KernelResult<(MessageInfo, Badge)>;

    /// `seL4_GetMR` on the caller's IPC buffer.
    fn get_mr(&self, index: usize) -> usize;

    /// `seL4_SetCapReceivePath`.
    fn set_cap_receive_path(&self, root: CapSel, index: usize, depth: u8);

    /// Stores `bytes` at `vaddr` of the caller's address space.
    fn write_mapped(&self, vaddr: usize, bytes: &[u8]) -> KernelResult<()>;

    /// Loads `buf.len()` bytes from `vaddr` of the caller's address space.
    fn read_mapped(&self, vaddr: usize, buf: &mut [u8]) -> KernelResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_helpers_round_and_truncate() {
        assert_eq!(trunc_page(0x1fff), 0x1000);
        assert_eq!(round_page(0x1001), 0x2000);
        assert_eq!(round_page(0x2000), 0x2000);
        assert_eq!(align_addr(0x1_0001, 16), 0x2_0000);
    }

    #[test]
    fn kernel_error_codes_round_trip_through_raw_values() {
        assert_eq!(KernelError::from_code(0), Ok(()));
        for err in [
            KernelError::InvalidArgument,
            KernelError::DeleteFirst,
            KernelError::RevokeFirst,
            KernelError::NotEnoughMemory,
        ] {
            assert_eq!(KernelError::from_code(err.code()), Err(err));
        }
    }

    #[test]
    fn message_info_packs_label_and_length() {
        let info = MessageInfo::new(VM_FAULT_LABEL, 0, 0, VM_FAULT_LENGTH);
        assert_eq!(info.label(), VM_FAULT_LABEL);
        assert_eq!(info.length(), VM_FAULT_LENGTH);
    }

    #[test]
    fn cnode_objects_scale_with_radix() {
        assert_eq!(ObjectType::CNode.object_size_bits(14), 18);
        assert_eq!(ObjectType::Page.object_size_bits(0), 12);
    }
}
