// CLASSIFICATION: COMMUNITY
// Filename: lib.rs v1.1
// Date Modified: 2026-10-19
// Author: Lukas Bower

//! Core platform of an seL4 root task.
//!
//! [`bootstrap::Platform`] takes over the resources the kernel hands to the
//! root task (untyped memory, the initial CNode, boot modules) and builds
//! core's CSpace, allocators and ROM file system from them. The
//! [`pager`] resolves page faults of threads created through [`thread`].

/// Boot-module headers and core image layout
pub mod boot_modules;

/// Platform orchestrator and bootstrap phases
pub mod bootstrap;

/// Platform configuration
pub mod config;

/// CNodes, selector allocation and the core CSpace layout
pub mod cspace;

/// Shared handles on core's allocators and registries
pub mod env;

/// Kernel-object creation from untyped pages
pub mod kobj;

/// Page tables and page-table entries by virtual address
pub mod page_table_registry;

/// Page-fault pager
pub mod pager;

/// Protection domains
pub mod pd;

/// Range allocators for physical, virtual and I/O-port space
pub mod range_alloc;

/// Boot modules exposed as read-only ROM modules
pub mod rom_fs;

/// Kernel interface and the host-mode kernel model
pub mod sel4;

/// Platform threads
pub mod thread;

/// Initial untyped pool and page conversion
pub mod untyped;

/// Page mappings of one address space
pub mod vm_space;

pub use bootstrap::{BootstrapError, Platform};
pub use config::PlatformConfig;
pub use env::CoreEnv;
