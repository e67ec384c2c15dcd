// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Registry of named ROM modules imported from the boot image.
// Author: Lukas Bower

//! ROM file system.

use core::fmt;

use heapless::String;

use crate::boot_modules::MODULE_NAME_LEN;
use crate::vm_space::bounded;

/// Named, read-only blob located in the phys CNode address space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RomModule {
    base: usize,
    size: usize,
    name: String<MODULE_NAME_LEN>,
}

impl RomModule {
    /// Creates a module record.
    #[must_use]
    pub fn new(base: usize, size: usize, name: &str) -> Self {
        Self {
            base,
            size,
            name: bounded(name),
        }
    }

    /// Base within the phys CNode address space (frame number shifted by the page size).
    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for RomModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[0x{:08x},0x{:08x}) {}",
            self.base,
            self.base + self.size,
            self.name
        )
    }
}

/// ROM modules in registration order. Modules are never removed.
#[derive(Debug, Default)]
pub struct RomFs {
    modules: Vec<RomModule>,
}

impl RomFs {
    /// Creates an empty file system.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `module`; a later module shadows an earlier one of the same name.
    pub fn insert(&mut self, module: RomModule) {
        log::debug!("[rom] {module}");
        self.modules.push(module);
    }

    /// Looks a module up by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&RomModule> {
        self.modules.iter().rev().find(|module| module.name() == name)
    }

    /// Iterates the modules in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &RomModule> {
        self.modules.iter()
    }

    /// Number of registered modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` when no module is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
