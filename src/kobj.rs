// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Creation of kernel objects from untyped pages.
// Author: Lukas Bower

//! Kernel objects backed by one untyped page each.

use crate::cspace::layout::untyped_sel;
use crate::env::CoreEnv;
use crate::sel4::{CapSel, ObjectType, PAGE_SIZE};
use crate::untyped::{UntypedError, UntypedMemory};

/// Kernel object created by [`create`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelObject {
    /// Selector in the core CNode.
    pub sel: CapSel,
    /// Physical page the object was retyped from.
    pub phys: usize,
    /// Object type.
    pub object: ObjectType,
}

/// Retypes a freshly allocated untyped page into `object` and places it at a
/// newly allocated selector of the core CNode.
pub fn create(env: &CoreEnv, object: ObjectType, size_bits: u8) -> Result<KernelObject, UntypedError> {
    let phys = env.alloc_page()?;
    let sel = match env.alloc_sel() {
        Ok(sel) => sel,
        Err(err) => {
            env.free_page(phys);
            return Err(err.into());
        }
    };
    if let Err(err) = env.kernel().untyped_retype(
        untyped_sel(phys),
        object,
        size_bits,
        env.core_cnode().sel(),
        sel.value(),
        1,
    ) {
        env.free_sel(sel);
        env.free_page(phys);
        return Err(err.into());
    }
    log::trace!("[kobj] {} at {sel} from 0x{phys:x}", object.label());
    Ok(KernelObject { sel, phys, object })
}

/// Destroys `obj` and returns its page and selector.
pub fn destroy(env: &CoreEnv, obj: KernelObject) -> Result<(), UntypedError> {
    UntypedMemory::convert_to_untyped_frames(env.kernel(), obj.phys, PAGE_SIZE)?;
    env.free_sel(obj.sel);
    env.free_page(obj.phys);
    Ok(())
}
