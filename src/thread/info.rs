// CLASSIFICATION: COMMUNITY
// Filename: info.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Kernel objects backing one thread.

use crate::cspace::layout::frame_sel;
use crate::env::CoreEnv;
use crate::kobj::{self, KernelObject};
use crate::sel4::{CapSel, ObjectType, INIT_THREAD_TCB, PAGE_SIZE};
use crate::thread::ThreadError;
use crate::untyped::UntypedMemory;

/// TCB, endpoint, lock notification and IPC-buffer page of a thread.
#[derive(Debug)]
pub struct ThreadInfo {
    /// Thread control block.
    pub tcb: KernelObject,
    /// The thread's endpoint.
    pub ep: KernelObject,
    /// Notification used as the thread's lock.
    pub lock: KernelObject,
    /// Physical page holding the IPC buffer.
    pub ipc_buffer_phys: usize,
}

fn release(env: &CoreEnv, objects: &[KernelObject]) {
    for obj in objects.iter().rev() {
        if let Err(err) = kobj::destroy(env, *obj) {
            log::error!("[thread] destroying {} at {}: {err}", obj.object.label(), obj.sel);
        }
    }
}

fn release_ipc_buffer(env: &CoreEnv, phys: usize) {
    if let Err(err) = UntypedMemory::convert_to_untyped_frames(env.kernel(), phys, PAGE_SIZE) {
        log::error!("[thread] releasing IPC buffer 0x{phys:x}: {err}");
    }
    env.free_page(phys);
}

impl ThreadInfo {
    /// Creates the kernel objects of a thread whose IPC buffer lives at
    /// `utcb_virt` and sets its priority.
    pub fn init(env: &CoreEnv, utcb_virt: usize, priority: u8) -> Result<Self, ThreadError> {
        let ipc_buffer_phys = env.alloc_page()?;
        if let Err(err) = UntypedMemory::convert_to_page_frames(env.kernel(), ipc_buffer_phys, 1) {
            env.free_page(ipc_buffer_phys);
            return Err(err.into());
        }

        let mut created: Vec<KernelObject> = Vec::with_capacity(3);
        for object in [ObjectType::Tcb, ObjectType::Endpoint, ObjectType::Notification] {
            match kobj::create(env, object, 0) {
                Ok(obj) => created.push(obj),
                Err(err) => {
                    release(env, &created);
                    release_ipc_buffer(env, ipc_buffer_phys);
                    return Err(err.into());
                }
            }
        }
        let info = Self {
            tcb: created[0],
            ep: created[1],
            lock: created[2],
            ipc_buffer_phys,
        };

        let kernel = env.kernel();
        let configured = kernel
            .tcb_configure(info.tcb.sel, utcb_virt, frame_sel(ipc_buffer_phys))
            .and_then(|()| {
                kernel.tcb_set_priority(info.tcb.sel, CapSel::new(INIT_THREAD_TCB), priority)
            });
        if let Err(err) = configured {
            info.destruct(env);
            return Err(err.into());
        }
        log::trace!(
            "[thread] tcb {} ep {} lock {} ipc 0x{ipc_buffer_phys:x} -> 0x{utcb_virt:x}",
            info.tcb.sel,
            info.ep.sel,
            info.lock.sel
        );
        Ok(info)
    }

    /// Destroys the thread's kernel objects and returns its IPC-buffer page.
    pub fn destruct(self, env: &CoreEnv) {
        release(env, &[self.tcb, self.ep, self.lock]);
        release_ipc_buffer(env, self.ipc_buffer_phys);
    }
}
