// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Registry mapping pager-object badges to the protection domains of threads.
// Author: Lukas Bower

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::pager::Mapping;
use crate::pd::Pd;
use crate::sel4::Badge;
use crate::thread::ThreadError;

#[derive(Debug)]
struct ThreadRecord {
    badge: Badge,
    pd: Option<Weak<Pd>>,
}

/// Live threads keyed by the badge of their pager object.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<Vec<ThreadRecord>>,
}

impl ThreadRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<ThreadRecord>>, ThreadError> {
        self.threads.lock().map_err(|_| ThreadError::LockPoisoned)
    }

    /// Lists a thread whose pager object carries `badge`.
    pub fn insert(&self, badge: Badge) -> Result<(), ThreadError> {
        self.lock()?.push(ThreadRecord { badge, pd: None });
        Ok(())
    }

    /// Records the protection domain the thread with `badge` was bound to.
    pub fn bind(&self, badge: Badge, pd: &Arc<Pd>) -> Result<(), ThreadError> {
        let mut threads = self.lock()?;
        let record = threads
            .iter_mut()
            .find(|record| record.badge == badge)
            .ok_or(ThreadError::NotBound)?;
        record.pd = Some(Arc::downgrade(pd));
        Ok(())
    }

    /// Removes the thread with `badge`.
    pub fn remove(&self, badge: Badge) {
        match self.lock() {
            Ok(mut threads) => threads.retain(|record| record.badge != badge),
            Err(err) => log::error!("[thread] removing {badge}: {err}"),
        }
    }

    /// Installs `mapping` in the address space of every thread whose pager
    /// object carries `badge` and returns how many threads matched.
    ///
    /// The registry lock is held until every mapping is installed.
    pub fn install_mapping(&self, mapping: &Mapping, badge: Badge) -> Result<usize, ThreadError> {
        let threads = self.lock()?;
        let mut installed = 0;
        for record in threads.iter().filter(|record| record.badge == badge) {
            if let Some(pd) = record.pd.as_ref().and_then(Weak::upgrade) {
                pd.install_mapping(mapping)?;
                installed += 1;
            }
        }
        Ok(installed)
    }

    /// Number of listed threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().map(|threads| threads.len()).unwrap_or(0)
    }

    /// Returns `true` when no thread is listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_threads_receive_no_mappings() {
        let registry = ThreadRegistry::new();
        registry.insert(Badge::new(0x301)).expect("insert");
        let mapping = Mapping {
            from_phys: 0x8010_0000,
            to_virt: 0x1000_0000,
            num_pages: 1,
            writeable: false,
        };
        assert_eq!(registry.install_mapping(&mapping, Badge::new(0x301)).expect("install"), 0);
        assert_eq!(registry.install_mapping(&mapping, Badge::new(0x302)).expect("install"), 0);
        registry.remove(Badge::new(0x301));
        assert!(registry.is_empty());
    }
}
