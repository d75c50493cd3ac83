//! Every tracked hub by stable handle, plus the single-flight gate.
//!
//! The registry lock only guards map membership and the gate. It is never
//! held while an entry lock is taken.

use alloc::{
    collections::btree_map::BTreeMap,
    sync::{Arc, Weak},
    vec::Vec,
};

use super::{HubId, entry::HubManagerEntry};
use crate::{DeviceId, HubError, Result};

pub(crate) struct Registry {
    inner: spin::Mutex<Inner>,
}

struct Inner {
    hubs: BTreeMap<HubId, Arc<HubManagerEntry>>,
    next_hub_id: u32,
    /// Hub whose port state machine may run.
    processing_hub: Option<HubId>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: spin::Mutex::new(Inner {
                hubs: BTreeMap::new(),
                next_hub_id: 1,
                processing_hub: None,
            }),
        }
    }

    /// Allocates a handle and registers the entry `build` makes for it.
    pub fn insert(
        &self,
        max_hubs: usize,
        build: impl FnOnce(HubId) -> HubManagerEntry,
    ) -> Result<Arc<HubManagerEntry>> {
        let mut inner = self.inner.lock();
        if inner.hubs.len() >= max_hubs {
            return Err(HubError::HubLimit(max_hubs));
        }
        let id = HubId(inner.next_hub_id);
        inner.next_hub_id += 1;
        let entry = Arc::new(build(id));
        inner.hubs.insert(id, entry.clone());
        Ok(entry)
    }

    /// Unregisters a hub. The entry is handed back so that it is dropped
    /// outside the registry lock.
    pub fn remove(&self, id: HubId) -> Option<Arc<HubManagerEntry>> {
        let mut inner = self.inner.lock();
        let entry = inner.hubs.remove(&id);
        if entry.is_some() && inner.processing_hub == Some(id) {
            inner.processing_hub = None;
        }
        entry
    }

    pub fn get(&self, id: HubId) -> Option<Arc<HubManagerEntry>> {
        self.inner.lock().hubs.get(&id).cloned()
    }

    pub fn find_by_device(&self, dev: DeviceId) -> Option<Arc<HubManagerEntry>> {
        self.inner
            .lock()
            .hubs
            .values()
            .find(|entry| entry.dev == dev)
            .cloned()
    }

    pub fn entries(&self) -> Vec<Arc<HubManagerEntry>> {
        self.inner.lock().hubs.values().cloned().collect()
    }

    pub fn hub_ids(&self) -> Vec<HubId> {
        self.inner.lock().hubs.keys().copied().collect()
    }

    pub fn hub_count(&self) -> usize {
        self.inner.lock().hubs.len()
    }

    pub fn processing_hub(&self) -> Option<HubId> {
        self.inner.lock().processing_hub
    }

    /// Takes the gate for `hub` if no hub holds it.
    pub fn try_acquire(self: &Arc<Self>, hub: HubId) -> Option<GateGuard> {
        let mut inner = self.inner.lock();
        if inner.processing_hub.is_some() {
            return None;
        }
        inner.processing_hub = Some(hub);
        debug!("{hub} holds the port processing gate");
        Some(GateGuard {
            registry: Arc::downgrade(self),
            hub,
        })
    }
}

/// Ownership of the single-flight gate; dropping it opens the gate.
pub(crate) struct GateGuard {
    registry: Weak<Registry>,
    hub: HubId,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut inner = registry.inner.lock();
        if inner.processing_hub == Some(self.hub) {
            inner.processing_hub = None;
            debug!("{} released the port processing gate", self.hub);
        }
    }
}
