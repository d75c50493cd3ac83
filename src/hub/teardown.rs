//! Parent/child links and recursive teardown.
//!
//! Teardown walks the tree with an explicit stack so the depth of the chain
//! never shows up on the call stack. Children are finished before their
//! parent, and every device is disconnected exactly once.

use alloc::{sync::Arc, vec, vec::Vec};

use super::{HubId, HubManager, entry::HubManagerEntry};
use crate::{DeviceId, HubError, Result};

enum Visit {
    Hub(Arc<HubManagerEntry>),
    Leaf(DeviceId),
    Finish(Arc<HubManagerEntry>),
}

impl HubManager {
    /// Links a freshly probed hub below `parent`, or tears it down when it
    /// would sit deeper than the configured chain depth.
    pub(super) fn establish_parent_child(
        &self,
        parent: &HubManagerEntry,
        child: &Arc<HubManagerEntry>,
        port: u8,
    ) -> Result {
        let level = parent.state.lock().hub_level + 1;
        let max = self.config.max_depth;
        if level > max {
            warn!(
                "{}: {} on port {} would be hub level {}, limit is {}",
                parent.id, child.id, port, level, max
            );
            self.recursive_disconnect(child, true);
            return Err(HubError::DepthExceeded { level, max });
        }

        {
            let mut state = child.state.lock();
            state.hub_level = level;
            state.parent = Some(parent.id);
            state.parent_port = port;
        }
        parent.state.lock().children.insert(child.id);
        debug!(
            "{}: {} linked on port {} at level {}",
            parent.id, child.id, port, level
        );
        Ok(())
    }

    /// Removes `top` and everything below it.
    ///
    /// Devices below `top` are always disconnected; `top`'s own device only
    /// when `disconnect_self` is set. Returns false if another teardown
    /// already owns `top`.
    pub(super) fn recursive_disconnect(
        &self,
        top: &Arc<HubManagerEntry>,
        disconnect_self: bool,
    ) -> bool {
        let mut removed = false;
        let mut stack = vec![Visit::Hub(top.clone())];

        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Hub(entry) => {
                    let Some((devices, children)) = self.begin_teardown(&entry) else {
                        continue;
                    };
                    if Arc::ptr_eq(&entry, top) {
                        removed = true;
                    }
                    stack.push(Visit::Finish(entry));

                    let mut below = Vec::with_capacity(devices.len());
                    for dev in devices {
                        match self.registry.find_by_device(dev) {
                            Some(hub) => below.push(Visit::Hub(hub)),
                            None => below.push(Visit::Leaf(dev)),
                        }
                    }
                    for id in children {
                        let linked = below
                            .iter()
                            .any(|v| matches!(v, Visit::Hub(hub) if hub.id == id));
                        if !linked {
                            if let Some(hub) = self.registry.get(id) {
                                below.push(Visit::Hub(hub));
                            }
                        }
                    }
                    // Lowest port first.
                    stack.extend(below.into_iter().rev());
                }
                Visit::Leaf(dev) => {
                    debug!("{dev}: disconnected with its hub");
                    self.host.device_disconnect(dev);
                }
                Visit::Finish(entry) => {
                    let disconnect = disconnect_self || !Arc::ptr_eq(&entry, top);
                    self.finish_teardown(&entry, disconnect);
                }
            }
        }
        removed
    }

    /// Stops all activity on the hub and empties its ports; hands back the
    /// devices that were attached and the linked child hubs.
    fn begin_teardown(&self, entry: &HubManagerEntry) -> Option<(Vec<DeviceId>, Vec<HubId>)> {
        let budget = self.config.reset_retries;
        let (devices, children, interrupt, claim) = {
            let mut state = entry.state.lock();
            if state.teardown {
                return None;
            }
            state.teardown = true;
            state.being_removed = true;
            let devices: Vec<DeviceId> = state
                .ports
                .iter_mut()
                .filter_map(|p| p.clear(budget))
                .collect();
            let children: Vec<HubId> = state.children.iter().copied().collect();
            (devices, children, state.interrupt.take(), state.claim.take())
        };
        entry.cancel_work();

        // Dropping these dequeues the status change read and opens the gate.
        drop(interrupt);
        drop(claim);

        debug!(
            "{}: tearing down, {} devices attached",
            entry.id,
            devices.len()
        );
        Some((devices, children))
    }

    fn finish_teardown(&self, entry: &HubManagerEntry, disconnect_device: bool) {
        let removed = self.registry.remove(entry.id);

        let (parent, parent_port) = {
            let state = entry.state.lock();
            (state.parent, state.parent_port)
        };
        if let Some(parent) = parent.and_then(|id| self.registry.get(id)) {
            let budget = self.config.reset_retries;
            let mut state = parent.state.lock();
            state.children.remove(&entry.id);
            if !state.teardown {
                if let Some(p) = state.port_mut(parent_port) {
                    if p.device == Some(entry.dev) {
                        p.clear(budget);
                    }
                }
            }
        }

        if disconnect_device {
            self.host.device_disconnect(entry.dev);
        }
        info!("{}: removed ({})", entry.id, entry.dev);
        drop(removed);
    }
}
