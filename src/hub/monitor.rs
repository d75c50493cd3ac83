//! Status change endpoint monitor and dispatcher.
//!
//! Each operational hub keeps one interrupt-IN read outstanding. Its bitmap
//! has bit 0 for the hub and bit n for port n. Port bits are only acted on
//! while the single-flight gate is free or already held by the same hub for
//! that port; the rest stay pending in hardware and are reported again.

use alloc::vec::Vec;
use core::task::{Context, Poll};

use futures::task::waker_ref;
use usb_if::{
    err::TransferError,
    host::hub::{HubChange, HubFeature, HubStatus},
};

use super::{
    HubId, HubManager,
    entry::{HubManagerEntry, HubState, PortClaim, PortStep},
};
use crate::{Result, queue::Work};

impl HubManager {
    /// Queues the status change read unless one is outstanding or the hub
    /// is going away.
    pub(super) fn arm_monitor(&self, entry: &HubManagerEntry) {
        let mut state = entry.state.lock();
        if state.being_removed || state.interrupt.is_some() {
            return;
        }
        let len = state.bitmap_len();
        match entry.instance.submit_interrupt(len) {
            Ok(xfer) => {
                state.interrupt = Some(xfer);
                trace!("{}: status change read armed ({} bytes)", entry.id, len);
            }
            Err(e) => {
                drop(state);
                warn!("{}: cannot queue status change read: {}", entry.id, e);
                self.submit_after(self.config.rearm_delay, Work::Rearm(entry.id));
            }
        }
    }

    /// Polls every outstanding status change read; completions are queued.
    pub(super) fn poll_transfers(&self) -> usize {
        let waker = waker_ref(&self.queue);
        let mut cx = Context::from_waker(&waker);
        let mut completed = 0;
        for entry in self.registry.entries() {
            let result = {
                let mut state = entry.state.lock();
                let Some(xfer) = state.interrupt.as_mut() else {
                    continue;
                };
                match xfer.as_mut().poll(&mut cx) {
                    Poll::Ready(result) => {
                        state.interrupt = None;
                        result
                    }
                    Poll::Pending => continue,
                }
            };
            self.submit(Work::Interrupt {
                hub: entry.id,
                result,
            });
            completed += 1;
        }
        completed
    }

    pub(super) fn on_interrupt(
        &self,
        hub: HubId,
        result: core::result::Result<Vec<u8>, TransferError>,
    ) {
        let Some(entry) = self.registry.get(hub) else {
            trace!("{hub}: status change for a removed hub dropped");
            return;
        };
        let (operational, num_ports) = {
            let state = entry.state.lock();
            if state.being_removed {
                return;
            }
            (state.state == HubState::Operational, state.num_ports)
        };

        let bitmap = match result {
            Ok(bitmap) => bitmap,
            Err(e) => {
                debug!("{hub}: status change read failed: {e}");
                self.arm_monitor(&entry);
                return;
            }
        };
        if !operational {
            self.arm_monitor(&entry);
            return;
        }

        trace!("{hub}: status change bitmap {:02x?}", bitmap);
        for bit in changed_bits(&bitmap, num_ports) {
            if bit == 0 {
                if let Err(e) = self.hub_status_change(&entry) {
                    warn!("{hub}: hub status handling failed: {e}");
                }
                continue;
            }
            if self.claim_port(&entry, bit) {
                self.submit_port(&entry);
                return;
            }
            trace!(
                "{hub}: port {bit} change deferred, gate held by {:?}",
                self.registry.processing_hub()
            );
        }
        self.arm_monitor(&entry);
    }

    /// Takes (or confirms) the gate for `port` of this hub.
    fn claim_port(&self, entry: &HubManagerEntry, port: u8) -> bool {
        let mut state = entry.state.lock();
        if state.being_removed || state.port(port).is_none() {
            return false;
        }
        if let Some(claim) = state.claim.as_ref() {
            return claim.port == port;
        }
        let Some(gate) = self.registry.try_acquire(entry.id) else {
            return false;
        };
        state.claim = Some(PortClaim { port, _gate: gate });
        if let Some(p) = state.port_mut(port) {
            if p.step == PortStep::Invalid {
                p.step = PortStep::WaitPortChange;
            }
        }
        debug!("{}: processing port {}", entry.id, port);
        true
    }

    /// Acknowledges hub-level changes; nothing else acts on them here.
    fn hub_status_change(&self, entry: &HubManagerEntry) -> Result {
        let (status, change) = entry.instance.get_hub_status()?;
        if change.contains(HubChange::C_LOCAL_POWER) {
            warn!(
                "{}: local power {}",
                entry.id,
                if status.contains(HubStatus::LOCAL_POWER) {
                    "lost"
                } else {
                    "good"
                }
            );
            entry
                .instance
                .clear_hub_feature(HubFeature::CHubLocalPower)?;
        }
        if change.contains(HubChange::C_OVER_CURRENT) {
            warn!(
                "{}: over-current {}",
                entry.id,
                if status.contains(HubStatus::OVER_CURRENT) {
                    "detected"
                } else {
                    "cleared"
                }
            );
            entry
                .instance
                .clear_hub_feature(HubFeature::CHubOverCurrent)?;
        }
        Ok(())
    }
}

/// Set bits of the status change bitmap, hub bit first.
fn changed_bits(bitmap: &[u8], num_ports: u8) -> impl Iterator<Item = u8> + '_ {
    (0..=num_ports).filter(move |bit| {
        bitmap
            .get(*bit as usize / 8)
            .is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
    })
}
