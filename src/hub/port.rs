//! Port state machine.
//!
//! Runs for the claimed port of a hub, one step per work item. Every hub
//! request is issued with the entry lock released; results are folded back
//! in afterwards and the next step recorded. Waiting for the reset to
//! complete suspends on the status change endpoint.

use alloc::sync::Arc;

use usb_if::{
    DeviceSpeed,
    host::hub::{PortChange, PortFeature, PortStatus},
};

use super::{
    HubManager,
    entry::{HubManagerEntry, PortEntry, PortState, PortStep, ProbeInfo},
};
use crate::{AttachInfo, DeviceId, ErrorKind, HubError, Result, TtAddress, queue::Step};

impl HubManager {
    pub(super) fn port_step(&self, entry: &Arc<HubManagerEntry>) -> Step {
        let (port, step) = {
            let state = entry.state.lock();
            if state.being_removed {
                return Step::Done;
            }
            let port = state.current_port();
            match state.port(port) {
                Some(p) => (port, p.step),
                None => return Step::Done,
            }
        };

        trace!("{}: port {} {:?}", entry.id, port, step);
        let result = match step {
            PortStep::WaitPortChange => {
                self.read_port_status(entry, port, PortStep::CheckCPortConnection)
            }
            PortStep::CheckCPortConnection => self.check_c_port_connection(entry, port),
            PortStep::GetPortConnection => {
                self.read_port_status(entry, port, PortStep::CheckPortConnection)
            }
            PortStep::CheckPortConnection => self.check_port_connection(entry, port),
            PortStep::WaitPortResetDone => {
                self.update_port(entry, port, |p| p.step = PortStep::WaitCPortReset);
                Ok(Step::Resubmit)
            }
            PortStep::WaitCPortReset => {
                self.read_port_status(entry, port, PortStep::CheckCPortReset)
            }
            PortStep::CheckCPortReset => self.check_c_port_reset(entry, port),
            PortStep::ResetAgain => self.reset_port(entry, port),
            PortStep::PortAttached => self.port_attached(entry, port),
            PortStep::CheckChildHub => self.check_child_hub(entry, port),
            PortStep::Invalid => Ok(Step::Done),
        };

        result.unwrap_or_else(|e| self.port_failed(entry, port, step, e))
    }

    /// Releases the port claim, and with it the gate, then listens again.
    pub(super) fn finish_port(&self, entry: &HubManagerEntry) {
        let claim = entry.state.lock().claim.take();
        if let Some(claim) = claim {
            debug!("{}: port {} settled", entry.id, claim.port);
        }
        self.arm_monitor(entry);
    }

    fn read_port_status(
        &self,
        entry: &HubManagerEntry,
        port: u8,
        next: PortStep,
    ) -> Result<Step> {
        let (status, change) = entry.instance.get_port_status(port)?;
        let stored = self.update_port(entry, port, |p| {
            p.status = status;
            p.change = change;
            p.step = next;
        });
        Ok(match stored {
            Some(()) => Step::Resubmit,
            None => Step::Done,
        })
    }

    /// Acknowledges one change bit per step, connection change first.
    fn check_c_port_connection(&self, entry: &HubManagerEntry, port: u8) -> Result<Step> {
        let Some((status, change, device, state)) =
            self.read_port(entry, port, |p| (p.status, p.change, p.device, p.state))
        else {
            return Ok(Step::Done);
        };

        if let Some((bit, feature)) = change.first_pending() {
            entry.instance.clear_port_feature(port, feature)?;
            let budget = self.config.reset_retries;
            self.update_port(entry, port, |p| {
                p.change.remove(bit);
                if bit == PortChange::C_CONNECTION {
                    // A fresh connection event gets a full reset budget.
                    p.reset_count = budget;
                    p.step = PortStep::GetPortConnection;
                }
            });
            if bit == PortChange::C_CONNECTION {
                debug!(
                    "{}: port {} connection change ({})",
                    entry.id,
                    port,
                    if status.contains(PortStatus::CONNECTION) {
                        "connected"
                    } else {
                        "disconnected"
                    }
                );
            } else if bit == PortChange::C_OVER_CURRENT {
                warn!(
                    "{}: port {} over-current {}",
                    entry.id,
                    port,
                    if status.contains(PortStatus::OVER_CURRENT) {
                        "detected"
                    } else {
                        "cleared"
                    }
                );
            } else {
                debug!("{}: port {} acknowledged {:?}", entry.id, port, feature);
            }
            return Ok(Step::Resubmit);
        }

        let connected = status.contains(PortStatus::CONNECTION);
        if !connected && device.is_some() {
            self.detach_port(entry, port);
            return Ok(Step::Done);
        }
        if connected
            && device.is_none()
            && matches!(state, PortState::Connected | PortState::Resetting)
        {
            // A connect cycle cut short by a failed request picks up here.
            self.update_port(entry, port, |p| p.step = PortStep::CheckPortConnection);
            return Ok(Step::Resubmit);
        }
        self.update_port(entry, port, |p| p.step = PortStep::WaitPortChange);
        Ok(Step::Done)
    }

    fn check_port_connection(&self, entry: &HubManagerEntry, port: u8) -> Result<Step> {
        let Some((status, device)) = self.read_port(entry, port, |p| (p.status, p.device)) else {
            return Ok(Step::Done);
        };

        if !status.contains(PortStatus::CONNECTION) {
            if device.is_none() {
                debug!("{}: port {} connection was transient", entry.id, port);
            }
            self.detach_port(entry, port);
            return Ok(Step::Done);
        }

        if let Some(stale) = device {
            info!(
                "{}: port {} reconnected, dropping stale {}",
                entry.id, port, stale
            );
            let budget = self.config.reset_retries;
            self.update_port(entry, port, |p| {
                p.device = None;
                p.reset_count = budget;
            });
            self.detach_device(stale);
        }

        self.update_port(entry, port, |p| p.state = PortState::Connected);
        self.reset_port(entry, port)
    }

    /// Issues PORT_RESET, spending one slot of the reset budget.
    fn reset_port(&self, entry: &HubManagerEntry, port: u8) -> Result<Step> {
        match self.read_port(entry, port, |p| p.reset_count) {
            None => return Ok(Step::Done),
            Some(0) => return Ok(self.disable_port(entry, port)),
            Some(_) => {}
        }

        entry.instance.set_port_feature(port, PortFeature::Reset)?;

        let left = self.update_port(entry, port, |p| {
            p.reset_count = p.reset_count.saturating_sub(1);
            p.state = PortState::Resetting;
            p.step = PortStep::WaitPortResetDone;
            p.reset_count
        });
        match left {
            Some(left) => {
                debug!("{}: port {} reset issued, {} left", entry.id, port, left);
                Ok(Step::Suspend)
            }
            None => Ok(Step::Done),
        }
    }

    fn check_c_port_reset(&self, entry: &HubManagerEntry, port: u8) -> Result<Step> {
        let Some((status, change)) = self.read_port(entry, port, |p| (p.status, p.change)) else {
            return Ok(Step::Done);
        };

        if !status.contains(PortStatus::CONNECTION) {
            debug!("{}: port {} device left during reset", entry.id, port);
            self.detach_port(entry, port);
            return Ok(Step::Done);
        }
        if !change.contains(PortChange::C_RESET) {
            // Reset still in progress; completion raises another change.
            self.update_port(entry, port, |p| p.step = PortStep::WaitPortResetDone);
            return Ok(Step::Suspend);
        }

        entry.instance.clear_port_feature(port, PortFeature::CReset)?;

        let completed = !status.contains(PortStatus::RESET) && status.contains(PortStatus::ENABLE);
        let next = self.update_port(entry, port, |p| {
            p.change.remove(PortChange::C_RESET);
            p.step = if completed {
                p.speed = status.speed();
                PortStep::PortAttached
            } else if p.reset_count > 0 {
                PortStep::ResetAgain
            } else {
                PortStep::Invalid
            };
            p.step
        });
        match next {
            Some(PortStep::Invalid) => Ok(self.disable_port(entry, port)),
            Some(PortStep::ResetAgain) => {
                debug!(
                    "{}: port {} reset did not enable the port, retrying",
                    entry.id, port
                );
                Ok(Step::Resubmit)
            }
            Some(_) => Ok(Step::Resubmit),
            None => Ok(Step::Done),
        }
    }

    /// Hands the reset device to the host stack, probing it as a hub when
    /// its interface asks for one.
    fn port_attached(&self, entry: &HubManagerEntry, port: u8) -> Result<Step> {
        let placement = {
            let state = entry.state.lock();
            if state.being_removed {
                return Ok(Step::Done);
            }
            state.port(port).map(|p| {
                (
                    p.speed,
                    state.speed,
                    state.route,
                    state.tt,
                    state.think_time,
                    state.hub_level,
                )
            })
        };
        let Some((speed, hub_speed, hub_route, hub_tt, think_time, hub_level)) = placement else {
            return Ok(Step::Done);
        };
        let Some(route) = hub_route.child(port) else {
            warn!("{}: port {} is beyond the route string", entry.id, port);
            return Ok(self.disable_port(entry, port));
        };

        let tt = if !speed.needs_tt() {
            None
        } else if hub_speed == DeviceSpeed::High {
            Some(TtAddress {
                hub: entry.dev,
                port,
            })
        } else {
            hub_tt
        };
        let info = AttachInfo {
            parent: entry.dev,
            port,
            speed,
            route,
            tt,
            think_time,
            hub_level: hub_level + 1,
        };

        let dev = self.host.device_alloc()?;
        if let Err(e) = self.host.device_connect(dev, &info) {
            self.host.device_disconnect(dev);
            return Err(e.into());
        }
        info!(
            "{}: port {} attached {} ({:?}, route {:?})",
            entry.id, port, dev, speed, route
        );

        let budget = self.config.reset_retries;
        let recorded = self.update_port(entry, port, |p| {
            p.device = Some(dev);
            p.state = PortState::Enabled;
            p.reset_count = budget;
            p.step = PortStep::WaitPortChange;
        });
        if recorded.is_none() {
            // The hub went away while the device was being connected.
            self.host.device_disconnect(dev);
            return Ok(Step::Done);
        }

        let Some(transport) = self.host.open_hub(dev) else {
            return Ok(Step::Done);
        };
        let probe = ProbeInfo {
            speed,
            route,
            tt,
            think_time,
        };
        match self.probe_hub(dev, transport, probe) {
            Ok(_) => {
                self.update_port(entry, port, |p| p.step = PortStep::CheckChildHub);
                Ok(Step::Resubmit)
            }
            Err(e) => {
                warn!("{dev}: left as a plain device: {e}");
                Ok(Step::Done)
            }
        }
    }

    fn check_child_hub(&self, entry: &HubManagerEntry, port: u8) -> Result<Step> {
        let device = self.read_port(entry, port, |p| p.device).flatten();
        let child = device.and_then(|dev| self.registry.find_by_device(dev));
        let Some(child) = child else {
            self.update_port(entry, port, |p| p.step = PortStep::WaitPortChange);
            return Ok(Step::Done);
        };

        match self.establish_parent_child(entry, &child, port) {
            Ok(()) => {
                self.update_port(entry, port, |p| p.step = PortStep::WaitPortChange);
            }
            Err(e) => {
                warn!("{}: port {} child hub rejected: {}", entry.id, port, e);
                self.update_port(entry, port, |p| {
                    p.device = None;
                    p.state = PortState::Error;
                    p.step = PortStep::Invalid;
                });
            }
        }
        Ok(Step::Done)
    }

    /// A failed hub request costs one slot of the reset budget; the cycle
    /// restarts after a delay while slots remain. Resource shortages cost
    /// nothing and retry the same step.
    fn port_failed(
        &self,
        entry: &HubManagerEntry,
        port: u8,
        step: PortStep,
        err: HubError,
    ) -> Step {
        let retry_delay = self.config.retry_delay;
        if err.kind() == ErrorKind::Resource {
            warn!("{}: port {} {:?} deferred: {}", entry.id, port, step, err);
            return match self.update_port(entry, port, |p| p.step = step) {
                Some(()) => Step::ResubmitAfter(retry_delay),
                None => Step::Done,
            };
        }

        warn!("{}: port {} {:?} failed: {}", entry.id, port, step, err);
        let next = self.update_port(entry, port, |p| {
            p.reset_count = p.reset_count.saturating_sub(1);
            if p.reset_count > 0 {
                p.step = PortStep::WaitPortChange;
                Step::ResubmitAfter(retry_delay)
            } else {
                p.state = PortState::Error;
                p.step = PortStep::Invalid;
                Step::Done
            }
        });
        match next {
            Some(Step::Done) => {
                warn!("{}: port {} disabled, retries exhausted", entry.id, port);
                Step::Done
            }
            Some(step) => step,
            None => Step::Done,
        }
    }

    fn disable_port(&self, entry: &HubManagerEntry, port: u8) -> Step {
        let budget = self.config.reset_retries;
        self.update_port(entry, port, |p| {
            p.state = PortState::Error;
            p.step = PortStep::Invalid;
        });
        warn!(
            "{}: port {} disabled after {} reset attempts",
            entry.id, port, budget
        );
        Step::Done
    }

    /// Clears the port and releases whatever was attached to it.
    fn detach_port(&self, entry: &HubManagerEntry, port: u8) {
        let budget = self.config.reset_retries;
        let device = self.update_port(entry, port, |p| p.clear(budget)).flatten();
        if let Some(dev) = device {
            self.detach_device(dev);
        }
    }

    /// A hub below us is torn down with everything under it; any other
    /// device goes straight back to the host stack.
    fn detach_device(&self, dev: DeviceId) {
        match self.registry.find_by_device(dev) {
            Some(child) => {
                info!("{dev}: hub {} unplugged", child.id);
                self.recursive_disconnect(&child, true);
            }
            None => {
                info!("{dev}: disconnected");
                self.host.device_disconnect(dev);
            }
        }
    }

    fn read_port<R>(
        &self,
        entry: &HubManagerEntry,
        port: u8,
        f: impl FnOnce(&PortEntry) -> R,
    ) -> Option<R> {
        let state = entry.state.lock();
        if state.being_removed {
            return None;
        }
        state.port(port).map(f)
    }

    /// Applies `f` to the port unless the hub is being torn down.
    fn update_port<R>(
        &self,
        entry: &HubManagerEntry,
        port: u8,
        f: impl FnOnce(&mut PortEntry) -> R,
    ) -> Option<R> {
        let mut state = entry.state.lock();
        if state.being_removed {
            return None;
        }
        state.port_mut(port).map(f)
    }
}
