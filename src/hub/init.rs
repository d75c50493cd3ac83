//! Hub init state machine: descriptor, port power, operational.
//!
//! `WaitSetInterface -> GetDescriptor7 -> SetPortPower -> Idle`, with
//! `Invalid` on any failure. A failing hub is left inert until removed.

use alloc::sync::Arc;

use usb_if::{
    DeviceSpeed,
    host::hub::{HUB_DESCRIPTOR_HEADER_LEN, HubDescriptor, PortFeature},
};

use super::{
    HubManager,
    entry::{HubManagerEntry, HubState, InitState, PortEntry},
};
use crate::{ErrorKind, HubError, Result, config::MAX_PORTS, queue::Step};

impl HubManager {
    pub(super) fn init_step(&self, entry: &Arc<HubManagerEntry>) -> Step {
        let (hub_status, cursor) = {
            let state = entry.state.lock();
            if state.being_removed {
                return Step::Done;
            }
            (state.hub_status, state.power_cursor)
        };

        trace!("{}: init step {:?}", entry.id, hub_status);
        let result = match hub_status {
            InitState::WaitSetInterface => self.init_read_header(entry),
            InitState::GetDescriptor7 => self.init_read_descriptor(entry),
            InitState::SetPortPower => self.init_power_port(entry, cursor),
            InitState::Idle | InitState::Invalid => return Step::Done,
        };

        match result {
            Ok(step) => step,
            Err(e) if e.kind() == ErrorKind::Resource => {
                warn!("{}: init {:?} deferred: {}", entry.id, hub_status, e);
                Step::ResubmitAfter(self.config.retry_delay)
            }
            Err(e) => {
                error!("{}: init failed in {:?}: {}", entry.id, hub_status, e);
                let mut state = entry.state.lock();
                state.state = HubState::Error;
                state.hub_status = InitState::Invalid;
                Step::Done
            }
        }
    }

    /// Reads enough of the descriptor to learn `bNbrPorts`.
    fn init_read_header(&self, entry: &HubManagerEntry) -> Result<Step> {
        entry.state.lock().state = HubState::GetDescriptor;
        entry
            .instance
            .get_hub_descriptor(HUB_DESCRIPTOR_HEADER_LEN)?;
        entry.state.lock().hub_status = InitState::GetDescriptor7;
        Ok(Step::Resubmit)
    }

    fn init_read_descriptor(&self, entry: &HubManagerEntry) -> Result<Step> {
        let header = entry.instance.last_descriptor();
        let num_ports = HubDescriptor::peek_num_ports(&header)?;
        if num_ports == 0 || num_ports > MAX_PORTS {
            return Err(HubError::PortCount(num_ports));
        }
        let think_time = HubDescriptor::parse(&header)?
            .characteristics
            .tt_think_time as u16;

        let raw = entry
            .instance
            .get_hub_descriptor(HubDescriptor::full_len(num_ports))?;
        let descriptor = HubDescriptor::parse(&raw)?;

        let mut state = entry.state.lock();
        debug!(
            "{}: {} ports, characteristics {:?}, power good after {} ms",
            entry.id,
            num_ports,
            descriptor.characteristics,
            descriptor.power_good_time as u32 * 2
        );
        state.num_ports = num_ports;
        // Only a high-speed hub carries a translator of its own.
        if state.speed == DeviceSpeed::High {
            state.think_time = state.upstream_think_time + think_time;
        }
        state.descriptor = Some(descriptor);
        state.state = HubState::PowerPorts;
        state.hub_status = InitState::SetPortPower;
        Ok(Step::Resubmit)
    }

    /// Powers one port per step so the queue is never held for the loop.
    fn init_power_port(&self, entry: &HubManagerEntry, port: u8) -> Result<Step> {
        let budget = self.config.reset_retries;
        {
            let mut state = entry.state.lock();
            if state.ports.is_empty() {
                let num_ports = state.num_ports;
                state
                    .ports
                    .try_reserve_exact(num_ports as usize)
                    .map_err(|_| HubError::NoMemory)?;
                state
                    .ports
                    .extend((1..=num_ports).map(|n| PortEntry::new(n, budget)));
            }
        }

        entry.instance.set_port_feature(port, PortFeature::Power)?;
        debug!("{}: port {} powered", entry.id, port);

        let mut state = entry.state.lock();
        state.power_cursor = port + 1;
        if port < state.num_ports {
            return Ok(Step::Resubmit);
        }

        for p in state.ports.iter_mut() {
            p.clear(budget);
        }
        state.state = HubState::Operational;
        state.hub_status = InitState::Idle;
        let num_ports = state.num_ports;
        drop(state);

        info!("{}: operational with {} ports", entry.id, num_ports);
        self.arm_monitor(entry);
        Ok(Step::Done)
    }
}
