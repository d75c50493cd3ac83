//! Hub class requests over the hub's default control pipe.
//!
//! Every request holds the channel lock until its completion arrives, so a
//! hub never has more than one control request outstanding. Callers own any
//! retry policy.

use alloc::{boxed::Box, vec::Vec};

use spin_on::spin_on;
use usb_if::host::{
    HubTransport, InterruptTransfer,
    hub::{
        HubChange, HubFeature, HubRequest, HubStatus, PortChange, PortFeature, PortStatus,
        STATUS_LEN,
    },
};

use crate::{DeviceId, HubError, Result};

pub(crate) struct HubInstance {
    dev: DeviceId,
    channel: spin::Mutex<Channel>,
}

struct Channel {
    transport: Box<dyn HubTransport>,
    /// Last hub descriptor read.
    hub_desc: Vec<u8>,
    hub_status: (HubStatus, HubChange),
}

impl HubInstance {
    pub fn new(dev: DeviceId, transport: Box<dyn HubTransport>) -> Self {
        Self {
            dev,
            channel: spin::Mutex::new(Channel {
                transport,
                hub_desc: Vec::new(),
                hub_status: (HubStatus::empty(), HubChange::empty()),
            }),
        }
    }

    /// Reads the first `len` bytes of the hub class descriptor.
    pub fn get_hub_descriptor(&self, len: usize) -> Result<Vec<u8>> {
        let mut channel = self.channel.lock();
        let buf = channel.control_in(HubRequest::GetHubDescriptor, 0, 0, len)?;
        trace!("{}: hub descriptor {:02x?}", self.dev, buf);
        channel.hub_desc.clone_from(&buf);
        Ok(buf)
    }

    pub fn get_hub_status(&self) -> Result<(HubStatus, HubChange)> {
        let mut channel = self.channel.lock();
        let buf = channel.control_in(HubRequest::GetHubStatus, 0, 0, STATUS_LEN)?;
        let status = HubStatus::decode([buf[0], buf[1], buf[2], buf[3]]);
        trace!("{}: hub status {:?}", self.dev, status);
        channel.hub_status = status;
        Ok(status)
    }

    pub fn get_port_status(&self, port: u8) -> Result<(PortStatus, PortChange)> {
        let mut channel = self.channel.lock();
        let buf = channel.control_in(HubRequest::GetPortStatus, 0, port, STATUS_LEN)?;
        let status = PortStatus::decode([buf[0], buf[1], buf[2], buf[3]]);
        trace!("{}: port {} status {:?}", self.dev, port, status);
        Ok(status)
    }

    pub fn set_port_feature(&self, port: u8, feature: PortFeature) -> Result {
        trace!("{}: port {} set {:?}", self.dev, port, feature);
        self.channel
            .lock()
            .control_out(HubRequest::SetPortFeature, feature.into(), port)
    }

    pub fn clear_port_feature(&self, port: u8, feature: PortFeature) -> Result {
        trace!("{}: port {} clear {:?}", self.dev, port, feature);
        self.channel
            .lock()
            .control_out(HubRequest::ClearPortFeature, feature.into(), port)
    }

    pub fn clear_hub_feature(&self, feature: HubFeature) -> Result {
        trace!("{}: clear {:?}", self.dev, feature);
        self.channel
            .lock()
            .control_out(HubRequest::ClearHubFeature, feature.into(), 0)
    }

    /// Queues a read of the status change endpoint.
    pub fn submit_interrupt(&self, len: usize) -> Result<InterruptTransfer> {
        Ok(self.channel.lock().transport.interrupt_in(len)?)
    }

    /// Last hub descriptor bytes read.
    pub fn last_descriptor(&self) -> Vec<u8> {
        self.channel.lock().hub_desc.clone()
    }

    pub fn last_hub_status(&self) -> (HubStatus, HubChange) {
        self.channel.lock().hub_status
    }
}

impl Channel {
    fn control_in(
        &mut self,
        request: HubRequest,
        value: u16,
        port: u8,
        len: usize,
    ) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|_| HubError::NoMemory)?;
        buf.resize(len, 0);

        let setup = request.setup(value, port);
        let n = spin_on(self.transport.control_in(setup, &mut buf)?)?;
        if n < len {
            return Err(HubError::ShortResponse {
                expected: len,
                actual: n,
            });
        }
        Ok(buf)
    }

    fn control_out(&mut self, request: HubRequest, value: u16, port: u8) -> Result {
        let setup = request.setup(value, port);
        spin_on(self.transport.control_out(setup, &[])?)?;
        Ok(())
    }
}
