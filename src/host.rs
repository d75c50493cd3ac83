//! Device enumeration collaborator consumed by the hub manager.

use core::fmt::{Debug, Display};

use alloc::boxed::Box;
use usb_if::{DeviceSpeed, host::HubTransport, host::USBError};

use crate::hub::RouteString;

/// Opaque handle of a device owned by the host stack.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl Debug for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Transaction translator serving a low/full-speed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtAddress {
    /// High-speed hub that owns the translator.
    pub hub: DeviceId,
    /// Port on that hub the device sits behind.
    pub port: u8,
}

/// Where and how a newly detected device is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachInfo {
    pub parent: DeviceId,
    pub port: u8,
    pub speed: DeviceSpeed,
    pub route: RouteString,
    pub tt: Option<TtAddress>,
    /// Accumulated TT think time, in full-speed bit times.
    pub think_time: u16,
    /// Tier of the new device; its parent hub's level plus one.
    pub hub_level: u8,
}

/// The rest of the USB host stack, as seen from the hub manager.
pub trait HostDriver: Send + Sync {
    /// Reserves a device slot for a freshly reset port.
    fn device_alloc(&self) -> Result<DeviceId, USBError>;

    /// Addresses, configures and binds `dev`.
    fn device_connect(&self, dev: DeviceId, info: &AttachInfo) -> Result<(), USBError>;

    /// Tears down `dev` and releases its slot.
    fn device_disconnect(&self, dev: DeviceId);

    /// Pipes of `dev` when its interface matched the hub class.
    fn open_hub(&self, dev: DeviceId) -> Option<Box<dyn HubTransport>>;
}
