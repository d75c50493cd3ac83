mod control;
mod entry;
mod init;
mod manager;
mod monitor;
mod port;
mod registry;
mod teardown;

use core::fmt::{Debug, Display};

pub use entry::{HubSnapshot, HubState, InitState, PortSnapshot, PortState, PortStep};
pub use manager::HubManager;

/// Stable handle of a tracked hub; never reused while the manager lives.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HubId(pub(crate) u32);

impl HubId {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl Debug for HubId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "hub{}", self.0)
    }
}

impl Display for HubId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Path from the root port down to a device, one hub port per nibble.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteString(u32);

impl RouteString {
    /// Tiers a route string can describe.
    pub const MAX_TIERS: usize = 5;

    /// Route of a device attached directly to a root port.
    pub fn follow_root() -> Self {
        Self(0)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Hubs between the root port and the device.
    pub fn depth(&self) -> usize {
        self.route_port_ids().count()
    }

    /// Route of the device on `hub_port` of the hub this route leads to.
    pub fn child(&self, hub_port: u8) -> Option<Self> {
        if hub_port == 0 || hub_port > 15 {
            return None;
        }
        let depth = self.depth();
        if depth >= Self::MAX_TIERS {
            return None;
        }
        let shift = depth * 4;
        Some(Self(self.0 | ((hub_port as u32) << shift)))
    }

    pub fn route_port_ids(&self) -> impl Iterator<Item = u8> + '_ {
        (0..Self::MAX_TIERS)
            .map(move |depth| ((self.0 >> (depth * 4)) & 0x0F) as u8)
            .take_while(|port| *port != 0)
    }
}

impl Debug for RouteString {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut iter = self.route_port_ids();
        match iter.next() {
            Some(first) => {
                write!(f, "{first}")?;
                for port in iter {
                    write!(f, ".{port}")?;
                }
                Ok(())
            }
            None => write!(f, "root"),
        }
    }
}
