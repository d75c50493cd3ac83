#![cfg_attr(not(test), no_std)]
#![doc = "Hub topology and port state machines for an embedded USB host."]

extern crate alloc;

#[macro_use]
extern crate log;

pub mod config;
pub mod err;
pub mod host;
pub mod hub;
pub mod osal;
mod queue;

pub use config::HubConfig;
pub use err::{ErrorKind, HubError, Result};
pub use host::{AttachInfo, DeviceId, HostDriver, TtAddress};
pub use hub::{
    HubId, HubManager, HubSnapshot, HubState, InitState, PortSnapshot, PortState, PortStep,
    RouteString,
};
pub use osal::Kernel;
pub use usb_if;
