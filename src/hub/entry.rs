//! Per-hub bookkeeping shared by the state machines.

use alloc::{collections::btree_set::BTreeSet, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use usb_if::{
    DeviceSpeed,
    host::{
        InterruptTransfer,
        hub::{HubChange, HubDescriptor, HubStatus, PortChange, PortStatus},
    },
};

use super::{HubId, RouteString, control::HubInstance, registry::GateGuard};
use crate::{DeviceId, TtAddress};

/// Top-level hub state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Init,
    GetDescriptor,
    PowerPorts,
    Operational,
    Error,
}

/// Init state machine position, meaningful until the hub is operational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    WaitSetInterface,
    GetDescriptor7,
    SetPortPower,
    Idle,
    Invalid,
}

/// Coarse port state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Disconnected,
    Connected,
    Resetting,
    Enabled,
    Suspended,
    Error,
}

/// Port state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStep {
    WaitPortChange,
    CheckCPortConnection,
    GetPortConnection,
    CheckPortConnection,
    WaitPortResetDone,
    WaitCPortReset,
    CheckCPortReset,
    ResetAgain,
    PortAttached,
    CheckChildHub,
    Invalid,
}

pub(crate) struct PortEntry {
    pub number: u8,
    pub device: Option<DeviceId>,
    pub step: PortStep,
    pub state: PortState,
    pub reset_count: u8,
    pub speed: DeviceSpeed,
    /// Last status read for this port.
    pub status: PortStatus,
    /// Change bits from the last read not yet acknowledged.
    pub change: PortChange,
}

impl PortEntry {
    pub fn new(number: u8, reset_budget: u8) -> Self {
        Self {
            number,
            device: None,
            step: PortStep::WaitPortChange,
            state: PortState::Disconnected,
            reset_count: reset_budget,
            speed: DeviceSpeed::Full,
            status: PortStatus::empty(),
            change: PortChange::empty(),
        }
    }

    /// Back to DISCONNECTED, handing out the device that was attached.
    pub fn clear(&mut self, reset_budget: u8) -> Option<DeviceId> {
        let device = self.device.take();
        *self = Self::new(self.number, reset_budget);
        device
    }

    pub fn snapshot(&self) -> PortSnapshot {
        PortSnapshot {
            number: self.number,
            device: self.device,
            state: self.state,
            step: self.step,
            reset_count: self.reset_count,
            speed: self.speed,
            status: self.status,
            change: self.change,
        }
    }
}

/// The port a hub is working on; holding it holds the single-flight gate.
pub(crate) struct PortClaim {
    pub port: u8,
    pub _gate: GateGuard,
}

/// Placement of a hub being probed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProbeInfo {
    pub speed: DeviceSpeed,
    pub route: RouteString,
    pub tt: Option<TtAddress>,
    pub think_time: u16,
}

impl ProbeInfo {
    pub fn root(speed: DeviceSpeed) -> Self {
        Self {
            speed,
            route: RouteString::follow_root(),
            tt: None,
            think_time: 0,
        }
    }
}

pub(crate) struct HubManagerEntry {
    pub id: HubId,
    pub dev: DeviceId,
    pub instance: HubInstance,
    init_pending: AtomicBool,
    port_pending: AtomicBool,
    pub state: spin::Mutex<EntryState>,
}

pub(crate) struct EntryState {
    pub hub_level: u8,
    pub parent: Option<HubId>,
    pub parent_port: u8,
    pub children: BTreeSet<HubId>,
    pub speed: DeviceSpeed,
    pub route: RouteString,
    /// Translator serving this hub's own traffic, if any.
    pub tt: Option<TtAddress>,
    /// Think time inherited from the hubs above.
    pub upstream_think_time: u16,
    /// Think time passed down to devices on this hub's ports.
    pub think_time: u16,
    pub descriptor: Option<HubDescriptor>,
    pub num_ports: u8,
    pub ports: Vec<PortEntry>,
    pub state: HubState,
    pub hub_status: InitState,
    /// Next port to power while in `SetPortPower`.
    pub power_cursor: u8,
    pub interrupt: Option<InterruptTransfer>,
    pub claim: Option<PortClaim>,
    pub being_removed: bool,
    /// A teardown walk has taken ownership of this entry.
    pub teardown: bool,
}

impl HubManagerEntry {
    pub fn new(id: HubId, dev: DeviceId, instance: HubInstance, info: ProbeInfo) -> Self {
        Self {
            id,
            dev,
            instance,
            init_pending: AtomicBool::new(false),
            port_pending: AtomicBool::new(false),
            state: spin::Mutex::new(EntryState {
                hub_level: 1,
                parent: None,
                parent_port: 0,
                children: BTreeSet::new(),
                speed: info.speed,
                route: info.route,
                tt: info.tt,
                upstream_think_time: info.think_time,
                think_time: info.think_time,
                descriptor: None,
                num_ports: 0,
                ports: Vec::new(),
                state: HubState::Init,
                hub_status: InitState::WaitSetInterface,
                power_cursor: 1,
                interrupt: None,
                claim: None,
                being_removed: false,
                teardown: false,
            }),
        }
    }

    /// Marks init work as queued; false if it already was.
    pub fn queue_init(&self) -> bool {
        !self.init_pending.swap(true, Ordering::AcqRel)
    }

    /// Consumes the queued init work; false if it was cancelled.
    pub fn take_init(&self) -> bool {
        self.init_pending.swap(false, Ordering::AcqRel)
    }

    pub fn queue_port(&self) -> bool {
        !self.port_pending.swap(true, Ordering::AcqRel)
    }

    pub fn take_port(&self) -> bool {
        self.port_pending.swap(false, Ordering::AcqRel)
    }

    /// Drops both state machines' queued work.
    pub fn cancel_work(&self) {
        self.init_pending.store(false, Ordering::Release);
        self.port_pending.store(false, Ordering::Release);
    }

    pub fn snapshot(&self) -> HubSnapshot {
        let state = self.state.lock();
        let (hub_status, hub_change) = self.instance.last_hub_status();
        HubSnapshot {
            id: self.id,
            device: self.dev,
            hub_level: state.hub_level,
            parent: state.parent,
            parent_port: state.parent_port,
            children: state.children.iter().copied().collect(),
            speed: state.speed,
            route: state.route,
            think_time: state.think_time,
            descriptor: state.descriptor.clone(),
            num_ports: state.num_ports,
            ports: state.ports.iter().map(PortEntry::snapshot).collect(),
            state: state.state,
            init_state: state.hub_status,
            hub_status,
            hub_change,
            current_port: state.current_port(),
            interrupt_armed: state.interrupt_active(),
            being_removed: state.being_removed,
        }
    }
}

impl EntryState {
    /// Port the hub is processing, 0 when idle.
    pub fn current_port(&self) -> u8 {
        self.claim.as_ref().map(|c| c.port).unwrap_or(0)
    }

    pub fn interrupt_active(&self) -> bool {
        self.interrupt.is_some()
    }

    pub fn port_mut(&mut self, port: u8) -> Option<&mut PortEntry> {
        if port == 0 {
            return None;
        }
        self.ports.get_mut(port as usize - 1)
    }

    pub fn port(&self, port: u8) -> Option<&PortEntry> {
        if port == 0 {
            return None;
        }
        self.ports.get(port as usize - 1)
    }

    /// Bytes in the status change bitmap: bit 0 for the hub, one per port.
    pub fn bitmap_len(&self) -> usize {
        (self.num_ports as usize + 1).div_ceil(8)
    }
}

/// Point-in-time copy of a hub's state.
#[derive(Debug, Clone)]
pub struct HubSnapshot {
    pub id: HubId,
    pub device: DeviceId,
    pub hub_level: u8,
    pub parent: Option<HubId>,
    pub parent_port: u8,
    pub children: Vec<HubId>,
    pub speed: DeviceSpeed,
    pub route: RouteString,
    pub think_time: u16,
    pub descriptor: Option<HubDescriptor>,
    pub num_ports: u8,
    pub ports: Vec<PortSnapshot>,
    pub state: HubState,
    pub init_state: InitState,
    /// Last hub status read on the control channel.
    pub hub_status: HubStatus,
    pub hub_change: HubChange,
    pub current_port: u8,
    pub interrupt_armed: bool,
    pub being_removed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSnapshot {
    pub number: u8,
    pub device: Option<DeviceId>,
    pub state: PortState,
    pub step: PortStep,
    pub reset_count: u8,
    pub speed: DeviceSpeed,
    pub status: PortStatus,
    pub change: PortChange,
}
