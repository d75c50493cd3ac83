#![allow(dead_code)]

//! Simulated host stack and hub hardware for driving the manager in tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    future::{Future, ready},
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll, Waker},
    time::Duration,
};

use crab_usb_hub::{
    AttachInfo, DeviceId, HostDriver, HubConfig, HubId, HubManager, Kernel, RouteString,
    usb_if::{
        DeviceSpeed,
        err::TransferError,
        host::{
            HubTransport, InterruptTransfer, ResultTransfer, USBError,
            hub::{
                HUB_DESCRIPTOR_TYPE, HubChange, HubCharacteristics, HubDescriptor, HubFeature,
                HubStatus, OverCurrentMode, PortChange, PortFeature, PortStatus,
                PowerSwitchingMode,
            },
        },
        transfer::{ControlSetup, Recipient, Request},
    },
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
pub struct FakeClock {
    micros: AtomicU64,
}

impl FakeClock {
    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Kernel for FakeClock {
    fn uptime(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HubModel {
    pub num_ports: u8,
    pub speed: DeviceSpeed,
    /// TT think time advertised in the descriptor, in bit times.
    pub think_time: u8,
}

impl HubModel {
    pub fn new(num_ports: u8) -> Self {
        Self {
            num_ports,
            speed: DeviceSpeed::High,
            think_time: 8,
        }
    }

    pub fn full_speed(mut self) -> Self {
        self.speed = DeviceSpeed::Full;
        self
    }

    pub fn think_time(mut self, think_time: u8) -> Self {
        self.think_time = think_time;
        self
    }

    fn descriptor(&self) -> Vec<u8> {
        let characteristics = HubCharacteristics {
            power_switching: PowerSwitchingMode::Individual,
            compound_device: false,
            over_current_mode: OverCurrentMode::Individual,
            tt_think_time: self.think_time,
            port_indicators: false,
        }
        .to_descriptor()
        .to_le_bytes();
        let len = HubDescriptor::full_len(self.num_ports);
        let mut raw = vec![
            len as u8,
            HUB_DESCRIPTOR_TYPE,
            self.num_ports,
            characteristics[0],
            characteristics[1],
            50,
            100,
        ];
        raw.resize(len - 1, 0);
        raw.push(0xff);
        raw
    }
}

/// What sits on the far end of a simulated port.
#[derive(Debug, Clone, Copy)]
pub enum Plug {
    Device(DeviceSpeed),
    Hub(HubModel),
}

impl Plug {
    fn speed(&self) -> DeviceSpeed {
        match self {
            Plug::Device(speed) => *speed,
            Plug::Hub(model) => model.speed,
        }
    }
}

#[derive(Default)]
struct SimPort {
    status: PortStatus,
    change: PortChange,
    plug: Option<Plug>,
    device: Option<DeviceId>,
    stuck_reset: bool,
}

struct SimHub {
    model: HubModel,
    ports: Vec<SimPort>,
    status: HubStatus,
    change: HubChange,
    present: bool,
    fail_requests: usize,
    refuse_interrupts: usize,
    outstanding: usize,
    read_waker: Option<Waker>,
}

impl SimHub {
    fn new(model: HubModel) -> Self {
        Self {
            model,
            ports: (0..model.num_ports).map(|_| SimPort::default()).collect(),
            status: HubStatus::empty(),
            change: HubChange::empty(),
            present: true,
            fail_requests: 0,
            refuse_interrupts: 0,
            outstanding: 0,
            read_waker: None,
        }
    }

    fn port(&mut self, port: u16) -> Option<&mut SimPort> {
        (port as usize)
            .checked_sub(1)
            .and_then(|i| self.ports.get_mut(i))
    }

    /// Completes the pending status change read, if anyone is waiting on it.
    fn raise(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn bitmap(&self, len: usize) -> Option<Vec<u8>> {
        let mut bitmap = vec![0u8; len];
        let mut any = false;
        let mut set = |bit: usize| {
            if let Some(byte) = bitmap.get_mut(bit / 8) {
                *byte |= 1 << (bit % 8);
                any = true;
            }
        };
        if !self.change.is_empty() {
            set(0);
        }
        for (i, port) in self.ports.iter().enumerate() {
            if !port.change.is_empty() {
                set(i + 1);
            }
        }
        any.then_some(bitmap)
    }
}

fn speed_bits(speed: DeviceSpeed) -> PortStatus {
    match speed {
        DeviceSpeed::Low => PortStatus::LOW_SPEED,
        DeviceSpeed::High => PortStatus::HIGH_SPEED,
        _ => PortStatus::empty(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Req {
    pub dev: DeviceId,
    pub request: Request,
    pub recipient: Recipient,
    pub value: u16,
    pub index: u16,
}

#[derive(Default)]
struct BusState {
    next_dev: u32,
    hubs: BTreeMap<DeviceId, SimHub>,
    allocated: BTreeSet<DeviceId>,
    connected: BTreeMap<DeviceId, AttachInfo>,
    disconnects: Vec<DeviceId>,
    bogus_disconnects: Vec<DeviceId>,
    requests: Vec<Req>,
    fail_alloc: usize,
    fail_connect: usize,
}

impl BusState {
    fn alloc(&mut self) -> DeviceId {
        self.next_dev += 1;
        let dev = DeviceId(self.next_dev);
        self.allocated.insert(dev);
        dev
    }

    fn hub(&mut self, dev: DeviceId) -> &mut SimHub {
        self.hubs
            .get_mut(&dev)
            .unwrap_or_else(|| panic!("{dev} is not a simulated hub"))
    }

    /// The subtree below a physically removed hub stops responding.
    fn vanish(&mut self, dev: DeviceId) {
        let mut stack = vec![dev];
        while let Some(dev) = stack.pop() {
            if let Some(hub) = self.hubs.get_mut(&dev) {
                hub.present = false;
                stack.extend(hub.ports.iter().filter_map(|p| p.device));
            }
        }
    }
}

/// The host stack and every piece of hub hardware on the bus.
#[derive(Clone, Default)]
pub struct SimBus {
    state: Arc<Mutex<BusState>>,
}

impl SimBus {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap()
    }

    /// A hub on a root port, already enumerated by the host stack.
    pub fn add_root_hub(&self, model: HubModel) -> DeviceId {
        let mut state = self.lock();
        let dev = state.alloc();
        state.hubs.insert(dev, SimHub::new(model));
        state.connected.insert(
            dev,
            AttachInfo {
                parent: DeviceId(0),
                port: 1,
                speed: model.speed,
                route: RouteString::follow_root(),
                tt: None,
                think_time: 0,
                hub_level: 1,
            },
        );
        dev
    }

    pub fn transport(&self, dev: DeviceId) -> Box<dyn HubTransport> {
        Box::new(SimTransport {
            bus: self.clone(),
            dev,
        })
    }

    pub fn plug(&self, hub: DeviceId, port: u16, plug: Plug) {
        let mut state = self.lock();
        let p = state.hub(hub).port(port).expect("no such port");
        p.plug = Some(plug);
        p.status.remove(
            PortStatus::ENABLE | PortStatus::RESET | PortStatus::LOW_SPEED | PortStatus::HIGH_SPEED,
        );
        p.status.insert(PortStatus::CONNECTION);
        if plug.speed() == DeviceSpeed::Low {
            p.status.insert(PortStatus::LOW_SPEED);
        }
        p.change.insert(PortChange::C_CONNECTION);
        state.hub(hub).raise();
    }

    pub fn unplug(&self, hub: DeviceId, port: u16) {
        let mut state = self.lock();
        let p = state.hub(hub).port(port).expect("no such port");
        p.plug = None;
        p.status = p.status & PortStatus::POWER;
        p.change.insert(PortChange::C_CONNECTION);
        let old = p.device.take();
        state.hub(hub).raise();
        if let Some(dev) = old {
            state.vanish(dev);
        }
    }

    /// Swaps what is plugged in faster than the hub reports a disconnect.
    pub fn replug(&self, hub: DeviceId, port: u16, plug: Plug) {
        let old = {
            let mut state = self.lock();
            let p = state.hub(hub).port(port).expect("no such port");
            p.device.take()
        };
        if let Some(dev) = old {
            self.lock().vanish(dev);
        }
        self.plug(hub, port, plug);
    }

    pub fn port_change(&self, hub: DeviceId, port: u16, change: PortChange) {
        let mut state = self.lock();
        let p = state.hub(hub).port(port).expect("no such port");
        p.change.insert(change);
        state.hub(hub).raise();
    }

    pub fn hub_over_current(&self, hub: DeviceId) {
        let mut state = self.lock();
        let h = state.hub(hub);
        h.status.insert(HubStatus::OVER_CURRENT);
        h.change.insert(HubChange::C_OVER_CURRENT);
        h.raise();
    }

    pub fn hub_change(&self, hub: DeviceId) -> HubChange {
        self.lock().hub(hub).change
    }

    /// Resets on this port never complete.
    pub fn stuck_reset(&self, hub: DeviceId, port: u16) {
        let mut state = self.lock();
        state.hub(hub).port(port).expect("no such port").stuck_reset = true;
    }

    pub fn fail_requests(&self, hub: DeviceId, count: usize) {
        self.lock().hub(hub).fail_requests = count;
    }

    pub fn refuse_interrupts(&self, hub: DeviceId, count: usize) {
        self.lock().hub(hub).refuse_interrupts = count;
    }

    pub fn fail_connect(&self, count: usize) {
        self.lock().fail_connect = count;
    }

    pub fn fail_alloc(&self, count: usize) {
        self.lock().fail_alloc = count;
    }

    pub fn device_at(&self, hub: DeviceId, port: u16) -> Option<DeviceId> {
        self.lock().hub(hub).port(port).and_then(|p| p.device)
    }

    pub fn attach_info(&self, dev: DeviceId) -> Option<AttachInfo> {
        self.lock().connected.get(&dev).cloned()
    }

    pub fn is_connected(&self, dev: DeviceId) -> bool {
        self.lock().connected.contains_key(&dev)
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.lock().connected.keys().copied().collect()
    }

    pub fn connected_count(&self) -> usize {
        self.lock().connected.len()
    }

    pub fn disconnects(&self) -> Vec<DeviceId> {
        self.lock().disconnects.clone()
    }

    pub fn bogus_disconnects(&self) -> Vec<DeviceId> {
        self.lock().bogus_disconnects.clone()
    }

    pub fn outstanding_interrupts(&self, hub: DeviceId) -> usize {
        self.lock().hub(hub).outstanding
    }

    pub fn requests(&self, dev: DeviceId) -> Vec<Req> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.dev == dev)
            .cloned()
            .collect()
    }

    /// SET_FEATURE(PORT_RESET) requests sent to `port` of `hub`.
    pub fn resets(&self, hub: DeviceId, port: u16) -> usize {
        self.requests(hub)
            .iter()
            .filter(|r| {
                r.request == Request::SetFeature
                    && r.recipient == Recipient::Other
                    && r.value == u16::from(PortFeature::Reset)
                    && r.index == port
            })
            .count()
    }
}

impl HostDriver for SimBus {
    fn device_alloc(&self) -> Result<DeviceId, USBError> {
        let mut state = self.lock();
        if state.fail_alloc > 0 {
            state.fail_alloc -= 1;
            return Err(USBError::SlotLimitReached);
        }
        Ok(state.alloc())
    }

    fn device_connect(&self, dev: DeviceId, info: &AttachInfo) -> Result<(), USBError> {
        let mut state = self.lock();
        if state.fail_connect > 0 {
            state.fail_connect -= 1;
            return Err(USBError::Timeout);
        }
        let port = state
            .hub(info.parent)
            .port(info.port as u16)
            .ok_or(USBError::NotFound)?;
        let plug = port.plug.ok_or(USBError::NotFound)?;
        port.device = Some(dev);
        if let Plug::Hub(model) = plug {
            state.hubs.insert(dev, SimHub::new(model));
        }
        state.connected.insert(dev, info.clone());
        Ok(())
    }

    fn device_disconnect(&self, dev: DeviceId) {
        let mut state = self.lock();
        let was_allocated = state.allocated.remove(&dev);
        if state.connected.remove(&dev).is_some() {
            state.disconnects.push(dev);
        } else if !was_allocated {
            state.bogus_disconnects.push(dev);
        }
    }

    fn open_hub(&self, dev: DeviceId) -> Option<Box<dyn HubTransport>> {
        if self.lock().hubs.contains_key(&dev) {
            Some(self.transport(dev))
        } else {
            None
        }
    }
}

struct SimTransport {
    bus: SimBus,
    dev: DeviceId,
}

impl SimTransport {
    fn begin(&self, setup: &ControlSetup) -> Result<MutexGuard<'_, BusState>, TransferError> {
        let mut state = self.bus.lock();
        state.requests.push(Req {
            dev: self.dev,
            request: setup.request,
            recipient: setup.recipient,
            value: setup.value,
            index: setup.index,
        });
        let hub = state
            .hubs
            .get_mut(&self.dev)
            .filter(|hub| hub.present)
            .ok_or_else(|| TransferError::Other("device gone".into()))?;
        if hub.fail_requests > 0 {
            hub.fail_requests -= 1;
            return Err(TransferError::Stall);
        }
        Ok(state)
    }
}

impl HubTransport for SimTransport {
    fn control_in<'a>(&mut self, setup: ControlSetup, data: &'a mut [u8]) -> ResultTransfer<'a> {
        let result = self.begin(&setup).and_then(|mut state| {
            let hub = state.hub(self.dev);
            let raw = match (setup.request, setup.recipient) {
                (Request::GetDescriptor, Recipient::Device) => hub.model.descriptor(),
                (Request::GetStatus, Recipient::Device) => {
                    let mut raw = hub.status.bits().to_le_bytes().to_vec();
                    raw.extend(hub.change.bits().to_le_bytes());
                    raw
                }
                (Request::GetStatus, Recipient::Other) => {
                    let p = hub.port(setup.index).ok_or(TransferError::Stall)?;
                    let mut raw = p.status.bits().to_le_bytes().to_vec();
                    raw.extend(p.change.bits().to_le_bytes());
                    raw
                }
                _ => return Err(TransferError::Stall),
            };
            let n = raw.len().min(data.len());
            data[..n].copy_from_slice(&raw[..n]);
            Ok(n)
        });
        Ok(Box::pin(ready(result)))
    }

    fn control_out<'a>(&mut self, setup: ControlSetup, _data: &'a [u8]) -> ResultTransfer<'a> {
        let result = self.begin(&setup).and_then(|mut state| {
            let hub = state.hub(self.dev);
            match (setup.request, setup.recipient) {
                (Request::SetFeature, Recipient::Other) => {
                    let feature =
                        PortFeature::try_from(setup.value).map_err(|_| TransferError::Stall)?;
                    let p = hub.port(setup.index).ok_or(TransferError::Stall)?;
                    match feature {
                        PortFeature::Power => p.status.insert(PortStatus::POWER),
                        PortFeature::Reset => {
                            if let Some(plug) = p.plug {
                                if p.stuck_reset {
                                    p.status.remove(PortStatus::ENABLE);
                                    p.status.insert(PortStatus::RESET);
                                } else {
                                    p.status.remove(
                                        PortStatus::RESET
                                            | PortStatus::LOW_SPEED
                                            | PortStatus::HIGH_SPEED,
                                    );
                                    p.status
                                        .insert(PortStatus::ENABLE | speed_bits(plug.speed()));
                                }
                                p.change.insert(PortChange::C_RESET);
                            }
                        }
                        _ => {}
                    }
                }
                (Request::ClearFeature, Recipient::Other) => {
                    let feature =
                        PortFeature::try_from(setup.value).map_err(|_| TransferError::Stall)?;
                    let p = hub.port(setup.index).ok_or(TransferError::Stall)?;
                    match feature {
                        PortFeature::Enable => p.status.remove(PortStatus::ENABLE),
                        PortFeature::CConnection => p.change.remove(PortChange::C_CONNECTION),
                        PortFeature::CEnable => p.change.remove(PortChange::C_ENABLE),
                        PortFeature::CSuspend => p.change.remove(PortChange::C_SUSPEND),
                        PortFeature::COverCurrent => p.change.remove(PortChange::C_OVER_CURRENT),
                        PortFeature::CReset => p.change.remove(PortChange::C_RESET),
                        _ => {}
                    }
                }
                (Request::ClearFeature, Recipient::Device) => {
                    match HubFeature::try_from(setup.value).map_err(|_| TransferError::Stall)? {
                        HubFeature::CHubLocalPower => hub.change.remove(HubChange::C_LOCAL_POWER),
                        HubFeature::CHubOverCurrent => {
                            hub.status.remove(HubStatus::OVER_CURRENT);
                            hub.change.remove(HubChange::C_OVER_CURRENT);
                        }
                    }
                }
                _ => return Err(TransferError::Stall),
            }
            Ok(0)
        });
        Ok(Box::pin(ready(result)))
    }

    fn interrupt_in(&mut self, len: usize) -> Result<InterruptTransfer, TransferError> {
        let mut state = self.bus.lock();
        let hub = state.hub(self.dev);
        if hub.refuse_interrupts > 0 {
            hub.refuse_interrupts -= 1;
            return Err(TransferError::NoSlot);
        }
        hub.outstanding += 1;
        Ok(Box::pin(StatusChangeRead {
            bus: self.bus.clone(),
            dev: self.dev,
            len,
        }))
    }
}

/// Completes as soon as the hub has any change bit set.
struct StatusChangeRead {
    bus: SimBus,
    dev: DeviceId,
    len: usize,
}

impl Future for StatusChangeRead {
    type Output = Result<Vec<u8>, TransferError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.bus.lock();
        match state.hubs.get_mut(&self.dev) {
            Some(hub) if hub.present => match hub.bitmap(self.len) {
                Some(bitmap) => Poll::Ready(Ok(bitmap)),
                None => {
                    hub.read_waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            },
            _ => Poll::Pending,
        }
    }
}

impl Drop for StatusChangeRead {
    fn drop(&mut self) {
        if let Some(hub) = self.bus.lock().hubs.get_mut(&self.dev) {
            hub.outstanding = hub.outstanding.saturating_sub(1);
        }
    }
}

/// Manager, bus and clock wired together.
pub struct Harness {
    pub bus: SimBus,
    pub clock: Arc<FakeClock>,
    pub manager: HubManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    pub fn with_config(config: HubConfig) -> Self {
        init_logging();
        let bus = SimBus::default();
        let clock = Arc::new(FakeClock::default());
        let manager = HubManager::new(config, Arc::new(bus.clone()), clock.clone());
        Self {
            bus,
            clock,
            manager,
        }
    }

    /// Binds a hub on a root port.
    pub fn root_hub(&self, model: HubModel) -> (DeviceId, HubId) {
        let dev = self.bus.add_root_hub(model);
        let id = self
            .manager
            .probe(dev, self.bus.transport(dev), model.speed)
            .expect("probe root hub");
        (dev, id)
    }

    /// Runs the manager until nothing is left to do right now.
    pub fn settle(&self) -> usize {
        let steps = self.manager.run_until_idle(100_000);
        assert!(steps < 100_000, "manager did not settle");
        steps
    }

    /// Lets delayed work come due, then settles.
    pub fn advance(&self, by: Duration) -> usize {
        self.clock.advance(by);
        self.settle()
    }

    pub fn hub_of(&self, dev: DeviceId) -> HubId {
        self.manager
            .find_hub(dev)
            .unwrap_or_else(|| panic!("{dev} is not a tracked hub"))
    }
}
