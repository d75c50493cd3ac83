//! Hub manager
//!
//! Owns every bound hub, drives their init and port state machines from the
//! work queue, and is the entry point for hub probe and removal.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{task::Waker, time::Duration};

use usb_if::{DeviceSpeed, host::HubTransport};

use super::{
    HubId,
    control::HubInstance,
    entry::{HubManagerEntry, HubSnapshot, PortSnapshot, ProbeInfo},
    registry::Registry,
};
use crate::{
    DeviceId, HostDriver, HubConfig, Kernel, Result,
    queue::{Step, Work, WorkQueue},
};

pub struct HubManager {
    pub(super) config: HubConfig,
    pub(super) host: Arc<dyn HostDriver>,
    kernel: Arc<dyn Kernel>,
    pub(super) registry: Arc<Registry>,
    pub(super) queue: Arc<WorkQueue>,
}

impl HubManager {
    pub fn new(config: HubConfig, host: Arc<dyn HostDriver>, kernel: Arc<dyn Kernel>) -> Self {
        Self {
            config,
            host,
            kernel,
            registry: Arc::new(Registry::new()),
            queue: Arc::new(WorkQueue::new()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Binds a hub attached to a root port and starts its initialisation.
    pub fn probe(
        &self,
        dev: DeviceId,
        transport: Box<dyn HubTransport>,
        speed: DeviceSpeed,
    ) -> Result<HubId> {
        self.probe_hub(dev, transport, ProbeInfo::root(speed))
            .map(|entry| entry.id)
    }

    pub(super) fn probe_hub(
        &self,
        dev: DeviceId,
        transport: Box<dyn HubTransport>,
        info: ProbeInfo,
    ) -> Result<Arc<HubManagerEntry>> {
        if let Some(entry) = self.registry.find_by_device(dev) {
            warn!("{dev}: already bound as {}", entry.id);
            return Ok(entry);
        }
        let entry = self.registry.insert(self.config.max_hubs, |id| {
            HubManagerEntry::new(id, dev, HubInstance::new(dev, transport), info)
        })?;
        info!(
            "{dev}: bound as {} ({:?}, route {:?})",
            entry.id, info.speed, info.route
        );
        self.submit_init(&entry);
        Ok(entry)
    }

    /// Hub class removal: `dev` is already going away, so everything below
    /// it is torn down but `dev` itself is not disconnected again.
    ///
    /// Returns false if `dev` was not a tracked hub.
    pub fn remove(&self, dev: DeviceId) -> bool {
        match self.registry.find_by_device(dev) {
            Some(entry) => self.recursive_disconnect(&entry, false),
            None => false,
        }
    }

    /// Tears down a hub, everything below it, and the hub device itself.
    pub fn disconnect_hub(&self, id: HubId) -> bool {
        match self.registry.get(id) {
            Some(entry) => self.recursive_disconnect(&entry, true),
            None => false,
        }
    }

    /// Runs one unit of work: a due work item if there is one, otherwise a
    /// poll of every outstanding status change read.
    ///
    /// Returns false when there was nothing to do.
    pub fn step(&self) -> bool {
        self.queue.release_due(self.kernel.uptime());
        if let Some(work) = self.queue.pop() {
            self.run(work);
            return true;
        }
        self.poll_transfers() > 0
    }

    /// Steps until idle or until `limit` steps ran; returns the steps taken.
    pub fn run_until_idle(&self, limit: usize) -> usize {
        let mut steps = 0;
        while steps < limit && self.step() {
            steps += 1;
        }
        steps
    }

    /// Wakes `waker` whenever work is queued or a status change read
    /// completes.
    pub fn register_waker(&self, waker: &Waker) {
        self.queue.register(waker);
    }

    /// Queued and delayed work items.
    pub fn pending_work(&self) -> usize {
        self.queue.len()
    }

    /// Uptime at which the earliest delayed work becomes due.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.queue.next_due()
    }

    pub fn hub_ids(&self) -> Vec<HubId> {
        self.registry.hub_ids()
    }

    pub fn hub_count(&self) -> usize {
        self.registry.hub_count()
    }

    pub fn hub(&self, id: HubId) -> Option<HubSnapshot> {
        self.registry.get(id).map(|entry| entry.snapshot())
    }

    pub fn port(&self, id: HubId, port: u8) -> Option<PortSnapshot> {
        let entry = self.registry.get(id)?;
        let state = entry.state.lock();
        state.port(port).map(|p| p.snapshot())
    }

    pub fn find_hub(&self, dev: DeviceId) -> Option<HubId> {
        self.registry.find_by_device(dev).map(|entry| entry.id)
    }

    /// Hub currently holding the port processing gate.
    pub fn processing_hub(&self) -> Option<HubId> {
        self.registry.processing_hub()
    }

    fn run(&self, work: Work) {
        trace!("run {work:?}");
        match work {
            Work::HubInit(id) => {
                let Some(entry) = self.registry.get(id) else {
                    return;
                };
                if !entry.take_init() {
                    trace!("{id}: init work was cancelled");
                    return;
                }
                let step = self.init_step(&entry);
                self.schedule_init(&entry, step);
            }
            Work::Port(id) => {
                let Some(entry) = self.registry.get(id) else {
                    return;
                };
                if !entry.take_port() {
                    trace!("{id}: port work was cancelled");
                    return;
                }
                let step = self.port_step(&entry);
                self.schedule_port(&entry, step);
            }
            Work::Interrupt { hub, result } => self.on_interrupt(hub, result),
            Work::Rearm(id) => {
                if let Some(entry) = self.registry.get(id) {
                    self.arm_monitor(&entry);
                }
            }
        }
    }

    fn schedule_init(&self, entry: &Arc<HubManagerEntry>, step: Step) {
        match step {
            Step::Resubmit => self.submit_init(entry),
            Step::ResubmitAfter(delay) => {
                if entry.queue_init() {
                    self.queue.submit_at(self.deadline(delay), Work::HubInit(entry.id));
                }
            }
            Step::Done | Step::Suspend => {}
        }
    }

    fn schedule_port(&self, entry: &Arc<HubManagerEntry>, step: Step) {
        match step {
            Step::Resubmit => self.submit_port(entry),
            Step::ResubmitAfter(delay) => {
                if entry.queue_port() {
                    self.queue.submit_at(self.deadline(delay), Work::Port(entry.id));
                }
            }
            Step::Suspend => self.arm_monitor(entry),
            Step::Done => self.finish_port(entry),
        }
    }

    pub(super) fn submit_init(&self, entry: &HubManagerEntry) {
        if entry.queue_init() {
            self.queue.submit(Work::HubInit(entry.id));
        }
    }

    pub(super) fn submit_port(&self, entry: &HubManagerEntry) {
        if entry.queue_port() {
            self.queue.submit(Work::Port(entry.id));
        }
    }

    pub(super) fn submit(&self, work: Work) {
        self.queue.submit(work);
    }

    pub(super) fn submit_after(&self, delay: Duration, work: Work) {
        self.queue.submit_at(self.deadline(delay), work);
    }

    fn deadline(&self, delay: Duration) -> Duration {
        self.kernel.uptime() + delay
    }
}
