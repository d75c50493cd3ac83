//! The system work queue the state machines are re-submitted to.

use alloc::{sync::Arc, vec::Vec};
use core::{task::Waker, time::Duration};

use crossbeam::queue::SegQueue;
use futures::task::{ArcWake, AtomicWaker};
use usb_if::err::TransferError;

use crate::hub::HubId;

#[derive(Debug)]
pub(crate) enum Work {
    /// One step of a hub's init state machine.
    HubInit(HubId),
    /// One step of the port state machine for the hub's claimed port.
    Port(HubId),
    /// The status change endpoint read finished.
    Interrupt {
        hub: HubId,
        result: Result<Vec<u8>, TransferError>,
    },
    /// Retry queuing the status change read.
    Rearm(HubId),
}

/// What a state machine step asks of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// The machine reached a resting state.
    Done,
    /// Wait for the interrupt endpoint to report the port again.
    Suspend,
    /// Run the next step as soon as possible.
    Resubmit,
    /// Run the next step after a pause.
    ResubmitAfter(Duration),
}

struct Delayed {
    due: Duration,
    work: Work,
}

pub(crate) struct WorkQueue {
    ready: SegQueue<Work>,
    delayed: spin::Mutex<Vec<Delayed>>,
    waker: AtomicWaker,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            ready: SegQueue::new(),
            delayed: spin::Mutex::new(Vec::new()),
            waker: AtomicWaker::new(),
        }
    }

    pub fn submit(&self, work: Work) {
        trace!("submit {work:?}");
        self.ready.push(work);
        self.waker.wake();
    }

    pub fn submit_at(&self, due: Duration, work: Work) {
        trace!("schedule {work:?} at {due:?}");
        self.delayed.lock().push(Delayed { due, work });
    }

    /// Moves delayed work that is due at `now` onto the ready queue, oldest
    /// deadline first.
    pub fn release_due(&self, now: Duration) -> usize {
        let mut due = Vec::new();
        {
            let mut delayed = self.delayed.lock();
            let mut i = 0;
            while i < delayed.len() {
                if delayed[i].due <= now {
                    due.push(delayed.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        due.sort_by_key(|d| d.due);
        let n = due.len();
        for d in due {
            self.submit(d.work);
        }
        n
    }

    pub fn pop(&self) -> Option<Work> {
        self.ready.pop()
    }

    /// Earliest deadline among delayed work.
    pub fn next_due(&self) -> Option<Duration> {
        self.delayed.lock().iter().map(|d| d.due).min()
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed.lock().len()
    }

    pub fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }
}

/// Transfers polled with the queue's waker hand their completion to
/// whoever registered with the queue.
impl ArcWake for WorkQueue {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.waker.wake();
    }
}
