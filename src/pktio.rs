//! Packet input pollers.
//!
//! Packet-input drivers are pulled by the same worker loop that drains
//! producer queues: starting a poller plants a poll command in the fan-out
//! table, and every worker that dequeues it calls [`PktInput::poll`] before
//! cycling the command back in. The driver delivers its received batch into
//! producer queues of its own; the scheduler never caches packets from the
//! poll path.

use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;

use crate::{SchedError, Scheduler, BUCKETS_PER_PRIO};

/// What a poll round observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStatus {
    /// The interface is live; keep polling.
    Active,
    /// The interface has been stopped; retire the poller.
    Stopped,
}

/// Driver-side seam for packet input.
///
/// `poll` runs on whichever worker thread dequeued the poll command, so
/// implementations must be safe to call from any thread. A typical
/// implementation receives a burst from its interface and enqueues the
/// packets as events via [`Scheduler::enqueue`].
pub trait PktInput: Send + Sync {
    fn poll(&self, sched: &Scheduler) -> PollStatus;
}

/// Handle of a started packet-input poller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PktioId(pub(crate) u32);

pub(crate) struct PktioEntry {
    pub(crate) id: PktioId,
    pub(crate) bucket: usize,
    pub(crate) input: Box<dyn PktInput>,
}

pub(crate) struct PktioTable {
    slots: Mutex<Slab<Arc<PktioEntry>>>,
    cap: usize,
}

impl PktioTable {
    pub(crate) fn new(cap: usize) -> PktioTable {
        PktioTable {
            slots: Mutex::new(Slab::with_capacity(cap)),
            cap,
        }
    }

    pub(crate) fn insert(&self, input: Box<dyn PktInput>) -> Result<Arc<PktioEntry>, SchedError> {
        let mut slots = self.slots.lock();
        if slots.len() >= self.cap {
            return Err(SchedError::PktioCapacity);
        }
        let slot = slots.vacant_entry();
        let id = PktioId(slot.key() as u32);
        let entry = Arc::new(PktioEntry {
            id,
            bucket: slot.key() & (BUCKETS_PER_PRIO - 1),
            input,
        });
        slot.insert(entry.clone());
        Ok(entry)
    }

    pub(crate) fn remove(&self, id: PktioId) {
        let mut slots = self.slots.lock();
        if slots.contains(id.0 as usize) {
            slots.remove(id.0 as usize);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}
