//! Producer queues.
//!
//! A producer queue is an application-facing FIFO of events registered with
//! the scheduler. Each queue carries a priority, a synchronization
//! discipline, and a thread group. The queue's status drives command-record
//! injection: a record enters the fan-out table only on the empty-to-nonempty
//! enqueue transition and drops back out when a worker drains the queue dry.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::event::Event;
use crate::group::GroupId;
use crate::order::OrderedState;
use crate::{SchedError, BUCKETS_PER_PRIO, MAX_ORDERED_LOCKS, PRIO_DEFAULT};

/// Handle of a producer queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueId(pub(crate) u32);

/// Synchronization discipline of a producer queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// Unrestricted parallel dispatch: several workers may process events
    /// from the queue at the same time.
    #[default]
    Parallel,
    /// At most one worker processes a dispatched batch at a time.
    Atomic,
    /// Parallel dispatch, one event per scheduler round, with sequence
    /// numbers for downstream serialization via ordered locks.
    Ordered,
}

/// Parameters for [`Scheduler::queue_create`](crate::Scheduler::queue_create).
#[derive(Clone, Copy, Debug)]
pub struct QueueParams {
    pub prio: usize,
    pub sync: SyncMode,
    pub group: GroupId,
    /// Number of ordered locks, up to [`MAX_ORDERED_LOCKS`]. Only meaningful
    /// for [`SyncMode::Ordered`].
    pub lock_count: usize,
}

impl Default for QueueParams {
    fn default() -> QueueParams {
        QueueParams {
            prio: PRIO_DEFAULT,
            sync: SyncMode::Parallel,
            group: GroupId::ALL,
            lock_count: 0,
        }
    }
}

impl QueueParams {
    pub fn prio(mut self, prio: usize) -> QueueParams {
        self.prio = prio;
        self
    }

    pub fn sync(mut self, sync: SyncMode) -> QueueParams {
        self.sync = sync;
        self
    }

    pub fn group(mut self, group: GroupId) -> QueueParams {
        self.group = group;
        self
    }

    pub fn lock_count(mut self, lock_count: usize) -> QueueParams {
        self.lock_count = lock_count;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueueStatus {
    /// Empty, no command record in flight. The next enqueue injects one.
    NotSched,
    /// A command record is in a fan-out ring or held by a worker.
    Sched,
    /// Marked by `queue_destroy` while a record was in flight; the worker
    /// observing this finalizes the queue.
    Destroyed,
}

pub(crate) struct QueueInner {
    pub(crate) status: QueueStatus,
    pub(crate) events: VecDeque<Event>,

    // Ordered-queue stamp counters, guarded by the queue lock.
    next_order: u64,
    sync_in: [u64; MAX_ORDERED_LOCKS],
}

pub(crate) struct QueueEntry {
    pub(crate) id: QueueId,
    pub(crate) prio: usize,
    pub(crate) sync: SyncMode,
    pub(crate) group: GroupId,
    pub(crate) lock_count: usize,
    pub(crate) bucket: usize,
    pub(crate) inner: Mutex<QueueInner>,
    pub(crate) ordered: Option<OrderedState>,
}

/// Outcome of pulling a batch for dispatch.
pub(crate) enum DeqOutcome {
    /// The queue was destroyed while its record was in flight.
    Destroyed,
    /// Nothing to deliver; the record is dropped and the queue re-arms
    /// itself on its next enqueue.
    Empty,
    /// This many events were copied into the worker's cache.
    Events(usize),
}

impl QueueEntry {
    pub(crate) fn new(id: QueueId, params: &QueueParams) -> QueueEntry {
        let lock_count = match params.sync {
            SyncMode::Ordered => params.lock_count,
            _ => 0,
        };
        QueueEntry {
            id,
            prio: params.prio,
            sync: params.sync,
            group: params.group,
            lock_count,
            bucket: id.0 as usize & (BUCKETS_PER_PRIO - 1),
            inner: Mutex::new(QueueInner {
                status: QueueStatus::NotSched,
                events: VecDeque::new(),
                next_order: 0,
                sync_in: [0; MAX_ORDERED_LOCKS],
            }),
            ordered: match params.sync {
                SyncMode::Ordered => Some(OrderedState::new(lock_count)),
                _ => None,
            },
        }
    }

    /// Append events, stamping them for an ordered queue. Returns whether
    /// this enqueue took the queue from empty to non-empty, in which case the
    /// caller must inject the queue's command record.
    pub(crate) fn push_events(&self, events: &[Event]) -> Result<bool, SchedError> {
        let mut inner = self.inner.lock();
        if inner.status == QueueStatus::Destroyed {
            return Err(SchedError::BadQueue);
        }
        for event in events {
            let mut event = *event;
            if self.sync == SyncMode::Ordered {
                inner.stamp(&mut event, self.lock_count);
            }
            inner.events.push_back(event);
        }
        let wake = inner.status == QueueStatus::NotSched;
        if wake {
            inner.status = QueueStatus::Sched;
        }
        Ok(wake)
    }

    /// Pull up to `max` events into `cache` for dispatch.
    pub(crate) fn dequeue_batch(&self, cache: &mut [Event], max: usize) -> DeqOutcome {
        let mut inner = self.inner.lock();
        if inner.status == QueueStatus::Destroyed {
            return DeqOutcome::Destroyed;
        }
        let num = max.min(cache.len()).min(inner.events.len());
        if num == 0 {
            inner.status = QueueStatus::NotSched;
            return DeqOutcome::Empty;
        }
        for slot in cache.iter_mut().take(num) {
            // len checked above
            *slot = inner.events.pop_front().unwrap_or_default();
        }
        DeqOutcome::Events(num)
    }
}

impl QueueInner {
    fn stamp(&mut self, event: &mut Event, lock_count: usize) {
        event.order = self.next_order;
        self.next_order += 1;
        for i in 0..lock_count {
            event.sync[i] = self.sync_in[i];
            self.sync_in[i] += 1;
        }
    }
}
