//! A multi-priority event scheduler for user-space data-plane runtimes.
//!
//! Worker threads pull batches of events out of producer queues through a
//! shared [`Scheduler`]. Per-queue synchronization contracts (parallel,
//! atomic, ordered), priorities, and thread groups decide which worker gets
//! what; packet-input pollers ride the same dispatch loop as software
//! queues.
//!
//! ```
//! use evsched::{Event, QueueParams, Scheduler, ThreadKind, Wait};
//!
//! # fn main() -> Result<(), evsched::SchedError> {
//! let sched = Scheduler::new();
//! let queue = sched.queue_create(QueueParams::default())?;
//!
//! let mut local = sched.local(ThreadKind::Worker)?;
//! sched.enqueue(queue, Event::new(7))?;
//!
//! let (from, event) = local.schedule(Wait::NoWait).expect("one event pending");
//! assert_eq!((from, event.user_data()), (queue, 7));
//! # Ok(())
//! # }
//! ```

mod event;
mod fanout;
mod group;
mod local;
mod order;
mod pktio;
mod queue;

use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;
use thiserror::Error;

pub use event::Event;
pub use group::{GroupId, ThreadMask};
pub use local::{LocalScheduler, ThreadKind, Wait};
pub use pktio::{PktInput, PktioId, PollStatus};
pub use queue::{QueueId, QueueParams, SyncMode};

use fanout::{Fanout, SchedCmd};
use group::GroupTable;
use pktio::{PktioEntry, PktioTable};
use queue::{QueueEntry, QueueStatus};

/// Number of priority levels. Lower is more urgent.
pub const NUM_PRIO: usize = 8;
/// Fan-out buckets per priority level; a power of two.
pub const BUCKETS_PER_PRIO: usize = 4;
/// Per-call batch cap: how many events one dispatch may pull into a
/// thread's local cache.
pub const MAX_DEQ: usize = 4;
/// Ordered locks available per ordered queue.
pub const MAX_ORDERED_LOCKS: usize = 2;
/// Upper bound on concurrently attached scheduler threads.
pub const MAX_THREADS: usize = 128;

/// Most urgent priority level.
pub const PRIO_HIGHEST: usize = 0;
/// Default priority level.
pub const PRIO_DEFAULT: usize = NUM_PRIO / 2;
/// Least urgent priority level.
pub const PRIO_LOWEST: usize = NUM_PRIO - 1;

/// Errors reported at the scheduler API boundary.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SchedError {
    #[error("producer queue capacity exhausted")]
    QueueCapacity,
    #[error("packet input capacity exhausted")]
    PktioCapacity,
    #[error("thread group capacity exhausted")]
    GroupCapacity,
    #[error("scheduler thread capacity exhausted")]
    ThreadCapacity,
    #[error("invalid or destroyed queue handle")]
    BadQueue,
    #[error("invalid thread group id")]
    BadGroup,
    #[error("priority out of range")]
    BadPrio,
    #[error("ordered lock count out of range")]
    BadLockCount,
}

/// Scheduler build parameters.
#[derive(Clone, Debug)]
pub struct Builder {
    max_queues: usize,
    max_pktios: usize,
    max_groups: usize,
    group_name_len: usize,
}

impl Default for Builder {
    fn default() -> Builder {
        Builder {
            max_queues: 1024,
            max_pktios: 64,
            max_groups: 32,
            group_name_len: 32,
        }
    }
}

impl Builder {
    /// Producer-queue capacity.
    pub fn max_queues(&mut self, n: usize) -> &mut Self {
        self.max_queues = n.max(1);
        self
    }

    /// Packet-input capacity.
    pub fn max_pktios(&mut self, n: usize) -> &mut Self {
        self.max_pktios = n;
        self
    }

    /// Thread-group table size, including the three built-in groups.
    pub fn max_groups(&mut self, n: usize) -> &mut Self {
        self.max_groups = n;
        self
    }

    /// Length cap for thread-group names; longer names are truncated.
    pub fn group_name_len(&mut self, n: usize) -> &mut Self {
        self.group_name_len = n;
        self
    }

    /// Build a [`Scheduler`].
    pub fn build(&self) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            fanout: Fanout::new(self.max_queues + self.max_pktios),
            queues: Mutex::new(Slab::with_capacity(self.max_queues)),
            max_queues: self.max_queues,
            pktios: PktioTable::new(self.max_pktios),
            groups: GroupTable::new(self.max_groups, self.group_name_len),
            threads: Mutex::new(ThreadMask::new()),
        })
    }
}

/// The shared scheduler instance.
///
/// One per process (or per independent scheduling domain). All state a
/// worker touches across [`LocalScheduler`] calls lives behind this object;
/// dropping the last `Arc` tears everything down.
pub struct Scheduler {
    pub(crate) fanout: Fanout,
    queues: Mutex<Slab<Arc<QueueEntry>>>,
    max_queues: usize,
    pub(crate) pktios: PktioTable,
    pub(crate) groups: GroupTable,
    threads: Mutex<ThreadMask>,
}

impl Scheduler {
    /// Create a scheduler with default capacities.
    pub fn new() -> Arc<Scheduler> {
        Builder::default().build()
    }

    /// Start building a scheduler with explicit capacities.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Number of priority levels.
    #[inline]
    pub fn num_prio(&self) -> usize {
        NUM_PRIO
    }

    /// Attach the calling thread, joining the built-in ALL group and the
    /// built-in group for `kind`.
    pub fn local(self: &Arc<Self>, kind: ThreadKind) -> Result<LocalScheduler, SchedError> {
        let thr = {
            let mut threads = self.threads.lock();
            let Some(slot) = threads.first_zero() else {
                return Err(SchedError::ThreadCapacity);
            };
            threads.set(slot);
            slot
        };
        self.groups.join_raw(GroupId::ALL, thr);
        let builtin = match kind {
            ThreadKind::Worker => GroupId::WORKER,
            ThreadKind::Control => GroupId::CONTROL,
        };
        self.groups.join_raw(builtin, thr);
        log::debug!("scheduler thread {thr} attached as {kind:?}");
        Ok(LocalScheduler::new(self.clone(), thr, kind))
    }

    pub(crate) fn free_thread(&self, thr: usize) {
        self.threads.lock().clear(thr);
    }

    /// Create and register a producer queue.
    pub fn queue_create(&self, params: QueueParams) -> Result<QueueId, SchedError> {
        if params.prio >= NUM_PRIO {
            return Err(SchedError::BadPrio);
        }
        if params.lock_count > MAX_ORDERED_LOCKS {
            return Err(SchedError::BadLockCount);
        }
        if !self.groups.is_valid(params.group) {
            return Err(SchedError::BadGroup);
        }

        let mut queues = self.queues.lock();
        if queues.len() >= self.max_queues {
            return Err(SchedError::QueueCapacity);
        }
        let slot = queues.vacant_entry();
        let id = QueueId(slot.key() as u32);
        let qe = Arc::new(QueueEntry::new(id, &params));
        self.fanout.register(qe.bucket, qe.prio);
        slot.insert(qe);
        log::debug!(
            "queue {:?} created at priority {} ({:?})",
            id,
            params.prio,
            params.sync
        );
        Ok(id)
    }

    /// Destroy a producer queue. A queue whose command record is in flight
    /// is marked and finalized by the worker that next dispatches it;
    /// undelivered events are dropped.
    pub fn queue_destroy(&self, queue: QueueId) -> Result<(), SchedError> {
        let qe = {
            let mut queues = self.queues.lock();
            queues
                .try_remove(queue.0 as usize)
                .ok_or(SchedError::BadQueue)?
        };
        let in_flight = {
            let mut inner = qe.inner.lock();
            let in_flight = inner.status == QueueStatus::Sched;
            inner.status = QueueStatus::Destroyed;
            in_flight
        };
        if !in_flight {
            self.queue_destroy_finalize(&qe);
        }
        Ok(())
    }

    /// Complete destruction once no command record references the queue.
    pub(crate) fn queue_destroy_finalize(&self, qe: &Arc<QueueEntry>) {
        let dropped = {
            let mut inner = qe.inner.lock();
            inner.status = QueueStatus::Destroyed;
            let dropped = inner.events.len();
            inner.events.clear();
            dropped
        };
        self.fanout.unregister(qe.bucket, qe.prio);
        if dropped > 0 {
            log::warn!(
                "queue {:?} destroyed with {dropped} undelivered events",
                qe.id
            );
        }
        log::debug!("queue {:?} destroyed", qe.id);
    }

    /// Enqueue one event from outside any scheduling context.
    ///
    /// Within a worker, prefer [`LocalScheduler::enqueue`], which serializes
    /// the enqueue against the worker's ordered context.
    pub fn enqueue(&self, queue: QueueId, event: Event) -> Result<(), SchedError> {
        self.enqueue_multi(queue, &[event])
    }

    /// Enqueue a batch of events into one queue.
    pub fn enqueue_multi(&self, queue: QueueId, events: &[Event]) -> Result<(), SchedError> {
        let qe = self.lookup(queue)?;
        self.enqueue_entry(&qe, events)
    }

    pub(crate) fn lookup(&self, queue: QueueId) -> Result<Arc<QueueEntry>, SchedError> {
        self.queues
            .lock()
            .get(queue.0 as usize)
            .cloned()
            .ok_or(SchedError::BadQueue)
    }

    /// Append events and inject the queue's command record on the
    /// empty-to-nonempty transition.
    pub(crate) fn enqueue_entry(
        &self,
        qe: &Arc<QueueEntry>,
        events: &[Event],
    ) -> Result<(), SchedError> {
        if events.is_empty() {
            return Ok(());
        }
        if qe.push_events(events)? {
            self.fanout
                .push(qe.prio, qe.bucket, SchedCmd::Dequeue { qe: qe.clone() });
        }
        Ok(())
    }

    /// Start polling a packet input at `prio`. The poll command is live
    /// immediately and cycles through the fan-out table until the input
    /// reports [`PollStatus::Stopped`].
    pub fn pktio_start(&self, input: Box<dyn PktInput>, prio: usize) -> Result<PktioId, SchedError> {
        if prio >= NUM_PRIO {
            return Err(SchedError::BadPrio);
        }
        let pe = self.pktios.insert(input)?;
        let id = pe.id;
        self.fanout.register(pe.bucket, prio);
        self.fanout
            .push(prio, pe.bucket, SchedCmd::PollPktin { pe, prio });
        log::debug!("packet input {:?} started at priority {prio}", id);
        Ok(id)
    }

    pub(crate) fn pktio_stop(&self, pe: &Arc<PktioEntry>, prio: usize) {
        self.fanout.unregister(pe.bucket, prio);
        self.pktios.remove(pe.id);
        log::debug!("packet input {:?} stopped", pe.id);
    }

    /// Create a named thread group with an initial mask. Duplicate names are
    /// allowed; [`group_lookup`](Scheduler::group_lookup) returns the first
    /// match.
    pub fn group_create(&self, name: &str, mask: &ThreadMask) -> Result<GroupId, SchedError> {
        self.groups.create(name, mask)
    }

    /// Destroy a named group.
    pub fn group_destroy(&self, group: GroupId) -> Result<(), SchedError> {
        self.groups.destroy(group)
    }

    /// Find a named group by name.
    pub fn group_lookup(&self, name: &str) -> Option<GroupId> {
        self.groups.lookup(name)
    }

    /// Add the threads in `mask` to a named group.
    pub fn group_join(&self, group: GroupId, mask: &ThreadMask) -> Result<(), SchedError> {
        self.groups.join(group, mask)
    }

    /// Remove the threads in `mask` from a named group.
    pub fn group_leave(&self, group: GroupId, mask: &ThreadMask) -> Result<(), SchedError> {
        self.groups.leave(group, mask)
    }

    /// Read a named group's mask.
    pub fn group_thrmask(&self, group: GroupId) -> Result<ThreadMask, SchedError> {
        self.groups.thrmask(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_unregister_round_trip() {
        let sched = Scheduler::new();
        let queue = sched.queue_create(QueueParams::default()).unwrap();
        assert_eq!(sched.fanout.mask(PRIO_DEFAULT), 1);

        sched.queue_destroy(queue).unwrap();
        for prio in 0..NUM_PRIO {
            assert_eq!(sched.fanout.mask(prio), 0);
        }
        assert_eq!(sched.fanout.outstanding(), 0);
    }

    #[test]
    fn queue_capacity_is_enforced() {
        let sched = Scheduler::builder().max_queues(2).build();
        sched.queue_create(QueueParams::default()).unwrap();
        sched.queue_create(QueueParams::default()).unwrap();
        assert_eq!(
            sched.queue_create(QueueParams::default()),
            Err(SchedError::QueueCapacity)
        );
    }

    #[test]
    fn invalid_queue_params_are_rejected() {
        let sched = Scheduler::new();
        assert_eq!(
            sched.queue_create(QueueParams::default().prio(NUM_PRIO)),
            Err(SchedError::BadPrio)
        );
        assert_eq!(
            sched.queue_create(
                QueueParams::default()
                    .sync(SyncMode::Ordered)
                    .lock_count(MAX_ORDERED_LOCKS + 1)
            ),
            Err(SchedError::BadLockCount)
        );
        assert_eq!(
            sched.queue_create(QueueParams::default().group(GroupId(19))),
            Err(SchedError::BadGroup)
        );
    }

    #[test]
    fn destroyed_handle_is_rejected() {
        let sched = Scheduler::new();
        let queue = sched.queue_create(QueueParams::default()).unwrap();
        sched.queue_destroy(queue).unwrap();
        assert_eq!(sched.enqueue(queue, Event::new(0)), Err(SchedError::BadQueue));
        assert_eq!(sched.queue_destroy(queue), Err(SchedError::BadQueue));
    }

    #[test]
    fn pktio_stop_clears_registration() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct OnePoll {
            polls: Arc<AtomicUsize>,
        }

        impl PktInput for OnePoll {
            fn poll(&self, _sched: &Scheduler) -> PollStatus {
                self.polls.fetch_add(1, Ordering::SeqCst);
                PollStatus::Stopped
            }
        }

        let sched = Scheduler::new();
        let polls = Arc::new(AtomicUsize::new(0));
        sched
            .pktio_start(Box::new(OnePoll { polls: polls.clone() }), 2)
            .unwrap();
        assert_eq!(sched.pktios.len(), 1);
        assert_eq!(sched.fanout.mask(2), 1);

        let mut local = sched.local(ThreadKind::Worker).unwrap();
        assert!(local.schedule(Wait::NoWait).is_none());

        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert_eq!(sched.pktios.len(), 0);
        assert_eq!(sched.fanout.mask(2), 0);
        assert_eq!(sched.fanout.outstanding(), 0);
    }

    #[test]
    fn thread_slots_are_recycled() {
        let sched = Scheduler::new();
        let a = sched.local(ThreadKind::Worker).unwrap();
        let b = sched.local(ThreadKind::Control).unwrap();
        assert_eq!(a.thread_id(), 0);
        assert_eq!(b.thread_id(), 1);

        assert!(a.finish().is_ok());
        let c = sched.local(ThreadKind::Worker).unwrap();
        assert_eq!(c.thread_id(), 0);
        drop(b);
        drop(c);
    }
}
