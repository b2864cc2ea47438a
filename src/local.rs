//! Per-thread scheduling context and the dispatch engine.
//!
//! Every scheduler thread owns a [`LocalScheduler`]: the cached event batch,
//! the atomic hold, and the ordered context live here and are never touched
//! by another thread. The dispatch engine walks the fan-out table priority
//! by priority, rotating over buckets from a thread-id-seeded start so that
//! concurrent workers spread over the rings instead of contending on one.

use std::hint;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::event::Event;
use crate::fanout::SchedCmd;
use crate::group::GroupId;
use crate::pktio::PollStatus;
use crate::queue::{DeqOutcome, QueueEntry, QueueId, SyncMode};
use crate::{SchedError, Scheduler, BUCKETS_PER_PRIO, MAX_DEQ, MAX_ORDERED_LOCKS, NUM_PRIO};

/// How long `schedule` keeps polling when no work is immediately available.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Poll until an event arrives.
    Forever,
    /// Return at once if nothing is available.
    NoWait,
    /// Poll until an event arrives or the duration elapses.
    Time(Duration),
}

impl Wait {
    /// Wait for at most `ns` nanoseconds.
    #[inline]
    pub fn nanos(ns: u64) -> Wait {
        Wait::Time(Duration::from_nanos(ns))
    }
}

/// Which built-in group a scheduler thread joins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadKind {
    Worker,
    Control,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct LocalFlags: u8 {
        const PAUSE = 1;
        const ENQ_CALLED = 1 << 1;
    }
}

struct Hold {
    prio: usize,
    bucket: usize,
    cmd: SchedCmd,
}

/// A thread's handle into the scheduler.
///
/// Created by [`Scheduler::local`]; one per participating thread. Dropping
/// the handle detaches the thread, re-injecting a held atomic command and
/// resolving a leftover ordered context on the way out; [`finish`] does the
/// same but refuses while events are still cached or a context is held.
///
/// [`finish`]: LocalScheduler::finish
pub struct LocalScheduler {
    shared: Arc<Scheduler>,
    thr: usize,
    kind: ThreadKind,
    detached: bool,

    cache: [Event; MAX_DEQ],
    num: usize,
    index: usize,
    qe: Option<Arc<QueueEntry>>,

    held: Option<Hold>,

    origin: Option<Arc<QueueEntry>>,
    order: u64,
    sync: [u64; MAX_ORDERED_LOCKS],

    flags: LocalFlags,
}

impl LocalScheduler {
    pub(crate) fn new(shared: Arc<Scheduler>, thr: usize, kind: ThreadKind) -> LocalScheduler {
        LocalScheduler {
            shared,
            thr,
            kind,
            detached: false,
            cache: [Event::default(); MAX_DEQ],
            num: 0,
            index: 0,
            qe: None,
            held: None,
            origin: None,
            order: 0,
            sync: [0; MAX_ORDERED_LOCKS],
            flags: LocalFlags::empty(),
        }
    }

    /// The slot this thread occupies in thread masks.
    #[inline]
    pub fn thread_id(&self) -> usize {
        self.thr
    }

    /// Pull one event. Returns the event and the queue it came from.
    pub fn schedule(&mut self, wait: Wait) -> Option<(QueueId, Event)> {
        let mut out = [Event::default(); 1];
        self.schedule_loop(wait, &mut out).map(|(id, _)| (id, out[0]))
    }

    /// Pull a batch of up to `out.len()` events, all from the same queue.
    /// Returns the source queue and the number of events written.
    pub fn schedule_multi(&mut self, wait: Wait, out: &mut [Event]) -> Option<(QueueId, usize)> {
        self.schedule_loop(wait, out)
    }

    fn schedule_loop(&mut self, wait: Wait, out: &mut [Event]) -> Option<(QueueId, usize)> {
        if out.is_empty() {
            return None;
        }
        let mut deadline = None;
        loop {
            if let Some(got) = self.schedule_once(out) {
                return Some(got);
            }
            match wait {
                Wait::NoWait => return None,
                Wait::Forever => hint::spin_loop(),
                Wait::Time(timeout) => {
                    let end = *deadline.get_or_insert_with(|| Instant::now() + timeout);
                    if Instant::now() >= end {
                        return None;
                    }
                    hint::spin_loop();
                }
            }
        }
    }

    /// One pass of the engine: cache, context release, then the priority
    /// walk.
    fn schedule_once(&mut self, out: &mut [Event]) -> Option<(QueueId, usize)> {
        if let Some(got) = self.take_cached(out) {
            return Some(got);
        }

        self.release_context();

        if self.flags.contains(LocalFlags::PAUSE) {
            return None;
        }

        for prio in 0..NUM_PRIO {
            let mask = self.shared.fanout.mask(prio);
            if mask == 0 {
                continue;
            }
            let start = self.thr & (BUCKETS_PER_PRIO - 1);
            for offset in 0..BUCKETS_PER_PRIO {
                let bucket = (start + offset) & (BUCKETS_PER_PRIO - 1);
                if mask & (1 << bucket) == 0 {
                    continue;
                }
                // raced with another worker when empty
                let Some(cmd) = self.shared.fanout.pop(prio, bucket) else {
                    continue;
                };
                match cmd {
                    SchedCmd::PollPktin { pe, prio: pktio_prio } => {
                        match pe.input.poll(&self.shared) {
                            PollStatus::Active => self.shared.fanout.push(
                                prio,
                                bucket,
                                SchedCmd::PollPktin { pe, prio: pktio_prio },
                            ),
                            PollStatus::Stopped => self.shared.pktio_stop(&pe, pktio_prio),
                        }
                    }
                    SchedCmd::Dequeue { qe } => {
                        if let Some(got) = self.dispatch_queue(qe, prio, bucket, out) {
                            return Some(got);
                        }
                    }
                }
            }
        }
        None
    }

    fn dispatch_queue(
        &mut self,
        qe: Arc<QueueEntry>,
        prio: usize,
        bucket: usize,
        out: &mut [Event],
    ) -> Option<(QueueId, usize)> {
        if !self.eligible(&qe) {
            self.shared.fanout.push(prio, bucket, SchedCmd::Dequeue { qe });
            return None;
        }

        // Ordered queues dispatch one event per round so that successive
        // events spread across threads.
        let max = match qe.sync {
            SyncMode::Ordered => 1,
            _ => MAX_DEQ,
        };
        match qe.dequeue_batch(&mut self.cache, max) {
            DeqOutcome::Destroyed => {
                self.shared.queue_destroy_finalize(&qe);
                None
            }
            DeqOutcome::Empty => None,
            DeqOutcome::Events(num) => {
                self.num = num;
                self.index = 0;
                self.qe = Some(qe.clone());
                match qe.sync {
                    SyncMode::Parallel => {
                        self.shared.fanout.push(prio, bucket, SchedCmd::Dequeue { qe });
                    }
                    SyncMode::Atomic => {
                        self.held = Some(Hold {
                            prio,
                            bucket,
                            cmd: SchedCmd::Dequeue { qe },
                        });
                    }
                    SyncMode::Ordered => {
                        self.order = self.cache[0].order;
                        self.sync = self.cache[0].sync;
                        self.flags.remove(LocalFlags::ENQ_CALLED);
                        self.origin = Some(qe.clone());
                        self.shared.fanout.push(prio, bucket, SchedCmd::Dequeue { qe });
                    }
                }
                self.take_cached(out)
            }
        }
    }

    fn take_cached(&mut self, out: &mut [Event]) -> Option<(QueueId, usize)> {
        if self.num == 0 {
            return None;
        }
        let id = self.qe.as_ref()?.id;
        let num = self.num.min(out.len());
        out[..num].copy_from_slice(&self.cache[self.index..self.index + num]);
        self.index += num;
        self.num -= num;
        if self.num == 0 {
            self.qe = None;
        }
        Some((id, num))
    }

    fn eligible(&self, qe: &QueueEntry) -> bool {
        qe.group == GroupId::ALL || self.shared.groups.contains(qe.group, self.thr)
    }

    /// Enqueue an event, serialized against this thread's ordered context
    /// if one is held.
    pub fn enqueue(&mut self, queue: QueueId, event: Event) -> Result<(), SchedError> {
        self.enqueue_multi(queue, &[event])
    }

    /// Enqueue a batch of events into one queue.
    pub fn enqueue_multi(&mut self, queue: QueueId, events: &[Event]) -> Result<(), SchedError> {
        let qe = self.shared.lookup(queue)?;
        if let Some(origin) = self.origin.as_ref() {
            if let Some(ordered) = origin.ordered.as_ref() {
                ordered.forward(&self.shared, self.order, &qe, events)?;
                self.flags.insert(LocalFlags::ENQ_CALLED);
                return Ok(());
            }
        }
        self.shared.enqueue_entry(&qe, events)
    }

    /// Stop receiving events on this thread. Scheduling calls return empty
    /// until [`resume`](LocalScheduler::resume); further `pause` calls are
    /// idempotent.
    pub fn pause(&mut self) {
        self.flags.insert(LocalFlags::PAUSE);
    }

    /// Re-enable scheduling on this thread.
    pub fn resume(&mut self) {
        self.flags.remove(LocalFlags::PAUSE);
    }

    /// Release whichever context the previous batch left behind.
    pub fn release_context(&mut self) {
        if self.origin.is_some() {
            self.release_ordered();
        } else {
            self.release_atomic();
        }
    }

    /// Give up the hold on an atomic queue. Deferred while cached events
    /// from the batch remain.
    pub fn release_atomic(&mut self) {
        if self.num > 0 {
            return;
        }
        if let Some(hold) = self.held.take() {
            self.shared.fanout.push(hold.prio, hold.bucket, hold.cmd);
        }
    }

    /// Resolve this thread's ordered context, letting the origin queue's
    /// cursor move past the event it delivered here.
    pub fn release_ordered(&mut self) {
        let Some(origin) = self.origin.take() else {
            return;
        };
        if let Some(ordered) = origin.ordered.as_ref() {
            ordered.release(
                &self.shared,
                self.order,
                &self.sync,
                self.flags.contains(LocalFlags::ENQ_CALLED),
            );
        }
        self.flags.remove(LocalFlags::ENQ_CALLED);
    }

    /// Enter the ordered critical section `index` in source order. A no-op
    /// without an ordered context or for an undeclared lock index.
    pub fn order_lock(&mut self, index: usize) {
        let Some(origin) = self.origin.as_ref() else {
            return;
        };
        let Some(ordered) = origin.ordered.as_ref() else {
            return;
        };
        if index >= ordered.lock_count {
            return;
        }
        ordered.wait_sync(index, self.sync[index]);
    }

    /// Leave the ordered critical section `index`, admitting the next event
    /// in source order.
    pub fn order_unlock(&mut self, index: usize) {
        let Some(origin) = self.origin.as_ref() else {
            return;
        };
        let Some(ordered) = origin.ordered.as_ref() else {
            return;
        };
        if index >= ordered.lock_count {
            return;
        }
        ordered.release_sync(index, self.sync[index]);
    }

    /// Hint that this thread will schedule again shortly. Currently a no-op.
    #[inline]
    pub fn prefetch(&self, _num: usize) {}

    /// Detach from the scheduler. Fails, handing the context back, while
    /// events are still cached or an atomic or ordered context is held.
    pub fn finish(mut self) -> Result<(), LocalScheduler> {
        if self.num > 0 || self.held.is_some() || self.origin.is_some() {
            return Err(self);
        }
        self.detach();
        Ok(())
    }

    fn detach(&mut self) {
        self.detached = true;
        let builtin = match self.kind {
            ThreadKind::Worker => GroupId::WORKER,
            ThreadKind::Control => GroupId::CONTROL,
        };
        self.shared.groups.leave_raw(builtin, self.thr);
        self.shared.groups.leave_raw(GroupId::ALL, self.thr);
        self.shared.free_thread(self.thr);
        log::debug!("scheduler thread {} detached", self.thr);
    }
}

impl Drop for LocalScheduler {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if self.num > 0 {
            log::warn!(
                "thread {} dropped {} undelivered cached events",
                self.thr,
                self.num
            );
            self.num = 0;
            self.qe = None;
        }
        self.release_ordered();
        self.release_atomic();
        self.detach();
    }
}
