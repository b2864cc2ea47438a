//! Ordered-queue resolution.
//!
//! Events leave an ordered queue stamped with a monotonically increasing
//! sequence number and one sync value per declared ordered lock. Workers
//! process them in parallel; this module serializes the side effects. A
//! per-queue cursor tracks the oldest unresolved sequence number. Enqueues
//! made while the worker's sequence number is at the cursor pass straight
//! through to their destination; enqueues made ahead of the cursor are
//! parked in a pending map and flushed in sequence order as the cursor
//! advances. Releasing a sequence number at the cursor advances it past any
//! already-released successors.

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::{array, hint, thread};

use parking_lot::Mutex;

use crate::event::Event;
use crate::queue::QueueEntry;
use crate::{SchedError, Scheduler, MAX_ORDERED_LOCKS};

/// Spins on a sync gate before falling back to the OS scheduler.
const SPIN_BEFORE_YIELD: u32 = 128;

pub(crate) struct OrderedState {
    pub(crate) lock_count: usize,
    /// Per-lock output cursors: the sync value of the next critical section
    /// allowed to run. Advanced by `order_unlock` and by resolution (past
    /// events that never took the lock).
    pub(crate) sync_out: [AtomicU64; MAX_ORDERED_LOCKS],
    resolve: Mutex<Resolution>,
}

struct Resolution {
    cursor: u64,
    pending: BTreeMap<u64, Pending>,
}

#[derive(Default)]
struct Pending {
    released: bool,
    syncs: [u64; MAX_ORDERED_LOCKS],
    deferred: Vec<(Arc<QueueEntry>, Event)>,
}

impl OrderedState {
    pub(crate) fn new(lock_count: usize) -> OrderedState {
        OrderedState {
            lock_count,
            sync_out: array::from_fn(|_| AtomicU64::new(0)),
            resolve: Mutex::new(Resolution {
                cursor: 0,
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Enqueue `events` into `dest` on behalf of the worker holding sequence
    /// number `order`: directly when `order` is at the cursor, deferred
    /// otherwise.
    pub(crate) fn forward(
        &self,
        sched: &Scheduler,
        order: u64,
        dest: &Arc<QueueEntry>,
        events: &[Event],
    ) -> Result<(), SchedError> {
        let mut st = self.resolve.lock();
        if order == st.cursor {
            // In order already; earlier deferred enqueues for this sequence
            // number were flushed when the cursor reached it.
            sched.enqueue_entry(dest, events)
        } else {
            let pending = st.pending.entry(order).or_default();
            for event in events {
                pending.deferred.push((dest.clone(), *event));
            }
            Ok(())
        }
    }

    /// Resolve sequence number `order`: the worker finished its event.
    /// `syncs` are the event's per-lock stamps; `enq_called` tells whether
    /// the worker forwarded anything while holding the context.
    pub(crate) fn release(
        &self,
        sched: &Scheduler,
        order: u64,
        syncs: &[u64; MAX_ORDERED_LOCKS],
        enq_called: bool,
    ) {
        let mut st = self.resolve.lock();
        if order == st.cursor {
            if enq_called {
                if let Some(pending) = st.pending.remove(&order) {
                    Self::flush(sched, pending.deferred);
                }
            }
            self.advance(&mut st, syncs);
            self.drain(sched, &mut st);
        } else {
            let pending = st.pending.entry(order).or_default();
            pending.released = true;
            pending.syncs = *syncs;
        }
    }

    /// Move the cursor past one resolved sequence number and open its lock
    /// gates for the successor, covering consumers that never took a lock.
    fn advance(&self, st: &mut Resolution, syncs: &[u64; MAX_ORDERED_LOCKS]) {
        st.cursor += 1;
        for i in 0..self.lock_count {
            self.sync_out[i].fetch_max(syncs[i] + 1, Ordering::AcqRel);
        }
    }

    /// Walk the pending map from the cursor: flush and retire released
    /// entries; at an unreleased entry, flush what it has deferred so far
    /// (its sequence number is now in order) and stop.
    fn drain(&self, sched: &Scheduler, st: &mut Resolution) {
        loop {
            let cursor = st.cursor;
            let Some(pending) = st.pending.get_mut(&cursor) else {
                break;
            };
            if !pending.released {
                let deferred = mem::take(&mut pending.deferred);
                Self::flush(sched, deferred);
                break;
            }
            let Some(pending) = st.pending.remove(&cursor) else {
                break;
            };
            self.advance(st, &pending.syncs);
            Self::flush(sched, pending.deferred);
        }
    }

    fn flush(sched: &Scheduler, deferred: Vec<(Arc<QueueEntry>, Event)>) {
        for (dest, event) in deferred {
            if sched.enqueue_entry(&dest, &[event]).is_err() {
                log::warn!(
                    "dropped event forwarded to destroyed queue {:?}",
                    dest.id
                );
            }
        }
    }

    /// Block until the critical section for stamp `sync` may run.
    pub(crate) fn wait_sync(&self, index: usize, sync: u64) {
        let mut spins = 0u32;
        loop {
            let out = self.sync_out[index].load(Ordering::Acquire);
            if out == sync {
                return;
            }
            debug_assert!(sync > out, "ordered lock {index} sequence regressed");
            spins += 1;
            if spins > SPIN_BEFORE_YIELD {
                thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }
    }

    /// Open the gate for the next stamp. The caller must own the gate, i.e.
    /// `wait_sync(index, sync)` has returned.
    pub(crate) fn release_sync(&self, index: usize, sync: u64) {
        debug_assert_eq!(
            self.sync_out[index].load(Ordering::Relaxed),
            sync,
            "ordered lock {index} released out of turn"
        );
        self.sync_out[index].fetch_add(1, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> u64 {
        self.resolve.lock().cursor
    }
}
