//! Priority fan-out table.
//!
//! A two-dimensional array of MPMC rings indexed by (priority, bucket).
//! Workers pull command records out of the rings; producers and the engine
//! push them back in. A per-priority bitmap tracks which buckets have any
//! registered producer so the dispatch loop can skip empty priority bands
//! in constant time.

use std::array;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;

use crate::pktio::PktioEntry;
use crate::queue::QueueEntry;
use crate::{BUCKETS_PER_PRIO, NUM_PRIO};

/// A command record.
///
/// Dequeued from a fan-out ring, it names the producer a worker should pull
/// from next: either a producer queue to drain or a packet input to poll.
/// Exactly one record exists per registered producer; it lives in some ring
/// or in a single worker's atomic hold.
#[derive(Clone)]
pub(crate) enum SchedCmd {
    Dequeue {
        qe: Arc<QueueEntry>,
    },
    PollPktin {
        pe: Arc<PktioEntry>,
        prio: usize,
    },
}

pub(crate) struct Fanout {
    rings: Vec<ArrayQueue<SchedCmd>>,
    masks: [AtomicU32; NUM_PRIO],
    // mask lock: serializes registration accounting behind the bitmaps
    counts: Mutex<[[u32; BUCKETS_PER_PRIO]; NUM_PRIO]>,
}

impl Fanout {
    /// `cmd_cap` must cover every registrable producer; each ring is sized
    /// for the worst case of all records gathering in one bucket.
    pub(crate) fn new(cmd_cap: usize) -> Fanout {
        Fanout {
            rings: (0..NUM_PRIO * BUCKETS_PER_PRIO)
                .map(|_| ArrayQueue::new(cmd_cap.max(1)))
                .collect(),
            masks: array::from_fn(|_| AtomicU32::new(0)),
            counts: Mutex::new([[0; BUCKETS_PER_PRIO]; NUM_PRIO]),
        }
    }

    #[inline]
    fn ring(&self, prio: usize, bucket: usize) -> &ArrayQueue<SchedCmd> {
        &self.rings[prio * BUCKETS_PER_PRIO + bucket]
    }

    /// Record a producer at `(prio, bucket)` and expose the bucket to the
    /// dispatch loop.
    pub(crate) fn register(&self, bucket: usize, prio: usize) {
        let mut counts = self.counts.lock();
        counts[prio][bucket] += 1;
        self.masks[prio].fetch_or(1 << bucket, Ordering::Release);
    }

    /// Drop a producer's registration; the bucket bit clears with the last
    /// producer.
    pub(crate) fn unregister(&self, bucket: usize, prio: usize) {
        let mut counts = self.counts.lock();
        counts[prio][bucket] -= 1;
        if counts[prio][bucket] == 0 {
            self.masks[prio].fetch_and(!(1 << bucket), Ordering::Release);
        }
    }

    /// Bitmap of buckets with registered producers at `prio`. Read lock-free
    /// by the dispatch loop.
    #[inline]
    pub(crate) fn mask(&self, prio: usize) -> u32 {
        self.masks[prio].load(Ordering::Acquire)
    }

    pub(crate) fn push(&self, prio: usize, bucket: usize, cmd: SchedCmd) {
        // Ring capacity is provisioned for every record that can exist, so
        // a full ring means the accounting is corrupt.
        if self.ring(prio, bucket).push(cmd).is_err() {
            panic!("fan-out ring overflow at priority {prio} bucket {bucket}");
        }
    }

    #[inline]
    pub(crate) fn pop(&self, prio: usize, bucket: usize) -> Option<SchedCmd> {
        self.ring(prio, bucket).pop()
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.rings.iter().map(|r| r.len()).sum()
    }
}
