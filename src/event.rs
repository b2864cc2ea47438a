//! Event descriptors.

use crate::MAX_ORDERED_LOCKS;

/// A unit of work delivered by the scheduler.
///
/// An event carries a `u64` user datum that is passed straight through from
/// the enqueueing producer to the consuming worker; the scheduler never
/// interprets it. Applications typically store a pointer-sized token or an
/// index into their own buffer pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Event {
    user_data: u64,

    // Ordering header, written by the enqueue path of an ordered queue.
    pub(crate) order: u64,
    pub(crate) sync: [u64; MAX_ORDERED_LOCKS],
}

impl Event {
    /// Create an event carrying `user_data`.
    #[inline]
    pub fn new(user_data: u64) -> Event {
        Event {
            user_data,
            order: 0,
            sync: [0; MAX_ORDERED_LOCKS],
        }
    }

    /// The user data set at creation.
    #[inline]
    pub fn user_data(&self) -> u64 {
        self.user_data
    }
}
