//! Thread groups.
//!
//! A thread group is a named thread-mask restricting which workers may
//! consume from the producer queues bound to it. Three built-in groups
//! occupy the reserved low ids; named groups created at runtime start at
//! [`GroupId::FIRST_NAMED`].

use parking_lot::Mutex;

use crate::{SchedError, MAX_THREADS};

const MASK_WORDS: usize = MAX_THREADS / 64;

/// A fixed-width set of worker-thread slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadMask {
    bits: [u64; MASK_WORDS],
}

impl ThreadMask {
    /// The empty mask.
    pub const fn new() -> ThreadMask {
        ThreadMask {
            bits: [0; MASK_WORDS],
        }
    }

    /// A mask containing only `thr`.
    pub fn single(thr: usize) -> ThreadMask {
        let mut mask = ThreadMask::new();
        mask.set(thr);
        mask
    }

    #[inline]
    pub fn set(&mut self, thr: usize) {
        self.bits[thr / 64] |= 1 << (thr % 64);
    }

    #[inline]
    pub fn clear(&mut self, thr: usize) {
        self.bits[thr / 64] &= !(1 << (thr % 64));
    }

    #[inline]
    pub fn contains(&self, thr: usize) -> bool {
        self.bits[thr / 64] & (1 << (thr % 64)) != 0
    }

    /// Add every member of `other`.
    pub fn merge(&mut self, other: &ThreadMask) {
        for (word, o) in self.bits.iter_mut().zip(other.bits.iter()) {
            *word |= o;
        }
    }

    /// Remove every member of `other`.
    pub fn subtract(&mut self, other: &ThreadMask) {
        for (word, o) in self.bits.iter_mut().zip(other.bits.iter()) {
            *word &= !o;
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Number of members.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Lowest slot not in the mask, if any slot is free.
    pub(crate) fn first_zero(&self) -> Option<usize> {
        for (i, word) in self.bits.iter().enumerate() {
            if *word != u64::MAX {
                return Some(i * 64 + word.trailing_ones() as usize);
            }
        }
        None
    }
}

/// Identifier of a thread group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupId(pub(crate) u16);

impl GroupId {
    /// Built-in group containing every scheduler thread. Queues bound to it
    /// are eligible on any thread without a mask check.
    pub const ALL: GroupId = GroupId(0);
    /// Built-in group of worker threads.
    pub const WORKER: GroupId = GroupId(1);
    /// Built-in group of control threads.
    pub const CONTROL: GroupId = GroupId(2);

    /// First id available to named groups.
    pub const FIRST_NAMED: u16 = 3;

    #[inline]
    fn is_named(self) -> bool {
        self.0 >= GroupId::FIRST_NAMED
    }
}

struct GroupSlot {
    used: bool,
    name: String,
    mask: ThreadMask,
}

impl GroupSlot {
    const fn free() -> GroupSlot {
        GroupSlot {
            used: false,
            name: String::new(),
            mask: ThreadMask::new(),
        }
    }
}

pub(crate) struct GroupTable {
    slots: Mutex<Box<[GroupSlot]>>,
    name_len: usize,
}

impl GroupTable {
    pub(crate) fn new(max_groups: usize, name_len: usize) -> GroupTable {
        let max_groups = max_groups.max(GroupId::FIRST_NAMED as usize);
        let mut slots: Vec<GroupSlot> = (0..max_groups).map(|_| GroupSlot::free()).collect();
        for builtin in [GroupId::ALL, GroupId::WORKER, GroupId::CONTROL] {
            slots[builtin.0 as usize].used = true;
        }
        GroupTable {
            slots: Mutex::new(slots.into_boxed_slice()),
            name_len,
        }
    }

    /// Names longer than the configured cap are truncated, like the fixed
    /// name buffers they replace.
    fn clip<'a>(&self, name: &'a str) -> &'a str {
        match name.char_indices().nth(self.name_len) {
            Some((idx, _)) => &name[..idx],
            None => name,
        }
    }

    /// Create a named group with the given initial mask. Duplicate names are
    /// not rejected; `lookup` returns the first match in id order.
    pub(crate) fn create(&self, name: &str, mask: &ThreadMask) -> Result<GroupId, SchedError> {
        let name = self.clip(name);
        let mut slots = self.slots.lock();
        for (i, slot) in slots.iter_mut().enumerate().skip(GroupId::FIRST_NAMED as usize) {
            if !slot.used {
                slot.used = true;
                slot.name = name.to_owned();
                slot.mask = *mask;
                log::debug!("created thread group {i} ({name:?})");
                return Ok(GroupId(i as u16));
            }
        }
        Err(SchedError::GroupCapacity)
    }

    pub(crate) fn destroy(&self, group: GroupId) -> Result<(), SchedError> {
        let mut slots = self.slots.lock();
        let slot = self.named_mut(&mut slots, group)?;
        *slot = GroupSlot::free();
        log::debug!("destroyed thread group {}", group.0);
        Ok(())
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<GroupId> {
        let name = self.clip(name);
        let slots = self.slots.lock();
        slots
            .iter()
            .enumerate()
            .skip(GroupId::FIRST_NAMED as usize)
            .find(|(_, slot)| slot.used && slot.name == name)
            .map(|(i, _)| GroupId(i as u16))
    }

    pub(crate) fn join(&self, group: GroupId, mask: &ThreadMask) -> Result<(), SchedError> {
        let mut slots = self.slots.lock();
        self.named_mut(&mut slots, group)?.mask.merge(mask);
        Ok(())
    }

    pub(crate) fn leave(&self, group: GroupId, mask: &ThreadMask) -> Result<(), SchedError> {
        let mut slots = self.slots.lock();
        self.named_mut(&mut slots, group)?.mask.subtract(mask);
        Ok(())
    }

    pub(crate) fn thrmask(&self, group: GroupId) -> Result<ThreadMask, SchedError> {
        let mut slots = self.slots.lock();
        Ok(self.named_mut(&mut slots, group)?.mask)
    }

    /// Membership test used by the dispatch gate. Valid for built-in and
    /// named ids alike; an unoccupied slot contains no one.
    pub(crate) fn contains(&self, group: GroupId, thr: usize) -> bool {
        let slots = self.slots.lock();
        match slots.get(group.0 as usize) {
            Some(slot) if slot.used => slot.mask.contains(thr),
            _ => false,
        }
    }

    /// Whether `group` may be bound to a queue.
    pub(crate) fn is_valid(&self, group: GroupId) -> bool {
        let slots = self.slots.lock();
        matches!(slots.get(group.0 as usize), Some(slot) if slot.used)
    }

    /// Built-in membership updates from thread setup/teardown; not subject
    /// to the named-range validation of the public API.
    pub(crate) fn join_raw(&self, group: GroupId, thr: usize) {
        let mut slots = self.slots.lock();
        slots[group.0 as usize].mask.set(thr);
    }

    pub(crate) fn leave_raw(&self, group: GroupId, thr: usize) {
        let mut slots = self.slots.lock();
        slots[group.0 as usize].mask.clear(thr);
    }

    fn named_mut<'a>(
        &self,
        slots: &'a mut [GroupSlot],
        group: GroupId,
    ) -> Result<&'a mut GroupSlot, SchedError> {
        if !group.is_named() {
            return Err(SchedError::BadGroup);
        }
        match slots.get_mut(group.0 as usize) {
            Some(slot) if slot.used => Ok(slot),
            _ => Err(SchedError::BadGroup),
        }
    }
}
