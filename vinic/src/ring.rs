//! Circular index bookkeeping shared by every backend's queues.
//!
//! `added` and `removed` are free-running u32 counters; the slot for a
//! counter value is `counter & mask`. The ring holds at most `mask + 1`
//! outstanding requests. `ids` remembers the caller's request id per slot so
//! completions can be handed back; free slots hold [`FREE_ID`].
//!
//! `previous` has a per-backend meaning on transmit queues: the last index
//! the doorbell covered (AF_XDP) or the completion point reached by TX
//! events (EFCT, descriptor rings).

use crate::error::{Error, Result};

/// Request id marking an unused slot.
pub const FREE_ID: u32 = u32::MAX;

pub struct RingState {
    mask: u32,
    added: u32,
    removed: u32,
    previous: u32,
    ids: Box<[u32]>,
}

impl RingState {
    /// Create a ring with `entries` slots. Zero disables the queue.
    pub fn new(entries: u32) -> Self {
        assert!(
            entries == 0 || entries.is_power_of_two(),
            "ring size must be a power of two"
        );
        RingState {
            mask: entries.saturating_sub(1),
            added: 0,
            removed: 0,
            previous: 0,
            ids: vec![FREE_ID; entries as usize].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.ids.len() as u32
    }

    #[inline]
    pub fn mask(&self) -> u32 {
        self.mask
    }

    #[inline]
    pub fn added(&self) -> u32 {
        self.added
    }

    #[inline]
    pub fn removed(&self) -> u32 {
        self.removed
    }

    #[inline]
    pub fn previous(&self) -> u32 {
        self.previous
    }

    #[inline]
    pub fn set_previous(&mut self, previous: u32) {
        self.previous = previous;
    }

    /// Number of outstanding requests.
    #[inline]
    pub fn fill_level(&self) -> u32 {
        self.added.wrapping_sub(self.removed)
    }

    #[inline]
    pub fn space(&self) -> u32 {
        self.capacity() - self.fill_level()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.fill_level() == self.capacity()
    }

    /// Claim the next slot for request `id`, returning the slot index.
    pub fn post(&mut self, id: u32) -> Result<u32> {
        if self.is_full() {
            return Err(Error::RingFull);
        }
        Ok(self.push(id))
    }

    /// Claim the next slot when the caller has already checked for space.
    pub fn push(&mut self, id: u32) -> u32 {
        assert!(!self.is_full(), "ring overrun");
        let slot = self.added & self.mask;
        debug_assert_eq!(self.ids[slot as usize], FREE_ID, "slot {slot} reused");
        self.ids[slot as usize] = id;
        self.added = self.added.wrapping_add(1);
        slot
    }

    /// Retire the oldest outstanding request and return its id.
    pub fn complete(&mut self) -> Option<u32> {
        if self.removed == self.added {
            return None;
        }
        let slot = (self.removed & self.mask) as usize;
        let id = std::mem::replace(&mut self.ids[slot], FREE_ID);
        self.removed = self.removed.wrapping_add(1);
        Some(id)
    }

    /// Retire requests until `removed` reaches `upto`, appending their ids
    /// (skipping placeholder slots) to `out`. Returns how many were retired.
    pub fn complete_to(&mut self, upto: u32, out: &mut Vec<u32>) -> usize {
        debug_assert!(
            upto.wrapping_sub(self.removed) <= self.fill_level(),
            "completion {upto} beyond posted {}",
            self.added
        );
        let mut n = 0;
        while self.removed != upto {
            let Some(id) = self.complete() else { break };
            if id != FREE_ID {
                out.push(id);
            }
            n += 1;
        }
        n
    }

    /// Advance `previous` by one, returning the slot it passed over.
    pub fn advance_previous(&mut self) -> usize {
        assert!(
            self.previous != self.added,
            "completion for a request never posted"
        );
        let slot = (self.previous & self.mask) as usize;
        self.previous = self.previous.wrapping_add(1);
        slot
    }

    /// Hand every outstanding request id to `f` and rewind all counters.
    pub fn reset(&mut self, mut f: impl FnMut(u32)) {
        while let Some(id) = self.complete() {
            if id != FREE_ID {
                f(id);
            }
        }
        self.added = 0;
        self.removed = 0;
        self.previous = 0;
    }

    /// Start every counter at `start`. Used to exercise index wraparound.
    #[cfg(test)]
    pub(crate) fn with_start(entries: u32, start: u32) -> Self {
        let mut ring = Self::new(entries);
        ring.added = start;
        ring.removed = start;
        ring.previous = start;
        ring
    }
}
