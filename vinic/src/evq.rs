//! Phase-bit event ring.
//!
//! Hardware writes 8-byte events in order, flipping the phase bit it writes
//! on every lap of the ring. An entry is valid when its phase bit matches
//! the lap the read pointer is on, so the ring never needs clearing between
//! laps: stale entries from the previous lap carry the wrong phase.

use crate::bits::Field;
use crate::error::{Error, Result};
use crate::region::SharedRegion;

pub(crate) const EVENT_BYTES: u32 = 8;

/// Phase bit, common to every event format.
pub(crate) const EV_PHASE: Field = Field::new(59, 1);
/// Event type, common to every event format.
pub(crate) const EV_TYPE: Field = Field::new(60, 4);

pub struct EventRing {
    region: SharedRegion,
    /// Ring size in bytes (power of two).
    bytes: u32,
    /// Free-running byte offset of the next entry.
    ptr: u32,
}

impl EventRing {
    pub fn new(region: SharedRegion, entries: u32) -> Result<Self> {
        if entries == 0 || !entries.is_power_of_two() {
            return Err(Error::RingSetup(
                "event queue size must be a power of two".into(),
            ));
        }
        let bytes = entries
            .checked_mul(EVENT_BYTES)
            .ok_or_else(|| Error::RingSetup("event queue too large".into()))?;
        if (bytes as usize) > region.len() {
            return Err(Error::RingSetup(format!(
                "event queue of {entries} entries needs {bytes} bytes, region has {}",
                region.len()
            )));
        }
        Ok(EventRing {
            region,
            bytes,
            ptr: 0,
        })
    }

    #[inline]
    fn expected_phase(&self, ptr: u32) -> bool {
        ptr & self.bytes != 0
    }

    #[inline]
    fn entry(&self, ptr: u32) -> u64 {
        self.region.observe_u64((ptr & (self.bytes - 1)) as usize)
    }

    #[inline]
    fn valid_at(&self, ptr: u32) -> Option<u64> {
        let event = self.entry(ptr);
        (EV_PHASE.is_set(event) == self.expected_phase(ptr)).then_some(event)
    }

    /// The event at the read pointer, if hardware has written it.
    #[inline]
    pub fn peek(&self) -> Option<u64> {
        self.valid_at(self.ptr)
    }

    #[inline]
    pub fn advance(&mut self) {
        self.ptr = self.ptr.wrapping_add(EVENT_BYTES);
    }

    pub fn has_event(&self) -> bool {
        self.peek().is_some()
    }

    /// True when hardware has lapped us: the entry just consumed has already
    /// been overwritten with the next lap's phase.
    pub fn overflowed(&self) -> bool {
        self.ptr != 0 && self.valid_at(self.ptr.wrapping_sub(EVENT_BYTES)).is_none()
    }

    /// Invalidate every entry and rewind the read pointer.
    pub fn reset(&mut self) {
        self.region.fill(0, self.bytes as usize, 0xff);
        self.ptr = 0;
    }

    /// Byte offset of the read pointer within the ring.
    pub fn offset(&self) -> u32 {
        self.ptr & (self.bytes - 1)
    }

    pub fn entries(&self) -> u32 {
        self.bytes / EVENT_BYTES
    }
}
