//! Superbuf handover between the kernel and one EFCT receive queue.
//!
//! The kernel fills whole superbufs and hands their ids over through a
//! ready queue; we hand them back through a free queue once every packet in
//! them has been released. Both queues live in a small shared-memory block
//! per receive queue:
//!
//! ```text
//! @0    config generation (u32), bumped by the kernel when mappings change
//! @64   ready.added   (u64, kernel-written)
//! @72   ready.removed (u32, ours)
//! @128  ready slots   (16 x u16: bit 15 sentinel, bits 0..14 superbuf id)
//! @192  free.added    (u32, ours)
//! @196  free.removed  (u32, kernel-written)
//! @256  free slots    (16 x u16)
//! ```

use std::io;

use log::debug;

use crate::error::{Error, Result};
use crate::metrics;
use crate::pkt_id::PacketId;
use crate::region::{SharedCounter, SharedRegion};

const CONFIG_GENERATION: usize = 0;
const READY_ADDED: usize = 64;
const READY_REMOVED: usize = 72;
const READY_SLOTS: usize = 128;
const FREE_ADDED: usize = 192;
const FREE_REMOVED: usize = 196;
const FREE_SLOTS: usize = 256;
const QUEUE_SLOTS: u32 = 16;

const SUPERBUF_ID_MASK: u16 = 0x7fff;
const SUPERBUF_SENTINEL: u16 = 0x8000;

/// Bytes of shared memory needed by one receive queue.
pub const RXQ_SHM_BYTES: usize = FREE_SLOTS + QUEUE_SLOTS as usize * 2;

/// Remaps a receive queue's superbufs after the kernel changed them.
///
/// Called before any superbuf contents are trusted whenever the shared
/// configuration generation differs from the one last seen.
pub trait SuperbufRefresh {
    fn refresh(&mut self, rxq: usize, superbufs: &SharedRegion) -> io::Result<()>;
}

impl<F: FnMut(usize, &SharedRegion) -> io::Result<()>> SuperbufRefresh for F {
    fn refresh(&mut self, rxq: usize, superbufs: &SharedRegion) -> io::Result<()> {
        self(rxq, superbufs)
    }
}

/// Typed view of a receive queue's shared-memory block.
pub(crate) struct RxqShm {
    region: SharedRegion,
    ready_removed: SharedCounter,
    free_added: SharedCounter,
    free_removed: SharedCounter,
}

impl RxqShm {
    pub(crate) fn new(region: SharedRegion) -> Result<Self> {
        if region.len() < RXQ_SHM_BYTES {
            return Err(Error::RingSetup(format!(
                "receive queue shared memory needs {RXQ_SHM_BYTES} bytes, got {}",
                region.len()
            )));
        }
        Ok(RxqShm {
            ready_removed: region.counter(READY_REMOVED),
            free_added: region.counter(FREE_ADDED),
            free_removed: region.counter(FREE_REMOVED),
            region,
        })
    }

    pub(crate) fn config_generation(&self) -> u32 {
        self.region.counter(CONFIG_GENERATION).observe()
    }

    /// Take the next superbuf from the ready queue. Returns the raw queue
    /// entry: superbuf id in the low 15 bits, sentinel phase in bit 15.
    pub(crate) fn superbuf_next(&self) -> Result<u16> {
        // Only the low 32 bits of the kernel's counter take part.
        let added = self.region.observe_u64(READY_ADDED) as u32;
        let removed = self.ready_removed.load();
        if added == removed {
            return Err(Error::NotReady);
        }
        let slot = READY_SLOTS + (removed % QUEUE_SLOTS) as usize * 2;
        let raw = self.region.read_u16(slot);
        self.ready_removed.publish(removed.wrapping_add(1));
        Ok(raw)
    }

    /// The kernel has handed over a superbuf we have not taken yet.
    pub(crate) fn ready_pending(&self) -> bool {
        self.region.observe_u64(READY_ADDED) as u32 != self.ready_removed.load()
    }

    /// Return superbuf `id` to the kernel.
    pub(crate) fn superbuf_free(&self, id: usize) {
        let added = self.free_added.load();
        let removed = self.free_removed.observe();
        assert!(
            added.wrapping_sub(removed) < QUEUE_SLOTS,
            "superbuf free queue overflow"
        );
        let slot = FREE_SLOTS + (added % QUEUE_SLOTS) as usize * 2;
        self.region.write_u16(slot, id as u16);
        self.free_added.publish(added.wrapping_add(1));
    }
}

/// One attached EFCT receive queue.
pub(crate) struct EfctRxq {
    qid: usize,
    shm: RxqShm,
    superbufs: SharedRegion,
    config_generation: u32,
    superbuf_pkts: u32,
    /// Packet whose header will describe `prev`, with the expected
    /// sentinel phase cached in the top bit.
    pub(crate) next: PacketId,
    /// Packet the next valid header describes.
    pub(crate) prev: PacketId,
    /// Unreleased packets per superbuf.
    refcnt: Box<[u32]>,
}

impl EfctRxq {
    pub(crate) fn new(
        qid: usize,
        shm: RxqShm,
        superbufs: SharedRegion,
        superbuf_pkts: u32,
        max_superbufs: usize,
    ) -> Self {
        EfctRxq {
            qid,
            // Out of date on purpose so the first poll remaps.
            config_generation: shm.config_generation().wrapping_sub(1),
            shm,
            superbufs,
            superbuf_pkts,
            // One past the budget marks startup: the first rollover skips the
            // header at the start of the first superbuf, which describes
            // nothing we have seen.
            next: PacketId::from_raw(1 + superbuf_pkts),
            prev: PacketId::from_raw(0),
            refcnt: vec![0; max_superbufs].into_boxed_slice(),
        }
    }

    pub(crate) fn superbufs(&self) -> &SharedRegion {
        &self.superbufs
    }

    pub(crate) fn ready_pending(&self) -> bool {
        self.shm.ready_pending()
    }

    pub(crate) fn needs_rollover(&self) -> bool {
        self.next.index() >= self.superbuf_pkts
    }

    /// True when the kernel has changed the superbuf mappings since the last
    /// refresh. Records the new generation as seen.
    pub(crate) fn take_config_change(&mut self) -> bool {
        let generation = self.shm.config_generation();
        if generation == self.config_generation {
            return false;
        }
        debug!(
            "EFCT rxq {} config generation {} -> {generation}",
            self.qid, self.config_generation
        );
        self.config_generation = generation;
        true
    }

    /// Move the cursor onto the next ready superbuf.
    pub(crate) fn rollover(&mut self) -> Result<()> {
        let raw = match self.shm.superbuf_next() {
            Ok(raw) => raw,
            Err(e) => {
                metrics::SUPERBUFS_NOT_READY.increment();
                return Err(e);
            }
        };
        let id = (raw & SUPERBUF_ID_MASK) as usize;
        debug_assert!(id < self.refcnt.len(), "kernel handed over superbuf {id}");
        let pkt = PacketId::new(self.qid, id, 0).with_sentinel(raw & SUPERBUF_SENTINEL != 0);
        if self.next.index() > self.superbuf_pkts {
            self.prev = pkt;
            self.next = pkt.next();
        } else {
            self.next = pkt;
        }
        // Every packet the superbuf can hold is counted up front and
        // released one by one.
        self.refcnt[id] = self.superbuf_pkts;
        metrics::SUPERBUFS_ACQUIRED.increment();
        Ok(())
    }

    /// Byte offset of packet `pkt`'s slot within the superbuf region.
    pub(crate) fn slot_offset(&self, pkt: PacketId, superbuf_bytes: usize, stride: usize) -> usize {
        pkt.superbuf() * superbuf_bytes + pkt.index() as usize * stride
    }

    pub(crate) fn release(&mut self, pkt: PacketId) {
        let id = pkt.superbuf();
        let refcnt = &mut self.refcnt[id];
        assert!(*refcnt > 0, "packet {:#x} released twice", pkt.raw());
        *refcnt -= 1;
        if *refcnt == 0 {
            self.shm.superbuf_free(id);
            metrics::SUPERBUFS_FREED.increment();
        }
    }

    #[cfg(test)]
    pub(crate) fn refcnt(&self, superbuf: usize) -> u32 {
        self.refcnt[superbuf]
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn rxq(pkts: u32) -> (EfctRxq, SharedRegion) {
        let shm = SharedRegion::anonymous(RXQ_SHM_BYTES).unwrap();
        let superbufs = SharedRegion::anonymous(4096).unwrap();
        let rxq = EfctRxq::new(2, RxqShm::new(shm.clone()).unwrap(), superbufs, pkts, 4);
        (rxq, shm)
    }

    #[test]
    fn short_shm_rejected() {
        let shm = SharedRegion::anonymous(128).unwrap();
        assert!(matches!(RxqShm::new(shm), Err(Error::RingSetup(_))));
    }

    #[test]
    fn empty_ready_queue_not_ready() {
        let (mut rxq, _shm) = rxq(4);
        assert!(matches!(rxq.rollover(), Err(Error::NotReady)));
        // Cursor untouched, still in the startup state.
        assert!(rxq.next.index() > 4);
    }

    #[test]
    fn first_rollover_skips_first_header() {
        let (mut rxq, shm) = rxq(4);
        kernel::hand_over(&shm, 3, true);
        assert!(rxq.needs_rollover());
        rxq.rollover().unwrap();

        assert_eq!(rxq.prev, PacketId::new(2, 3, 0).with_sentinel(true));
        assert_eq!(rxq.next, PacketId::new(2, 3, 1).with_sentinel(true));
        assert_eq!(rxq.refcnt(3), 4);
        assert_eq!(shm.read_u32(READY_REMOVED), 1);
    }

    #[test]
    fn later_rollover_keeps_prev() {
        let (mut rxq, shm) = rxq(2);
        kernel::hand_over(&shm, 0, false);
        kernel::hand_over(&shm, 1, true);
        rxq.rollover().unwrap();
        rxq.prev = rxq.next;
        rxq.next = rxq.next.next();
        assert!(rxq.needs_rollover());

        rxq.rollover().unwrap();
        assert_eq!(rxq.prev.index(), 1);
        assert_eq!(rxq.prev.superbuf(), 0);
        assert_eq!(rxq.next, PacketId::new(2, 1, 0).with_sentinel(true));
    }

    #[test]
    fn freed_once_at_zero() {
        let (mut rxq, shm) = rxq(3);
        kernel::hand_over(&shm, 1, false);
        rxq.rollover().unwrap();
        let pkt = PacketId::new(2, 1, 0);
        rxq.release(pkt);
        rxq.release(pkt.next());
        assert!(kernel::freed(&shm).is_empty());
        rxq.release(pkt.next().next());
        assert_eq!(kernel::freed(&shm), vec![1]);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn double_release_panics() {
        let (mut rxq, shm) = rxq(1);
        kernel::hand_over(&shm, 0, false);
        rxq.rollover().unwrap();
        rxq.release(PacketId::new(2, 0, 0));
        rxq.release(PacketId::new(2, 0, 0));
    }

    #[test]
    fn config_change_seen_once() {
        let (mut rxq, shm) = rxq(4);
        assert!(rxq.take_config_change());
        assert!(!rxq.take_config_change());
        kernel::bump_generation(&shm);
        assert!(rxq.take_config_change());
        assert!(!rxq.take_config_change());
    }

    #[test]
    fn ready_queue_wraps() {
        let (rxq, shm) = rxq(4);
        for round in 0..40u16 {
            kernel::hand_over(&shm, round % 4, round % 2 == 1);
            let raw = rxq.shm.superbuf_next().unwrap();
            assert_eq!(raw & SUPERBUF_ID_MASK, round % 4);
            assert_eq!(raw & SUPERBUF_SENTINEL != 0, round % 2 == 1);
        }
        assert!(matches!(rxq.shm.superbuf_next(), Err(Error::NotReady)));
    }
}
