//! Generic descriptor-ring backend.
//!
//! Transmit and receive descriptors are `{ addr: u64, len: u32, flags: u32 }`
//! in caller-provided memory. The NIC is told about new descriptors through a
//! [`Doorbell`] and reports completions through a phase-bit event ring.

use log::warn;

use crate::bits::Field;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventFlags, RxEvent, TxEvent};
use crate::evq::{EV_TYPE, EVENT_BYTES, EventRing};
use crate::metrics;
use crate::region::{SharedCounter, SharedRegion};
use crate::ring::{FREE_ID, RingState};
use crate::vi::{IoVec, ViOps};

pub const DESC_BYTES: usize = 16;

/// More fragments of the same packet follow this descriptor.
pub const TX_DESC_CONT: u32 = 1 << 0;

const EVENT_TYPE_TX: u64 = 0;
const EVENT_TYPE_RX: u64 = 1;
const EVENT_TYPE_CONTROL: u64 = 3;

const RX_EV_PTR: Field = Field::new(0, 16);
const RX_EV_BYTES: Field = Field::new(16, 14);
const RX_EV_LABEL: Field = Field::new(32, 6);
const RX_EV_CONT: Field = Field::new(38, 1);

const TX_EV_PTR: Field = Field::new(0, 16);
const TX_EV_LABEL: Field = Field::new(32, 6);

const PTR_MASK: u32 = RX_EV_PTR.max() as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorbellQueue {
    Tx,
    Rx,
}

/// Tells the NIC how far a producer index has advanced.
pub trait Doorbell {
    fn ring(&mut self, queue: DoorbellQueue, producer: u32);
}

impl<F: FnMut(DoorbellQueue, u32)> Doorbell for F {
    fn ring(&mut self, queue: DoorbellQueue, producer: u32) {
        self(queue, producer)
    }
}

/// Offset of the TX producer index in [`DescRings::producers`].
pub const TX_PRODUCER_OFFSET: usize = 0;
/// Offset of the RX producer index in [`DescRings::producers`].
pub const RX_PRODUCER_OFFSET: usize = 4;
const PRODUCERS_BYTES: usize = 8;

/// Memory backing a descriptor-ring VI.
pub struct DescRings {
    pub tx: SharedRegion,
    pub rx: SharedRegion,
    pub evq: SharedRegion,
    /// Producer indices the NIC reads after a doorbell.
    pub producers: SharedRegion,
}

impl DescRings {
    /// Rings in anonymous memory, sized for `config`.
    pub fn anonymous(config: &Config) -> Result<Self> {
        Ok(DescRings {
            tx: SharedRegion::anonymous(config.txq_size.max(1) as usize * DESC_BYTES)?,
            rx: SharedRegion::anonymous(config.rxq_size.max(1) as usize * DESC_BYTES)?,
            evq: SharedRegion::anonymous(config.evq_size as usize * EVENT_BYTES as usize)?,
            producers: SharedRegion::anonymous(PRODUCERS_BYTES)?,
        })
    }
}

pub struct DescVi {
    rxq: RingState,
    txq: RingState,
    tx: SharedRegion,
    rx: SharedRegion,
    tx_producer: SharedCounter,
    rx_producer: SharedCounter,
    evq: EventRing,
    doorbell: Box<dyn Doorbell>,
    rx_buffer_len: u32,
    rx_prefix_len: u32,
    /// A multi-buffer packet is being received.
    in_jumbo: bool,
}

impl DescVi {
    pub fn new(config: &Config, rings: DescRings, doorbell: Box<dyn Doorbell>) -> Result<Self> {
        for (name, region, entries) in [
            ("TX", &rings.tx, config.txq_size),
            ("RX", &rings.rx, config.rxq_size),
        ] {
            if region.len() < entries as usize * DESC_BYTES {
                return Err(Error::RingSetup(format!(
                    "{name} ring of {entries} descriptors does not fit {} bytes",
                    region.len()
                )));
            }
        }
        if rings.producers.len() < PRODUCERS_BYTES {
            return Err(Error::RingSetup(format!(
                "producer indices need {PRODUCERS_BYTES} bytes, got {}",
                rings.producers.len()
            )));
        }
        let mut evq = EventRing::new(rings.evq, config.evq_size)?;
        evq.reset();
        Ok(DescVi {
            rxq: RingState::new(config.rxq_size),
            txq: RingState::new(config.txq_size),
            tx: rings.tx,
            rx: rings.rx,
            tx_producer: rings.producers.counter(TX_PRODUCER_OFFSET),
            rx_producer: rings.producers.counter(RX_PRODUCER_OFFSET),
            evq,
            doorbell,
            rx_buffer_len: config.rx_buffer_len,
            rx_prefix_len: config.rx_prefix_len,
            in_jumbo: false,
        })
    }

    fn write_desc(region: &SharedRegion, slot: u32, addr: u64, len: u32, flags: u32) {
        let off = slot as usize * DESC_BYTES;
        region.write_u64(off, addr);
        region.write_u32(off + 8, len);
        region.write_u32(off + 12, flags);
    }

    fn rx_event(&mut self, event: u64) -> RxEvent {
        debug_assert_eq!(
            RX_EV_PTR.get(event) as u32,
            self.rxq.removed() & PTR_MASK,
            "RX completion out of order"
        );
        let rq_id = self.rxq.complete();
        debug_assert!(rq_id.is_some(), "RX completion with no buffer posted");
        let sop = !self.in_jumbo;
        let cont = RX_EV_CONT.is_set(event);
        self.in_jumbo = cont;

        let mut flags = EventFlags::empty();
        flags.set(EventFlags::SOP, sop);
        flags.set(EventFlags::CONT, cont);
        metrics::RX_DELIVERED.increment();
        RxEvent {
            queue: RX_EV_LABEL.get(event) as u16,
            rq_id: rq_id.unwrap_or(FREE_ID),
            len: RX_EV_BYTES.get(event) as u32,
            // The prefix only precedes the first buffer of a packet.
            offset: if sop { self.rx_prefix_len } else { 0 },
            flags,
        }
    }

    fn tx_event(&mut self, event: u64) -> TxEvent {
        let ptr = TX_EV_PTR.get(event) as u32;
        let previous = self.txq.previous();
        let completed = previous.wrapping_add(ptr.wrapping_add(1).wrapping_sub(previous) & PTR_MASK);
        debug_assert!(
            completed.wrapping_sub(self.txq.removed()) <= self.txq.fill_level(),
            "TX completion {ptr:#x} beyond posted descriptors"
        );
        self.txq.set_previous(completed);
        TxEvent {
            queue: TX_EV_LABEL.get(event) as u16,
            desc_id: completed,
            flags: EventFlags::empty(),
        }
    }
}

impl ViOps for DescVi {
    fn rxq(&self) -> &RingState {
        &self.rxq
    }

    fn rxq_mut(&mut self) -> &mut RingState {
        &mut self.rxq
    }

    fn txq(&self) -> &RingState {
        &self.txq
    }

    fn txq_mut(&mut self) -> &mut RingState {
        &mut self.txq
    }

    fn transmitv_init(&mut self, iov: &[IoVec], id: u32) -> Result<()> {
        assert!(!iov.is_empty(), "transmit with no buffers");
        if (self.txq.space() as usize) < iov.len() {
            metrics::TX_RING_FULL.increment();
            return Err(Error::RingFull);
        }
        let last = iov.len() - 1;
        for (i, frag) in iov.iter().enumerate() {
            // Only the last descriptor carries the id, so the packet is
            // handed back once.
            let (frag_id, flags) = if i == last {
                (id, 0)
            } else {
                (FREE_ID, TX_DESC_CONT)
            };
            let slot = self.txq.push(frag_id);
            Self::write_desc(&self.tx, slot, frag.addr, frag.len, flags);
        }
        metrics::TX_POSTED.increment();
        Ok(())
    }

    fn transmit_push(&mut self) {
        let added = self.txq.added();
        self.tx_producer.publish(added);
        self.doorbell.ring(DoorbellQueue::Tx, added);
    }

    fn receive_init(&mut self, addr: u64, id: u32) -> Result<()> {
        let slot = self
            .rxq
            .post(id)
            .inspect_err(|_| metrics::RX_RING_FULL.increment())?;
        Self::write_desc(&self.rx, slot, addr, self.rx_buffer_len, 0);
        metrics::RX_POSTED.increment();
        Ok(())
    }

    fn receive_push(&mut self) {
        let added = self.rxq.added();
        self.rx_producer.publish(added);
        self.doorbell.ring(DoorbellQueue::Rx, added);
    }

    fn poll(&mut self, max: usize, events: &mut Vec<Event>) -> usize {
        debug_assert!(!self.evq.overflowed(), "event queue overflowed");
        let mut n = 0;
        while n < max {
            let Some(event) = self.evq.peek() else { break };
            match EV_TYPE.get(event) {
                EVENT_TYPE_RX => {
                    let rx = self.rx_event(event);
                    events.push(Event::Rx(rx));
                    n += 1;
                }
                EVENT_TYPE_TX => {
                    let tx = self.tx_event(event);
                    events.push(Event::Tx(tx));
                    n += 1;
                }
                EVENT_TYPE_CONTROL => {}
                _ => warn!("unexpected event {event:#018x} at {}", self.evq.offset()),
            }
            self.evq.advance();
        }
        n
    }

    fn has_event(&self) -> bool {
        self.evq.has_event()
    }

    fn evq_reinit(&mut self) {
        self.evq.reset();
        self.in_jumbo = false;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::arch::Arch;
    use crate::evq::EV_PHASE;

    struct Nic {
        vi: DescVi,
        tx: SharedRegion,
        rx: SharedRegion,
        evq: SharedRegion,
        producers: SharedRegion,
        ev_ptr: usize,
        rung: Rc<RefCell<Vec<(DoorbellQueue, u32)>>>,
    }

    impl Nic {
        fn new() -> Self {
            let config = Config {
                arch: Arch::DescRing,
                rxq_size: 8,
                txq_size: 8,
                evq_size: 8,
                rx_prefix_len: 14,
                ..Config::default()
            };
            let rings = DescRings::anonymous(&config).unwrap();
            let (tx, rx, evq) = (rings.tx.clone(), rings.rx.clone(), rings.evq.clone());
            let producers = rings.producers.clone();
            let rung = Rc::new(RefCell::new(Vec::new()));
            let log = rung.clone();
            let doorbell = Box::new(move |q: DoorbellQueue, p: u32| log.borrow_mut().push((q, p)));
            Nic {
                vi: DescVi::new(&config, rings, doorbell).unwrap(),
                tx,
                rx,
                evq,
                producers,
                ev_ptr: 0,
                rung,
            }
        }

        fn event(&mut self, kind: u64, payload: u64) {
            let lap = (self.ev_ptr / 64) & 1;
            let ev = EV_PHASE.put(EV_TYPE.put(payload, kind), lap as u64);
            self.evq.write_u64(self.ev_ptr % 64, ev);
            self.ev_ptr += 8;
        }

        fn rx_done(&mut self, ptr: u64, bytes: u64, cont: bool) {
            let mut ev = RX_EV_PTR.put(0, ptr);
            ev = RX_EV_BYTES.put(ev, bytes);
            ev = RX_EV_LABEL.put(ev, 2);
            ev = RX_EV_CONT.put(ev, cont as u64);
            self.event(EVENT_TYPE_RX, ev);
        }

        fn tx_done(&mut self, ptr: u64) {
            self.event(EVENT_TYPE_TX, TX_EV_PTR.put(0, ptr));
        }

        fn poll(&mut self) -> Vec<Event> {
            let mut events = Vec::new();
            self.vi.poll(16, &mut events);
            events
        }
    }

    #[test]
    fn fragments_chained() {
        let mut nic = Nic::new();
        nic.vi
            .transmitv(&[IoVec::new(0x1000, 14), IoVec::new(0x2000, 100)], 42)
            .unwrap();
        assert_eq!(nic.tx.read_u64(0), 0x1000);
        assert_eq!(nic.tx.read_u32(8), 14);
        assert_eq!(nic.tx.read_u32(12), TX_DESC_CONT);
        assert_eq!(nic.tx.read_u64(16), 0x2000);
        assert_eq!(nic.tx.read_u32(28), 0);
        assert_eq!(*nic.rung.borrow(), vec![(DoorbellQueue::Tx, 2)]);

        nic.tx_done(1);
        let events = nic.poll();
        let mut done = Vec::new();
        let tx = events[0].as_tx().unwrap();
        assert_eq!(tx.desc_id, 2);
        nic.vi.txq_mut().complete_to(tx.desc_id, &mut done);
        assert_eq!(done, vec![42]);
    }

    #[test]
    fn fragments_need_room_for_all() {
        let mut nic = Nic::new();
        for id in 0..6 {
            nic.vi.transmit_init(0, 64, id).unwrap();
        }
        let iov = [IoVec::new(0, 1), IoVec::new(0, 1), IoVec::new(0, 1)];
        assert!(matches!(nic.vi.transmitv_init(&iov, 9), Err(Error::RingFull)));
        assert_eq!(nic.vi.txq().added(), 6);
        nic.vi.transmitv_init(&iov[..2], 9).unwrap();
    }

    #[test]
    fn producer_index_visible_before_doorbell() {
        let mut nic = Nic::new();
        let tx = nic.producers.counter(TX_PRODUCER_OFFSET);
        let rx = nic.producers.counter(RX_PRODUCER_OFFSET);
        nic.vi.transmit_init(0, 64, 1).unwrap();
        nic.vi.transmit_init(0, 64, 2).unwrap();
        assert_eq!(tx.observe(), 0);
        nic.vi.transmit_push();
        assert_eq!(tx.observe(), 2);

        nic.vi.receive_init(0, 3).unwrap();
        nic.vi.receive_push();
        assert_eq!(rx.observe(), 1);
        assert_eq!(tx.observe(), 2);
        assert_eq!(
            *nic.rung.borrow(),
            vec![(DoorbellQueue::Tx, 2), (DoorbellQueue::Rx, 1)]
        );
    }

    #[test]
    fn producers_region_too_small() {
        let config = Config {
            arch: Arch::DescRing,
            rxq_size: 8,
            txq_size: 8,
            evq_size: 8,
            ..Config::default()
        };
        let mut rings = DescRings::anonymous(&config).unwrap();
        rings.producers = SharedRegion::anonymous(4).unwrap();
        let doorbell = Box::new(|_: DoorbellQueue, _: u32| {});
        assert!(matches!(
            DescVi::new(&config, rings, doorbell),
            Err(Error::RingSetup(_))
        ));
    }

    #[test]
    fn receive_descriptor_and_doorbell() {
        let mut nic = Nic::new();
        nic.vi.receive_init(0x8000, 5).unwrap();
        nic.vi.receive_init(0x9000, 6).unwrap();
        assert!(nic.rung.borrow().is_empty());
        nic.vi.receive_push();
        assert_eq!(*nic.rung.borrow(), vec![(DoorbellQueue::Rx, 2)]);
        assert_eq!(nic.rx.read_u64(16), 0x9000);
        assert_eq!(nic.rx.read_u32(24), 2048);
    }

    #[test]
    fn jumbo_receive_flags() {
        let mut nic = Nic::new();
        for id in 0..3 {
            nic.vi.receive_init(0, id).unwrap();
        }
        nic.rx_done(0, 2048, true);
        nic.rx_done(1, 2048, true);
        nic.rx_done(2, 100, false);
        let events = nic.poll();
        let rx: Vec<_> = events.iter().filter_map(Event::as_rx).collect();
        assert_eq!(rx.len(), 3);
        assert_eq!(rx[0].flags, EventFlags::SOP | EventFlags::CONT);
        assert_eq!(rx[0].offset, 14);
        assert_eq!(rx[1].flags, EventFlags::CONT);
        assert_eq!(rx[1].offset, 0);
        assert_eq!(rx[2].flags, EventFlags::empty());
        assert_eq!(rx[2].rq_id, 2);
        assert_eq!(rx[2].len, 100);
        assert_eq!(rx[2].queue, 2);
    }

    #[test]
    fn tx_pointer_wraps() {
        let mut nic = Nic::new();
        nic.vi.txq = RingState::with_start(8, 0xfffe);
        for id in 0..3 {
            nic.vi.transmit_init(0, 64, id).unwrap();
        }
        // Last completed descriptor is 0x10000, i.e. pointer 0.
        nic.tx_done(0);
        let events = nic.poll();
        assert_eq!(events[0].as_tx().map(|t| t.desc_id), Some(0x1_0001));
    }

    #[test]
    fn events_follow_ring_laps() {
        let mut nic = Nic::new();
        // Half a ring per batch, so the entry before the read pointer is
        // never overwritten.
        for batch in 0..6u32 {
            for i in 0..4 {
                let id = batch * 4 + i;
                nic.vi.receive_init(0, id).unwrap();
                nic.rx_done(id as u64, 60, false);
            }
            let events = nic.poll();
            assert_eq!(events.len(), 4, "batch {batch}");
            assert_eq!(events[3].as_rx().map(|rx| rx.rq_id), Some(batch * 4 + 3));
            assert!(!nic.vi.has_event());
        }
    }

    #[test]
    fn control_and_unknown_events_skipped() {
        let mut nic = Nic::new();
        nic.vi.receive_init(0, 1).unwrap();
        nic.event(EVENT_TYPE_CONTROL, 0);
        nic.event(7, 0);
        nic.rx_done(0, 60, false);
        let events = nic.poll();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn evq_reinit_clears_pending() {
        let mut nic = Nic::new();
        nic.vi.receive_init(0, 1).unwrap();
        nic.rx_done(0, 60, false);
        assert!(nic.vi.has_event());
        nic.vi.evq_reinit();
        assert!(!nic.vi.has_event());
    }
}
