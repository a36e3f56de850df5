//! EFCT transmit: CTPIO sends and their completion events.

use log::warn;

use super::ctpio::{self, CtpioWriter, MAX_FRAME_LEN};
use crate::bits::Field;
use crate::config::{CTPIO_HEADER_BYTES, EfctConfig};
use crate::error::{Error, Result};
use crate::event::{Event, EventFlags, TxEvent};
use crate::evq::{EV_TYPE, EventRing};
use crate::metrics;
use crate::region::SharedRegion;
use crate::ring::RingState;

pub(crate) const EVENT_TYPE_TX: u64 = 0;
pub(crate) const EVENT_TYPE_CONTROL: u64 = 3;

pub(crate) const TX_EVENT_SEQUENCE: Field = Field::new(0, 8);
pub(crate) const TX_EVENT_LABEL: Field = Field::new(8, 6);

const SEQUENCE_MASK: u32 = TX_EVENT_SEQUENCE.max() as u32;

pub(crate) struct CtpioTx {
    aperture: SharedRegion,
    aperture_bytes: usize,
    fifo_bytes: usize,
    /// Free-running aperture bytes written and completed.
    ct_added: u32,
    ct_removed: u32,
    /// Aperture span of each outstanding send, by ring slot.
    lens: Box<[u32]>,
    evq: EventRing,
    timestamps: bool,
}

impl CtpioTx {
    pub(crate) fn new(
        efct: &EfctConfig,
        txq_size: u32,
        aperture: SharedRegion,
        mut evq: EventRing,
        timestamps: bool,
    ) -> Result<Self> {
        if aperture.len() < 2 * efct.ctpio_aperture_bytes {
            return Err(Error::RingSetup(format!(
                "CTPIO aperture of {} bytes must be mapped twice, region has {}",
                efct.ctpio_aperture_bytes,
                aperture.len()
            )));
        }
        evq.reset();
        Ok(CtpioTx {
            aperture,
            aperture_bytes: efct.ctpio_aperture_bytes,
            fifo_bytes: efct.ctpio_fifo_bytes,
            ct_added: 0,
            ct_removed: 0,
            lens: vec![0; txq_size as usize].into_boxed_slice(),
            evq,
            timestamps,
        })
    }

    /// FIFO bytes not yet claimed by outstanding sends.
    pub(crate) fn space_bytes(&self) -> usize {
        self.fifo_bytes
            .saturating_sub(self.ct_added.wrapping_sub(self.ct_removed) as usize)
    }

    pub(crate) fn can_transmit(&self, txq: &RingState, len: usize) -> bool {
        !txq.is_full()
            && len <= MAX_FRAME_LEN
            && CTPIO_HEADER_BYTES + len <= self.aperture_bytes
            && ctpio::span_for(len) <= self.space_bytes()
    }

    /// Stream a frame into the aperture and record it in the ring. The caller
    /// has checked [`can_transmit`](Self::can_transmit).
    pub(crate) fn write(
        &mut self,
        txq: &mut RingState,
        frags: &[&[u8]],
        len: usize,
        ct_thresh: u64,
        id: u32,
    ) {
        let start = self.ct_added as usize % self.aperture_bytes;
        let mut w = CtpioWriter::new(&self.aperture, start);
        w.word(ctpio::tx_header(len, ct_thresh, self.timestamps));
        for frag in frags {
            w.block(frag);
        }
        let span = w.finish() - start;

        let slot = txq.push(id);
        self.lens[slot as usize] = span as u32;
        self.ct_added = self.ct_added.wrapping_add(span as u32);
        metrics::CTPIO_BYTES.add(span as u64);
        metrics::TX_POSTED.increment();
    }

    /// Send with cut-through disabled, failing when there is no room.
    pub(crate) fn copy(&mut self, txq: &mut RingState, frags: &[&[u8]], id: u32) -> Result<()> {
        let len = frags.iter().map(|f| f.len()).sum();
        if !self.can_transmit(txq, len) {
            metrics::TX_RING_FULL.increment();
            return Err(Error::RingFull);
        }
        self.write(txq, frags, len, ctpio::CT_DISABLE, id);
        Ok(())
    }

    fn handle_event(&mut self, txq: &mut RingState, event: u64) -> TxEvent {
        let seq = TX_EVENT_SEQUENCE.get(event) as u32;
        // Both ends of the range are inclusive: run `previous` one past the
        // completed sequence number.
        while txq.previous() & SEQUENCE_MASK != seq.wrapping_add(1) & SEQUENCE_MASK {
            let slot = txq.advance_previous();
            self.ct_removed = self.ct_removed.wrapping_add(self.lens[slot]);
        }
        TxEvent {
            queue: TX_EVENT_LABEL.get(event) as u16,
            desc_id: txq.previous(),
            flags: EventFlags::CTPIO,
        }
    }

    pub(crate) fn poll(&mut self, txq: &mut RingState, max: usize, events: &mut Vec<Event>) -> usize {
        debug_assert!(!self.evq.overflowed(), "EFCT event queue overflowed");
        let mut n = 0;
        while n < max {
            let Some(event) = self.evq.peek() else { break };
            match EV_TYPE.get(event) {
                EVENT_TYPE_TX => {
                    events.push(Event::Tx(self.handle_event(txq, event)));
                    n += 1;
                }
                EVENT_TYPE_CONTROL => {}
                _ => warn!("unexpected EFCT event {event:#018x}"),
            }
            self.evq.advance();
        }
        n
    }

    pub(crate) fn has_event(&self) -> bool {
        self.evq.has_event()
    }

    pub(crate) fn evq_reset(&mut self) {
        self.evq.reset();
    }

    /// Forget every outstanding send.
    pub(crate) fn reset(&mut self) {
        self.ct_added = 0;
        self.ct_removed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evq::EV_PHASE;

    const APERTURE: usize = 1024;
    const FIFO: usize = 512;

    struct Harness {
        tx: CtpioTx,
        txq: RingState,
        aperture: SharedRegion,
        evq: SharedRegion,
        ev_ptr: usize,
    }

    impl Harness {
        fn new() -> Self {
            let efct = EfctConfig {
                ctpio_aperture_bytes: APERTURE,
                ctpio_fifo_bytes: FIFO,
                ..EfctConfig::default()
            };
            let aperture = SharedRegion::anonymous(2 * APERTURE).unwrap();
            let evq = SharedRegion::anonymous(8 * 8).unwrap();
            let ring = EventRing::new(evq.clone(), 8).unwrap();
            Harness {
                tx: CtpioTx::new(&efct, 16, aperture.clone(), ring, false).unwrap(),
                txq: RingState::new(16),
                aperture,
                evq,
                ev_ptr: 0,
            }
        }

        fn send(&mut self, len: usize, id: u32) -> Result<()> {
            let data = vec![0x5a; len];
            self.tx.copy(&mut self.txq, &[&data], id)
        }

        /// Hardware: post an event with the phase for the current lap.
        fn event(&mut self, kind: u64, payload: u64) {
            let phase = (self.ev_ptr / 64) & 1 == 1;
            let mut ev = EV_TYPE.put(payload, kind);
            ev = EV_PHASE.put(ev, phase as u64);
            self.evq.write_u64(self.ev_ptr % 64, ev);
            self.ev_ptr += 8;
        }

        fn complete(&mut self, seq: u32) {
            self.event(EVENT_TYPE_TX, TX_EVENT_LABEL.put(seq as u64 & 0xff, 5));
        }

        fn poll(&mut self) -> Vec<Event> {
            let mut events = Vec::new();
            self.tx.poll(&mut self.txq, 16, &mut events);
            events
        }
    }

    #[test]
    fn aperture_must_be_double_mapped() {
        let efct = EfctConfig {
            ctpio_aperture_bytes: APERTURE,
            ..EfctConfig::default()
        };
        let aperture = SharedRegion::anonymous(APERTURE).unwrap();
        let evq = EventRing::new(SharedRegion::anonymous(64).unwrap(), 8).unwrap();
        assert!(matches!(
            CtpioTx::new(&efct, 16, aperture, evq, false),
            Err(Error::RingSetup(_))
        ));
    }

    #[test]
    fn spans_recorded_and_fifo_accounted() {
        let mut h = Harness::new();
        // 60 bytes plus the header spills into a second 64-byte block.
        h.send(60, 1).unwrap();
        h.send(100, 2).unwrap();
        assert_eq!(h.tx.space_bytes(), FIFO - 128 - 128);
        assert_eq!(h.tx.lens[0], 128);
        assert_eq!(h.tx.lens[1], 128);
        // Second packet starts where the first one ended.
        assert_eq!(
            ctpio::TX_HEADER_PACKET_LENGTH.get(h.aperture.read_u64(128)),
            100
        );
    }

    #[test]
    fn header_and_frame_filling_one_block() {
        let mut h = Harness::new();
        h.send(56, 1).unwrap();
        h.send(57, 2).unwrap();
        assert_eq!(h.tx.lens[0], 64);
        assert_eq!(h.tx.lens[1], 128);
        assert_eq!(h.tx.space_bytes(), FIFO - 64 - 128);
        assert_eq!(
            ctpio::TX_HEADER_PACKET_LENGTH.get(h.aperture.read_u64(64)),
            57
        );
    }

    #[test]
    fn fifo_full_is_transient() {
        let mut h = Harness::new();
        for id in 0..4 {
            h.send(100, id).unwrap();
        }
        assert_eq!(h.tx.space_bytes(), 0);
        assert!(matches!(h.send(1, 9), Err(Error::RingFull)));

        h.complete(0);
        let events = h.poll();
        assert_eq!(events.len(), 1);
        assert_eq!(h.tx.space_bytes(), 128);
        h.send(100, 9).unwrap();
    }

    #[test]
    fn oversized_frames_rejected() {
        let h = Harness::new();
        assert!(h.tx.can_transmit(&h.txq, FIFO - CTPIO_HEADER_BYTES));
        assert!(!h.tx.can_transmit(&h.txq, FIFO));
        assert!(!h.tx.can_transmit(&h.txq, MAX_FRAME_LEN + 1));
    }

    #[test]
    fn completion_covers_inclusive_range() {
        let mut h = Harness::new();
        for id in 0..3 {
            h.send(10, id).unwrap();
        }
        h.complete(1);
        let events = h.poll();
        assert_eq!(
            events,
            vec![Event::Tx(TxEvent {
                queue: 5,
                desc_id: 2,
                flags: EventFlags::CTPIO,
            })]
        );
        assert_eq!(h.txq.previous(), 2);
        assert_eq!(h.tx.space_bytes(), FIFO - 64);
    }

    #[test]
    fn sequence_wraps() {
        let mut h = Harness::new();
        h.txq = RingState::with_start(16, 0xfe);
        h.send(10, 1).unwrap();
        h.send(10, 2).unwrap();
        h.send(10, 3).unwrap();
        // Sequence numbers 0xfe, 0xff, 0x00.
        h.complete(0x00);
        let events = h.poll();
        assert_eq!(events[0].as_tx().map(|t| t.desc_id), Some(0x101));
        assert_eq!(h.tx.space_bytes(), FIFO);
    }

    #[test]
    fn control_events_skipped() {
        let mut h = Harness::new();
        h.send(10, 1).unwrap();
        h.event(EVENT_TYPE_CONTROL, 0);
        h.complete(0);
        let events = h.poll();
        assert_eq!(events.len(), 1);
        assert!(!h.tx.has_event());
    }

    #[test]
    #[should_panic(expected = "never posted")]
    fn completion_past_added_panics() {
        let mut h = Harness::new();
        h.send(10, 1).unwrap();
        h.complete(3);
        h.poll();
    }
}
