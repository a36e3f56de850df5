//! EFCT backend.
//!
//! Receive does not use per-packet buffers: the kernel hands over whole
//! superbufs which the NIC fills in order, and packets are read in place
//! and released back by id. Transmit streams frames straight into the CTPIO
//! aperture. DMA-style transmits name offsets into registered packet buffer
//! memory and are copied through CTPIO with cut-through disabled.

mod ctpio;
mod rx;
mod superbuf;
mod tx;

pub use superbuf::{RXQ_SHM_BYTES, SuperbufRefresh};

use log::debug;

use crate::arch::ViFlags;
use crate::config::{Config, EFCT_FRAME_OFFSET};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::evq::EventRing;
use crate::pkt_id::PacketId;
use crate::region::SharedRegion;
use crate::ring::RingState;
use crate::vi::{IoVec, ViOps};

use rx::Geometry;
use superbuf::{EfctRxq, RxqShm};
use tx::CtpioTx;

/// Poll strategy, fixed at construction from the VI flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Only receive queue 0, no transmit.
    SingleRx,
    /// Receive queue 0, then transmit completions.
    SingleRxTx,
    /// Every receive queue slot in turn, then transmit completions.
    Generic,
}

pub struct EfctVi {
    rxq: RingState,
    txq: RingState,
    rxqs: Vec<Option<EfctRxq>>,
    tx: Option<CtpioTx>,
    packet_buffers: Option<SharedRegion>,
    refresh: Box<dyn SuperbufRefresh>,
    mode: PollMode,
    geo: Geometry,
    superbuf_pkts: u32,
    max_superbufs: usize,
}

impl EfctVi {
    /// `evq` and `aperture` are required when the VI can transmit.
    pub fn new(
        config: &Config,
        evq: Option<SharedRegion>,
        aperture: Option<SharedRegion>,
        refresh: Box<dyn SuperbufRefresh>,
    ) -> Result<Self> {
        let uniqueue = config.flags.contains(ViFlags::EFCT_UNIQUEUE);
        let tx = if config.txq_size == 0 {
            None
        } else {
            let (Some(evq), Some(aperture)) = (evq, aperture) else {
                return Err(Error::RingSetup(
                    "EFCT transmit needs an event queue and a CTPIO aperture".into(),
                ));
            };
            let evq = EventRing::new(evq, config.evq_size)?;
            Some(CtpioTx::new(
                &config.efct,
                config.txq_size,
                aperture,
                evq,
                config.flags.contains(ViFlags::TX_TIMESTAMPS),
            )?)
        };
        let mode = match (uniqueue, tx.is_some()) {
            (true, false) => PollMode::SingleRx,
            (true, true) => PollMode::SingleRxTx,
            (false, _) => PollMode::Generic,
        };
        let slots = if uniqueue { 1 } else { config.efct.max_rxqs };
        Ok(EfctVi {
            rxq: RingState::new(config.rxq_size),
            txq: RingState::new(config.txq_size),
            rxqs: (0..slots).map(|_| None).collect(),
            tx,
            packet_buffers: None,
            refresh,
            mode,
            geo: Geometry {
                superbuf_bytes: config.efct.superbuf_bytes,
                pkt_stride: config.efct.pkt_stride,
            },
            superbuf_pkts: config.efct.superbuf_pkts(),
            max_superbufs: config.efct.max_superbufs,
        })
    }

    pub fn poll_mode(&self) -> PollMode {
        self.mode
    }

    /// Attach a receive queue in the first free slot and return its index.
    ///
    /// `shm` is the queue's handover block ([`RXQ_SHM_BYTES`] long) and
    /// `superbufs` the address space its superbufs are mapped into. The first
    /// poll remaps before reading anything.
    pub fn attach_rxq(&mut self, shm: SharedRegion, superbufs: SharedRegion) -> Result<usize> {
        if self.rxq.capacity() == 0 {
            return Err(Error::Unsupported("receive disabled on this VI"));
        }
        let Some(ix) = self.rxqs.iter().position(Option::is_none) else {
            return Err(Error::RxqLimit);
        };
        let needed = self.max_superbufs * self.geo.superbuf_bytes;
        if superbufs.len() < needed {
            return Err(Error::RingSetup(format!(
                "superbuf space of {} bytes, need {needed}",
                superbufs.len()
            )));
        }
        let shm = RxqShm::new(shm)?;
        self.rxqs[ix] = Some(EfctRxq::new(
            ix,
            shm,
            superbufs,
            self.superbuf_pkts,
            self.max_superbufs,
        ));
        debug!("attached EFCT rxq {ix} ({} packets per superbuf)", self.superbuf_pkts);
        Ok(ix)
    }

    /// Register the memory `transmit` addresses refer to. An [`IoVec`]
    /// address is a byte offset into `region`.
    pub fn register_packet_buffers(&mut self, region: SharedRegion) {
        debug!("registered {} bytes of EFCT packet buffers", region.len());
        self.packet_buffers = Some(region);
    }

    fn rxq_for(&self, pkt: PacketId) -> &EfctRxq {
        match self.rxqs.get(pkt.rxq()) {
            Some(Some(rxq)) => rxq,
            _ => panic!("packet {:#x} from an unattached queue", pkt.raw()),
        }
    }

    /// Give a delivered packet back. Each packet must be released exactly
    /// once; the superbuf returns to the kernel with its last packet.
    pub fn release_packet(&mut self, pkt_id: u32) {
        let pkt = PacketId::from_raw(pkt_id);
        match self.rxqs.get_mut(pkt.rxq()) {
            Some(Some(rxq)) => rxq.release(pkt),
            _ => panic!("packet {pkt_id:#x} from an unattached queue"),
        }
    }

    /// Frame bytes of a delivered, unreleased packet.
    pub fn rx_packet(&self, pkt_id: u32, len: usize) -> &[u8] {
        let pkt = PacketId::from_raw(pkt_id);
        assert!(
            EFCT_FRAME_OFFSET + len <= self.geo.pkt_stride,
            "frame of {len} bytes overruns the packet slot"
        );
        let rxq = self.rxq_for(pkt);
        let off = rxq.slot_offset(pkt, self.geo.superbuf_bytes, self.geo.pkt_stride);
        // Safety: the superbuf cannot be refilled until this packet is
        // released, which needs `&mut self`.
        unsafe { rxq.superbufs().slice(off + EFCT_FRAME_OFFSET, len) }
    }

    /// CTPIO FIFO bytes currently free.
    pub fn transmit_space_bytes(&self) -> usize {
        self.tx.as_ref().map_or(0, CtpioTx::space_bytes)
    }

    fn poll_rx(&mut self, ix: usize, max: usize, events: &mut Vec<Event>) -> usize {
        let Some(rxq) = self.rxqs[ix].as_mut() else {
            return 0;
        };
        rx::poll_rxq(ix, rxq, self.refresh.as_mut(), self.geo, max, events)
    }

    fn poll_tx(&mut self, max: usize, events: &mut Vec<Event>) -> usize {
        match self.tx.as_mut() {
            Some(tx) => tx.poll(&mut self.txq, max, events),
            None => 0,
        }
    }
}

impl ViOps for EfctVi {
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
        let Some(bufs) = self.packet_buffers.as_ref() else {
            return Err(Error::Unsupported("EFCT transmit needs registered packet buffers"));
        };
        let Some(tx) = self.tx.as_mut() else {
            return Err(Error::Unsupported("transmit disabled on this VI"));
        };
        let mut frags = Vec::with_capacity(iov.len());
        for v in iov {
            let end = v.addr.checked_add(v.len as u64);
            if end.is_none_or(|end| end > bufs.len() as u64) {
                return Err(Error::BadAddress {
                    addr: v.addr,
                    len: v.len,
                });
            }
            // Safety: the caller owns the buffer until its completion.
            frags.push(unsafe { bufs.slice(v.addr as usize, v.len as usize) });
        }
        tx.copy(&mut self.txq, &frags, id)
    }

    fn transmit_push(&mut self) {}

    fn can_transmit_ctpio(&self, len: usize) -> bool {
        self.tx
            .as_ref()
            .is_some_and(|tx| tx.can_transmit(&self.txq, len))
    }

    fn transmitv_ctpio(&mut self, frame_len: usize, frags: &[&[u8]], threshold: usize) {
        let Some(tx) = self.tx.as_mut() else {
            panic!("CTPIO send on a VI without a transmit queue");
        };
        assert!(
            tx.can_transmit(&self.txq, frame_len),
            "CTPIO send of {frame_len} bytes without space"
        );
        debug_assert_eq!(frags.iter().map(|f| f.len()).sum::<usize>(), frame_len);
        // No request id of its own: completions hand back 0.
        tx.write(&mut self.txq, frags, frame_len, ctpio::ct_threshold(threshold), 0);
    }

    fn transmit_copy(&mut self, frags: &[&[u8]], id: u32) -> Result<()> {
        match self.tx.as_mut() {
            Some(tx) => tx.copy(&mut self.txq, frags, id),
            None => Err(Error::Unsupported("transmit disabled on this VI")),
        }
    }

    fn receive_init(&mut self, _addr: u64, _id: u32) -> Result<()> {
        Err(Error::Unsupported("EFCT receives into kernel superbufs"))
    }

    fn receive_push(&mut self) {}

    fn poll(&mut self, max: usize, events: &mut Vec<Event>) -> usize {
        let mut n = 0;
        match self.mode {
            PollMode::SingleRx => n += self.poll_rx(0, max, events),
            PollMode::SingleRxTx => {
                n += self.poll_rx(0, max, events);
                if n < max {
                    n += self.poll_tx(max - n, events);
                }
            }
            PollMode::Generic => {
                for ix in 0..self.rxqs.len() {
                    if n == max {
                        break;
                    }
                    n += self.poll_rx(ix, max - n, events);
                }
                if n < max {
                    n += self.poll_tx(max - n, events);
                }
            }
        }
        n
    }

    fn has_event(&self) -> bool {
        self.tx.as_ref().is_some_and(CtpioTx::has_event)
            || self.rxqs.iter().flatten().any(|rxq| rxq.has_packet(self.geo))
    }

    fn evq_reinit(&mut self) {
        if let Some(tx) = self.tx.as_mut() {
            tx.evq_reset();
        }
    }

    fn txq_reinit(&mut self, f: &mut dyn FnMut(u32)) {
        self.txq.reset(f);
        if let Some(tx) = self.tx.as_mut() {
            tx.reset();
        }
    }
}
