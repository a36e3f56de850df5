//! AF_XDP backend.
//!
//! An XDP socket shares four single-producer/single-consumer rings with the
//! kernel. We produce into the fill ring (empty receive buffers) and the TX
//! ring (frames to send); the kernel produces into the RX ring (filled
//! buffers) and the completion ring (sent frames). Each ring has a producer
//! and a consumer index on separate cache lines followed by the descriptor
//! array.
//!
//! Request ids for receive buffers ride in `rxq` and are matched to RX ring
//! entries in order; transmit ids ride in `txq` and are released when the
//! completion ring's consumer index passes them.
//!
//! Transmission needs a syscall (the "kick"). The kernel may send only part
//! of the queue per kick, so `txq.previous` records how far the last
//! successful kick reached and polling kicks again until it covers `added`.

use std::io;
use std::os::fd::RawFd;

use log::warn;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventFlags, RxEvent, TxEvent};
use crate::metrics;
use crate::region::{SharedCounter, SharedRegion};
use crate::ring::{FREE_ID, RingState};
use crate::vi::{IoVec, ViOps};

/// Location of a ring's indices and descriptors within its mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XdpRingOffsets {
    pub producer: usize,
    pub consumer: usize,
    pub desc: usize,
}

impl XdpRingOffsets {
    /// Producer, consumer and descriptors each on their own cache line.
    pub const STANDARD: XdpRingOffsets = XdpRingOffsets {
        producer: 0,
        consumer: 64,
        desc: 128,
    };
}

/// Entry format of an XDP ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdpRingKind {
    /// Fill and completion rings: one u64 umem address per entry.
    Addr,
    /// RX and TX rings: `{ addr: u64, len: u32, options: u32 }`.
    Desc,
}

impl XdpRingKind {
    fn entry_bytes(self) -> usize {
        match self {
            XdpRingKind::Addr => 8,
            XdpRingKind::Desc => 16,
        }
    }
}

/// One of the four rings of an XDP socket.
pub struct XdpRing {
    region: SharedRegion,
    producer: SharedCounter,
    consumer: SharedCounter,
    desc: usize,
    kind: XdpRingKind,
    mask: u32,
}

impl XdpRing {
    /// Wrap a ring mapped by the kernel.
    pub fn new(
        region: SharedRegion,
        offsets: XdpRingOffsets,
        entries: u32,
        kind: XdpRingKind,
    ) -> Result<Self> {
        if entries == 0 || !entries.is_power_of_two() {
            return Err(Error::RingSetup(
                "XDP ring size must be a power of two".into(),
            ));
        }
        let desc_end = entries as usize * kind.entry_bytes() + offsets.desc;
        let index_end = offsets.producer.max(offsets.consumer) + 4;
        if desc_end > region.len() || index_end > region.len() {
            return Err(Error::RingSetup(format!(
                "XDP ring of {entries} entries does not fit a {} byte mapping",
                region.len()
            )));
        }
        if offsets.producer % 4 != 0 || offsets.consumer % 4 != 0 || offsets.desc % 8 != 0 {
            return Err(Error::RingSetup("misaligned XDP ring offsets".into()));
        }
        Ok(XdpRing {
            producer: region.counter(offsets.producer),
            consumer: region.counter(offsets.consumer),
            region,
            desc: offsets.desc,
            kind,
            mask: entries - 1,
        })
    }

    /// A ring in fresh anonymous memory with [`XdpRingOffsets::STANDARD`].
    pub fn anonymous(entries: u32, kind: XdpRingKind) -> Result<Self> {
        let len = XdpRingOffsets::STANDARD.desc + entries as usize * kind.entry_bytes();
        let region = SharedRegion::anonymous(len)?;
        Self::new(region, XdpRingOffsets::STANDARD, entries, kind)
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn producer(&self) -> &SharedCounter {
        &self.producer
    }

    pub fn consumer(&self) -> &SharedCounter {
        &self.consumer
    }

    pub fn entries(&self) -> u32 {
        self.mask + 1
    }

    /// Byte offset of the entry for index `i`.
    pub fn entry_offset(&self, i: u32) -> usize {
        self.desc + (i & self.mask) as usize * self.kind.entry_bytes()
    }

    fn write_addr(&self, i: u32, addr: u64) {
        debug_assert_eq!(self.kind, XdpRingKind::Addr);
        self.region.write_u64(self.entry_offset(i), addr);
    }

    fn write_desc(&self, i: u32, addr: u64, len: u32) {
        debug_assert_eq!(self.kind, XdpRingKind::Desc);
        let off = self.entry_offset(i);
        self.region.write_u64(off, addr);
        self.region.write_u32(off + 8, len);
        self.region.write_u32(off + 12, 0);
    }

    fn read_desc(&self, i: u32) -> (u64, u32) {
        debug_assert_eq!(self.kind, XdpRingKind::Desc);
        let off = self.entry_offset(i);
        (self.region.read_u64(off), self.region.read_u32(off + 8))
    }

    /// Entries the producer has published beyond our consumer index.
    fn pending(&self) -> bool {
        self.producer.observe() != self.consumer.load()
    }
}

/// The four rings of one XDP socket.
pub struct AfXdpRings {
    pub fill: XdpRing,
    pub completion: XdpRing,
    pub rx: XdpRing,
    pub tx: XdpRing,
}

impl AfXdpRings {
    /// Rings in anonymous memory, sized for `config`.
    pub fn anonymous(config: &Config) -> Result<Self> {
        let rx = config.rxq_size.max(1);
        let tx = config.txq_size.max(1);
        Ok(AfXdpRings {
            fill: XdpRing::anonymous(rx, XdpRingKind::Addr)?,
            completion: XdpRing::anonymous(tx, XdpRingKind::Addr)?,
            rx: XdpRing::anonymous(rx, XdpRingKind::Desc)?,
            tx: XdpRing::anonymous(tx, XdpRingKind::Desc)?,
        })
    }
}

/// Asks the kernel to start transmitting.
pub trait Kick {
    fn kick(&mut self) -> io::Result<()>;
}

impl<F: FnMut() -> io::Result<()>> Kick for F {
    fn kick(&mut self) -> io::Result<()> {
        self()
    }
}

/// Kicks an XDP socket with a zero-length non-blocking `sendto`.
pub struct SocketKick {
    fd: RawFd,
}

impl SocketKick {
    pub fn new(fd: RawFd) -> Self {
        SocketKick { fd }
    }
}

impl Kick for SocketKick {
    fn kick(&mut self) -> io::Result<()> {
        let rc = unsafe {
            libc::sendto(
                self.fd,
                std::ptr::null(),
                0,
                libc::MSG_DONTWAIT,
                std::ptr::null(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

pub struct AfXdpVi {
    rxq: RingState,
    txq: RingState,
    rings: AfXdpRings,
    kick: Box<dyn Kick>,
    rx_buffer_len: u32,
    tx_batch: u32,
}

impl AfXdpVi {
    pub fn new(config: &Config, rings: AfXdpRings, kick: Box<dyn Kick>) -> Result<Self> {
        debug_assert!(config.rx_buffer_len.is_power_of_two());
        if config.rxq_size != 0
            && (rings.fill.entries() != config.rxq_size || rings.rx.entries() != config.rxq_size)
        {
            return Err(Error::RingSetup(
                "fill and RX rings must match rxq_size".into(),
            ));
        }
        if config.txq_size != 0
            && (rings.tx.entries() != config.txq_size
                || rings.completion.entries() != config.txq_size)
        {
            return Err(Error::RingSetup(
                "TX and completion rings must match txq_size".into(),
            ));
        }
        Ok(AfXdpVi {
            rxq: RingState::new(config.rxq_size),
            txq: RingState::new(config.txq_size),
            rings,
            kick,
            rx_buffer_len: config.rx_buffer_len,
            tx_batch: config.tx_batch,
        })
    }

    pub fn rings(&self) -> &AfXdpRings {
        &self.rings
    }

    fn need_kick(&self) -> bool {
        self.txq.previous() != self.txq.added()
    }

    fn kick(&mut self) {
        match self.kick.kick() {
            Ok(()) => {
                self.txq.set_previous(self.txq.added());
                metrics::TX_KICKS.increment();
            }
            Err(e) => {
                // Retried from the next poll that sees a completion.
                warn!("AF_XDP kick failed: {e}");
                metrics::TX_KICK_FAILURES.increment();
            }
        }
    }

    fn poll_rx(&mut self, max: usize, events: &mut Vec<Event>) -> usize {
        let ring = &self.rings.rx;
        let mut cons = ring.consumer.load();
        let prod = ring.producer.observe();
        if cons == prod {
            return 0;
        }
        let mut n = 0;
        loop {
            let (addr, len) = ring.read_desc(cons);
            let rq_id = self.rxq.complete();
            debug_assert!(rq_id.is_some(), "kernel filled a buffer we never posted");
            events.push(Event::Rx(RxEvent {
                queue: 0,
                rq_id: rq_id.unwrap_or(FREE_ID),
                len,
                // Headroom varies per buffer; recover it from the address.
                offset: (addr & (self.rx_buffer_len as u64 - 1)) as u32,
                flags: EventFlags::SOP,
            }));
            n += 1;
            cons = cons.wrapping_add(1);
            if cons == prod || n == max {
                break;
            }
        }
        // Release ordering keeps the descriptor reads above from being
        // overtaken by the kernel refilling those entries.
        ring.consumer.publish(cons);
        metrics::RX_DELIVERED.add(n as u64);
        n
    }

    fn poll_completions(&mut self, max: usize, events: &mut Vec<Event>) -> usize {
        let ring = &self.rings.completion;
        let mut cons = ring.consumer.load();
        let prod = ring.producer.observe();
        if cons == prod {
            return 0;
        }
        let mut n = 0;
        loop {
            if prod.wrapping_sub(cons) <= self.tx_batch {
                cons = prod;
            } else {
                cons = cons.wrapping_add(self.tx_batch);
            }
            events.push(Event::Tx(TxEvent {
                queue: 0,
                desc_id: cons,
                flags: EventFlags::empty(),
            }));
            n += 1;
            if cons == prod || n == max {
                break;
            }
        }
        // Completion entries are never read, only counted, so no ordering is
        // needed here.
        ring.consumer.store(cons);
        if self.need_kick() {
            self.kick();
        }
        n
    }
}

impl ViOps for AfXdpVi {
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
        assert_eq!(iov.len(), 1, "AF_XDP sends each packet from a single buffer");
        let slot = self.txq.post(id).inspect_err(|_| metrics::TX_RING_FULL.increment())?;
        let added = self.txq.added().wrapping_sub(1);
        debug_assert_eq!(added & self.txq.mask(), slot);
        self.rings.tx.write_desc(added, iov[0].addr, iov[0].len);
        metrics::TX_POSTED.increment();
        Ok(())
    }

    fn transmit_push(&mut self) {
        self.rings.tx.producer.publish(self.txq.added());
        self.kick();
    }

    fn receive_init(&mut self, addr: u64, id: u32) -> Result<()> {
        self.rxq.post(id).inspect_err(|_| metrics::RX_RING_FULL.increment())?;
        let added = self.rxq.added().wrapping_sub(1);
        self.rings.fill.write_addr(added, addr);
        metrics::RX_POSTED.increment();
        Ok(())
    }

    fn receive_push(&mut self) {
        self.rings.fill.producer.publish(self.rxq.added());
    }

    fn poll(&mut self, max: usize, events: &mut Vec<Event>) -> usize {
        let mut n = 0;
        // Transmit-only sockets have no RX ring to look at.
        if n < max && self.rxq.capacity() != 0 {
            n += self.poll_rx(max - n, events);
        }
        if n < max && self.txq.capacity() != 0 {
            n += self.poll_completions(max - n, events);
        }
        n
    }

    fn has_event(&self) -> bool {
        (self.rxq.capacity() != 0 && self.rings.rx.pending())
            || (self.txq.capacity() != 0 && self.rings.completion.pending())
    }
}
