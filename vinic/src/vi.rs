//! The virtual interface: one architecture-specific backend behind a common
//! producer/consumer API.

use protocol_cpacket::Timestamp;

use crate::af_xdp::{AfXdpRings, AfXdpVi, Kick};
use crate::arch::Arch;
use crate::config::Config;
use crate::desc::{DescRings, DescVi, Doorbell};
use crate::efct::{EfctVi, SuperbufRefresh};
use crate::error::{Error, Result};
use crate::event::{Event, TxEvent};
use crate::metrics;
use crate::region::SharedRegion;
use crate::ring::RingState;

/// One buffer of a DMA transmit: a device address, or on EFCT an offset into
/// the registered packet buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub addr: u64,
    pub len: u32,
}

impl IoVec {
    pub const fn new(addr: u64, len: u32) -> Self {
        IoVec { addr, len }
    }
}

/// Operations every backend provides.
///
/// Posting (`*_init`) only writes ring state; `*_push` makes the new entries
/// visible to the NIC or kernel. Polling appends to `events` and returns how
/// many were appended, never more than `max`.
pub trait ViOps {
    fn rxq(&self) -> &RingState;
    fn rxq_mut(&mut self) -> &mut RingState;
    fn txq(&self) -> &RingState;
    fn txq_mut(&mut self) -> &mut RingState;

    /// Post one packet made of `iov` without telling the NIC.
    fn transmitv_init(&mut self, iov: &[IoVec], id: u32) -> Result<()>;

    fn transmit_push(&mut self);

    fn transmit_init(&mut self, addr: u64, len: u32, id: u32) -> Result<()> {
        self.transmitv_init(&[IoVec::new(addr, len)], id)
    }

    fn transmitv(&mut self, iov: &[IoVec], id: u32) -> Result<()> {
        self.transmitv_init(iov, id)?;
        self.transmit_push();
        Ok(())
    }

    fn transmit(&mut self, addr: u64, len: u32, id: u32) -> Result<()> {
        self.transmitv(&[IoVec::new(addr, len)], id)
    }

    /// Room for a cut-through send of `len` bytes. Backends without CTPIO
    /// treat such sends as no-ops and always have room.
    fn can_transmit_ctpio(&self, _len: usize) -> bool {
        true
    }

    /// Cut-through send of a `frame_len` byte frame. The caller has checked
    /// [`can_transmit_ctpio`](Self::can_transmit_ctpio) and, on backends
    /// without CTPIO, follows up with a normal transmit of the same frame.
    fn transmitv_ctpio(&mut self, _frame_len: usize, _frags: &[&[u8]], _threshold: usize) {}

    /// Send by copying through CTPIO, with cut-through disabled.
    fn transmit_copy(&mut self, _frags: &[&[u8]], _id: u32) -> Result<()> {
        Err(Error::Unsupported("transmit_copy needs CTPIO"))
    }

    fn receive_init(&mut self, addr: u64, id: u32) -> Result<()>;

    fn receive_push(&mut self);

    fn poll(&mut self, max: usize, events: &mut Vec<Event>) -> usize;

    /// True if `poll` would return something. Consumes nothing.
    fn has_event(&self) -> bool;

    fn evq_reinit(&mut self) {}

    fn txq_reinit(&mut self, f: &mut dyn FnMut(u32)) {
        self.txq_mut().reset(f);
    }
}

pub enum Backend {
    AfXdp(AfXdpVi),
    Efct(EfctVi),
    Desc(DescVi),
}

/// Memory and collaborators handed to [`Vi::new`]. The variant must match
/// the configured architecture.
pub enum Resources {
    AfXdp {
        rings: AfXdpRings,
        kick: Box<dyn Kick>,
    },
    Efct {
        /// Transmit completion events. Required when `txq_size > 0`.
        evq: Option<SharedRegion>,
        /// The CTPIO aperture, mapped twice back to back. Required when
        /// `txq_size > 0`.
        ctpio: Option<SharedRegion>,
        refresh: Box<dyn SuperbufRefresh>,
    },
    Desc {
        rings: DescRings,
        doorbell: Box<dyn Doorbell>,
    },
}

impl Resources {
    fn arch(&self) -> Arch {
        match self {
            Resources::AfXdp { .. } => Arch::AfXdp,
            Resources::Efct { .. } => Arch::Efct,
            Resources::Desc { .. } => Arch::DescRing,
        }
    }
}

/// A virtual interface bound to one hardware ring format.
///
/// Not thread safe: each VI is driven by a single thread, which is the only
/// producer of its transmit and receive rings and the only consumer of its
/// events.
pub struct Vi {
    config: Config,
    backend: Backend,
}

impl Vi {
    pub fn new(config: Config, resources: Resources) -> Result<Self> {
        config.validate()?;
        if resources.arch() != config.arch {
            return Err(Error::RingSetup(format!(
                "{} resources for a {} VI",
                resources.arch().name(),
                config.arch.name()
            )));
        }
        let backend = match resources {
            Resources::AfXdp { rings, kick } => Backend::AfXdp(AfXdpVi::new(&config, rings, kick)?),
            Resources::Efct {
                evq,
                ctpio,
                refresh,
            } => Backend::Efct(EfctVi::new(&config, evq, ctpio, refresh)?),
            Resources::Desc { rings, doorbell } => {
                Backend::Desc(DescVi::new(&config, rings, doorbell)?)
            }
        };
        Ok(Vi { config, backend })
    }

    pub fn arch(&self) -> Arch {
        self.config.arch
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut Backend {
        &mut self.backend
    }

    fn ops(&self) -> &dyn ViOps {
        match &self.backend {
            Backend::AfXdp(vi) => vi,
            Backend::Efct(vi) => vi,
            Backend::Desc(vi) => vi,
        }
    }

    fn ops_mut(&mut self) -> &mut dyn ViOps {
        match &mut self.backend {
            Backend::AfXdp(vi) => vi,
            Backend::Efct(vi) => vi,
            Backend::Desc(vi) => vi,
        }
    }

    fn efct_mut(&mut self, op: &'static str) -> Result<&mut EfctVi> {
        match &mut self.backend {
            Backend::Efct(vi) => Ok(vi),
            _ => Err(Error::Unsupported(op)),
        }
    }

    // ── Transmit ────────────────────────────────────────────────────

    pub fn transmit(&mut self, addr: u64, len: u32, id: u32) -> Result<()> {
        self.ops_mut().transmit(addr, len, id)
    }

    pub fn transmitv(&mut self, iov: &[IoVec], id: u32) -> Result<()> {
        self.ops_mut().transmitv(iov, id)
    }

    pub fn transmit_init(&mut self, addr: u64, len: u32, id: u32) -> Result<()> {
        self.ops_mut().transmit_init(addr, len, id)
    }

    pub fn transmitv_init(&mut self, iov: &[IoVec], id: u32) -> Result<()> {
        self.ops_mut().transmitv_init(iov, id)
    }

    pub fn transmit_push(&mut self) {
        self.ops_mut().transmit_push()
    }

    pub fn can_transmit_ctpio(&self, len: usize) -> bool {
        self.ops().can_transmit_ctpio(len)
    }

    /// Cut-through send; see [`ViOps::transmitv_ctpio`].
    pub fn transmitv_ctpio(&mut self, frame_len: usize, frags: &[&[u8]], threshold: usize) {
        self.ops_mut().transmitv_ctpio(frame_len, frags, threshold)
    }

    pub fn transmit_copy(&mut self, frags: &[&[u8]], id: u32) -> Result<()> {
        self.ops_mut().transmit_copy(frags, id)
    }

    /// Retire the transmit requests a TX event covers, appending their ids
    /// to `ids`. Returns how many ring entries were retired.
    pub fn transmit_unbundle(&mut self, event: &TxEvent, ids: &mut Vec<u32>) -> usize {
        let before = ids.len();
        let n = self.ops_mut().txq_mut().complete_to(event.desc_id, ids);
        metrics::TX_COMPLETED.add((ids.len() - before) as u64);
        n
    }

    pub fn transmit_space(&self) -> u32 {
        self.ops().txq().space()
    }

    pub fn transmit_fill_level(&self) -> u32 {
        self.ops().txq().fill_level()
    }

    // ── Receive ─────────────────────────────────────────────────────

    pub fn receive_init(&mut self, addr: u64, id: u32) -> Result<()> {
        self.ops_mut().receive_init(addr, id)
    }

    pub fn receive_push(&mut self) {
        self.ops_mut().receive_push()
    }

    pub fn receive_fill_level(&self) -> u32 {
        self.ops().rxq().fill_level()
    }

    pub fn receive_space(&self) -> u32 {
        self.ops().rxq().space()
    }

    pub fn receive_capacity(&self) -> u32 {
        self.ops().rxq().capacity()
    }

    /// Attach an EFCT receive queue; see [`EfctVi::attach_rxq`].
    pub fn attach_rxq(&mut self, shm: SharedRegion, superbufs: SharedRegion) -> Result<usize> {
        self.efct_mut("attach_rxq")?.attach_rxq(shm, superbufs)
    }

    /// Register EFCT packet buffer memory for [`transmit`](Self::transmit);
    /// see [`EfctVi::register_packet_buffers`].
    pub fn register_packet_buffers(&mut self, region: SharedRegion) -> Result<()> {
        self.efct_mut("register_packet_buffers")?
            .register_packet_buffers(region);
        Ok(())
    }

    /// Release a packet delivered by an EFCT receive event.
    pub fn release_packet(&mut self, pkt_id: u32) -> Result<()> {
        self.efct_mut("release_packet")?.release_packet(pkt_id);
        Ok(())
    }

    /// Frame bytes of an EFCT packet that has not been released yet.
    pub fn rx_packet(&self, pkt_id: u32, len: usize) -> Result<&[u8]> {
        match &self.backend {
            Backend::Efct(vi) => Ok(vi.rx_packet(pkt_id, len)),
            _ => Err(Error::Unsupported("rx_packet")),
        }
    }

    /// Hardware receive timestamp from the cpacket trailer of `frame`, when
    /// the VI is configured for cpacket timestamps.
    pub fn rx_timestamp(&self, frame: &[u8]) -> Option<Timestamp> {
        self.config
            .cpacket_timestamps
            .then(|| protocol_cpacket::rx_timestamp(frame))
    }

    // ── Events ──────────────────────────────────────────────────────

    pub fn poll(&mut self, max: usize, events: &mut Vec<Event>) -> usize {
        self.ops_mut().poll(max, events)
    }

    pub fn has_event(&self) -> bool {
        self.ops().has_event()
    }

    // ── Reinitialisation ────────────────────────────────────────────

    /// Hand every outstanding receive id to `f` and rewind the ring.
    pub fn rxq_reinit(&mut self, mut f: impl FnMut(u32)) {
        self.ops_mut().rxq_mut().reset(&mut f);
    }

    /// Hand every outstanding transmit id to `f` and rewind the ring.
    pub fn txq_reinit(&mut self, mut f: impl FnMut(u32)) {
        self.ops_mut().txq_reinit(&mut f);
    }

    pub fn evq_reinit(&mut self) {
        self.ops_mut().evq_reinit()
    }
}
