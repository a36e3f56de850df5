//! vinic: kernel-bypass virtual interface rings.
//!
//! A [`Vi`] posts packets to and retrieves packets from NIC queues without a
//! system call per packet. Three ring formats sit behind one API:
//!
//! - **AF_XDP**: fill, completion, RX and TX rings shared with the Linux
//!   kernel.
//! - **EFCT**: receive through kernel-managed superbufs read in place,
//!   transmit by streaming frames into the CTPIO aperture.
//! - **Descriptor rings**: `{addr, len, flags}` descriptors with a doorbell
//!   and a phase-bit event queue.
//!
//! Every backend reports work through the same [`Event`]s, and every ring
//! uses the same free-running `added`/`removed` bookkeeping ([`RingState`]).
//!
//! # Example
//!
//! ```rust
//! use vinic::{AfXdpRings, Arch, ConfigBuilder, Event, Resources, Vi};
//!
//! let config = ConfigBuilder::new()
//!     .arch(Arch::AfXdp)
//!     .rxq_size(64)
//!     .txq_size(64)
//!     .build()?;
//! let rings = AfXdpRings::anonymous(&config)?;
//! let kick = Box::new(|| -> std::io::Result<()> { Ok(()) });
//! let mut vi = Vi::new(config, Resources::AfXdp { rings, kick })?;
//!
//! for id in 0..64 {
//!     vi.receive_init(id as u64 * 2048, id)?;
//! }
//! vi.receive_push();
//!
//! let mut events = Vec::new();
//! vi.poll(32, &mut events);
//! for event in &events {
//!     if let Event::Rx(rx) = event {
//!         println!("{} bytes in buffer {}", rx.len, rx.rq_id);
//!     }
//! }
//! # Ok::<(), vinic::Error>(())
//! ```
//!
//! # Platform
//!
//! Linux only. Shared memory is mapped with `mmap`, and AF_XDP kicks use
//! `sendto` on the XDP socket.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod bits;
pub(crate) mod counter;
pub(crate) mod evq;
pub(crate) mod metrics;
pub(crate) mod pkt_id;

// ── Public modules ──────────────────────────────────────────────────────
pub mod af_xdp;
pub mod arch;
pub mod config;
pub mod desc;
pub mod efct;
pub mod error;
pub mod event;
pub mod region;
pub mod ring;
pub mod vi;

// ── Re-exports: Configuration ───────────────────────────────────────────

pub use arch::{Arch, ViFlags};
pub use config::{Config, ConfigBuilder, EfctConfig};
pub use error::{Error, Result};

// ── Re-exports: Virtual interface ───────────────────────────────────────

pub use vi::{Backend, IoVec, Resources, Vi, ViOps};

/// Packet id layout used by EFCT receive events.
pub use pkt_id::PacketId;

// ── Re-exports: Events ──────────────────────────────────────────────────

pub use event::{Event, EventFlags, RxEvent, TxEvent};

// ── Re-exports: Rings and shared memory ─────────────────────────────────

pub use region::{SharedCounter, SharedRegion};
pub use ring::{FREE_ID, RingState};

// ── Re-exports: Backends ────────────────────────────────────────────────

pub use af_xdp::{AfXdpRings, AfXdpVi, Kick, SocketKick, XdpRing, XdpRingKind, XdpRingOffsets};
pub use desc::{DescRings, DescVi, Doorbell, DoorbellQueue};
pub use efct::{EfctVi, PollMode, RXQ_SHM_BYTES, SuperbufRefresh};

// ── Re-exports: Timestamps ──────────────────────────────────────────────

/// Receive timestamp decoded from a cpacket trailer.
pub use protocol_cpacket::Timestamp;
