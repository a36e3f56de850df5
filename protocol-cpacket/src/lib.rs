//! cpacket hardware timestamp trailer decoding.
//!
//! Capture appliances (Metamako MetaWatch, cPacket probes and compatible
//! switches) append a trailer to every Ethernet frame they forward. The
//! trailer always ends with a fixed 12-byte footer holding the receive
//! timestamp; a chain of variable-length tags may precede it, walked from
//! the back of the frame toward the front.
//!
//! ```text
//! | frame | FCS | tag N ... tag 1 | sec (BE32) | nsec (BE32) | flags | device | port |
//! ```
//!
//! Each tag ends with a one-byte header:
//!
//! ```text
//! bit 7..6  length code (extra 4-byte words)
//! bit 5     final tag (no further tags toward the front)
//! bit 4..0  tag type (0x1f = secondary tag with a 3-byte sub-header)
//! ```
//!
//! Decoding never fails. A frame without a trailer yields a zero timestamp,
//! and a corrupt tag chain stops the walk without disturbing `sec`/`nsec`.
//!
//! # Example
//!
//! ```
//! use protocol_cpacket::{Timestamp, decode_trailer};
//!
//! let trailer = [
//!     0x12, 0x34, 0x56, 0x78, // sec
//!     0xfe, 0xdc, 0xba, 0x98, // nsec
//!     0x00, 0x00, 0x00, 0x00, // flags, device, port
//! ];
//! assert_eq!(decode_trailer(&trailer), Timestamp::new(0x1234_5678, 0xfedc_ba98, 0));
//! ```

mod tag;
mod timestamp;
mod trailer;

pub use tag::{MAX_TAGS, TAG_SECONDARY, TAG_SUBNANO, Tag, Tags};
pub use timestamp::Timestamp;
pub use trailer::{FOOTER_LEN, Footer, decode_trailer, payload_end, rx_timestamp};
