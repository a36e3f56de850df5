use crate::tag::Tags;
use crate::timestamp::Timestamp;

/// Size of the fixed footer that ends every cpacket trailer.
pub const FOOTER_LEN: usize = 12;

/// Footer flag: tags precede the footer.
const FLAG_TAGS: u8 = 0x02;

const ETH_HLEN: usize = 14;
const ETHERTYPE_OFF: usize = 12;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;
const VLAN_TAG_LEN: usize = 4;
const IPV6_HLEN: usize = 40;

/// The fixed 12-byte footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub sec: u32,
    pub nsec: u32,
    pub flags: u8,
    pub device: u16,
    pub port: u8,
}

impl Footer {
    /// Parse the footer from the last [`FOOTER_LEN`] bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Option<Footer> {
        let start = buf.len().checked_sub(FOOTER_LEN)?;
        let f = &buf[start..];
        Some(Footer {
            sec: u32::from_be_bytes([f[0], f[1], f[2], f[3]]),
            nsec: u32::from_be_bytes([f[4], f[5], f[6], f[7]]),
            flags: f[8],
            device: u16::from_be_bytes([f[9], f[10]]),
            port: f[11],
        })
    }

    pub fn has_tags(&self) -> bool {
        self.flags & FLAG_TAGS != 0
    }
}

/// Decode the timestamp from a buffer ending in a cpacket trailer.
///
/// Tags are walked no further forward than the start of `trailer`; pass the
/// bytes after the L3 payload to keep the walk off packet data. Buffers
/// shorter than the footer decode to [`Timestamp::ZERO`].
pub fn decode_trailer(trailer: &[u8]) -> Timestamp {
    let Some(footer) = Footer::parse(trailer) else {
        return Timestamp::ZERO;
    };
    let mut ts = Timestamp::new(footer.sec, footer.nsec, 0);
    if footer.has_tags() {
        let tags = &trailer[..trailer.len() - FOOTER_LEN];
        if let Some(frac) = Tags::new(tags).find_map(|tag| tag.subnano()) {
            ts.nsec_frac = frac;
        }
    }
    ts
}

/// Offset of the first byte after the L3 payload of an Ethernet frame.
///
/// Steps over 802.1Q and 802.1ad tags. Returns `None` for non-IP frames or
/// when the headers are truncated.
pub fn payload_end(frame: &[u8]) -> Option<usize> {
    let be16 = |off: usize| -> Option<u16> {
        let b = frame.get(off..off + 2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    };

    let mut off = ETHERTYPE_OFF;
    let mut ethertype = be16(off)?;
    while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
        off += VLAN_TAG_LEN;
        ethertype = be16(off)?;
    }
    let l3 = off + (ETH_HLEN - ETHERTYPE_OFF);

    match ethertype {
        ETHERTYPE_IPV4 => Some(l3 + be16(l3 + 2)? as usize),
        ETHERTYPE_IPV6 => Some(l3 + IPV6_HLEN + be16(l3 + 4)? as usize),
        _ => None,
    }
}

/// Decode the cpacket timestamp of a received Ethernet frame.
///
/// For IP frames the trailer is taken to start where the L3 payload ends, so
/// a frame with nothing after its payload yields [`Timestamp::ZERO`]. Other
/// frames are decoded from their final bytes.
pub fn rx_timestamp(frame: &[u8]) -> Timestamp {
    let start = payload_end(frame).unwrap_or(0);
    match frame.get(start..) {
        Some(trailer) => decode_trailer(trailer),
        None => Timestamp::ZERO,
    }
}
