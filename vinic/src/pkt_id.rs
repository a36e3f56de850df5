/// Identifies one EFCT packet slot.
///
/// Layout (32-bit):
/// ```text
/// Bit  31:     cached sentinel phase of the superbuf
/// Bits 30..28: unused
/// Bits 27..25: receive queue index (max 8)
/// Bits 24..16: superbuf index within the queue (max 512)
/// Bits 15..0:  packet index within the superbuf
/// ```
///
/// The layout is internal and may change between releases. Packet ids handed
/// to callers in events never carry the sentinel bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId(u32);

impl PacketId {
    const INDEX_BITS: u32 = 16;
    const SUPERBUF_SHIFT: u32 = 16;
    const SUPERBUF_BITS: u32 = 9;
    const RXQ_SHIFT: u32 = 25;
    const RXQ_BITS: u32 = 3;
    const SENTINEL_SHIFT: u32 = 31;

    const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;
    const SUPERBUF_MASK: u32 = (1 << Self::SUPERBUF_BITS) - 1;
    const RXQ_MASK: u32 = (1 << Self::RXQ_BITS) - 1;
    const SENTINEL: u32 = 1 << Self::SENTINEL_SHIFT;

    /// Superbufs addressable per receive queue.
    pub const MAX_SUPERBUFS: usize = 1 << Self::SUPERBUF_BITS;
    /// Receive queues addressable per virtual interface.
    pub const MAX_RXQS: usize = 1 << Self::RXQ_BITS;
    /// Packets addressable per superbuf.
    pub const MAX_PACKETS: usize = 1 << Self::INDEX_BITS;

    #[inline]
    pub fn new(rxq: usize, superbuf: usize, index: u32) -> Self {
        debug_assert!(rxq < Self::MAX_RXQS, "rxq {rxq} out of range");
        debug_assert!(superbuf < Self::MAX_SUPERBUFS, "superbuf {superbuf} out of range");
        debug_assert!(index <= Self::INDEX_MASK, "packet index {index} out of range");
        PacketId(
            ((rxq as u32 & Self::RXQ_MASK) << Self::RXQ_SHIFT)
                | ((superbuf as u32 & Self::SUPERBUF_MASK) << Self::SUPERBUF_SHIFT)
                | (index & Self::INDEX_MASK),
        )
    }

    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        PacketId(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0 & Self::INDEX_MASK
    }

    #[inline]
    pub fn superbuf(self) -> usize {
        ((self.0 >> Self::SUPERBUF_SHIFT) & Self::SUPERBUF_MASK) as usize
    }

    #[inline]
    pub fn rxq(self) -> usize {
        ((self.0 >> Self::RXQ_SHIFT) & Self::RXQ_MASK) as usize
    }

    #[inline]
    pub fn sentinel(self) -> bool {
        self.0 & Self::SENTINEL != 0
    }

    #[inline]
    pub fn with_sentinel(self, sentinel: bool) -> Self {
        PacketId((self.0 & !Self::SENTINEL) | ((sentinel as u32) << Self::SENTINEL_SHIFT))
    }

    /// The id with the cached sentinel cleared.
    #[inline]
    pub fn without_sentinel(self) -> Self {
        PacketId(self.0 & !Self::SENTINEL)
    }

    /// The following slot in the same superbuf. Callers check the index
    /// against the superbuf's packet budget before using it.
    #[inline]
    pub fn next(self) -> Self {
        debug_assert!(self.index() < Self::INDEX_MASK);
        PacketId(self.0 + 1)
    }
}
