//! Byte-stream writer for the CTPIO aperture.
//!
//! The aperture only accepts whole aligned 64-bit stores. A packet is a
//! header word followed by the frame bytes, padded with zero words to the
//! next 64-byte boundary. Fragments of arbitrary length are packed through
//! an 8-byte accumulator so every store is a full word.
//!
//! The aperture is mapped twice back to back, so a packet that starts near
//! the end of the first mapping runs on contiguously into the second.

use crate::bits::Field;
use crate::config::{CTPIO_ALIGNMENT, CTPIO_HEADER_BYTES};
use crate::region::SharedRegion;

pub(crate) const TX_HEADER_PACKET_LENGTH: Field = Field::new(0, 14);
pub(crate) const TX_HEADER_CT_THRESH: Field = Field::new(14, 8);
pub(crate) const TX_HEADER_TIMESTAMP_FLAG: Field = Field::new(22, 1);
pub(crate) const TX_HEADER_WARM_FLAG: Field = Field::new(23, 1);
pub(crate) const TX_HEADER_ACTION: Field = Field::new(24, 3);

/// Threshold value that makes the NIC buffer the whole packet before
/// sending.
pub(crate) const CT_DISABLE: u64 = TX_HEADER_CT_THRESH.max();

/// Largest frame the length field can describe.
pub(crate) const MAX_FRAME_LEN: usize = TX_HEADER_PACKET_LENGTH.max() as usize;

/// Header word for a plain (non-templated) send.
pub(crate) fn tx_header(len: usize, ct_thresh: u64, timestamp: bool) -> u64 {
    let mut qword = TX_HEADER_PACKET_LENGTH.put(0, len as u64);
    qword = TX_HEADER_CT_THRESH.put(qword, ct_thresh);
    qword = TX_HEADER_TIMESTAMP_FLAG.put(qword, timestamp as u64);
    qword = TX_HEADER_WARM_FLAG.put(qword, 0);
    TX_HEADER_ACTION.put(qword, 0)
}

/// Convert a cut-through threshold in bytes to the header's 64-byte units.
/// Anything past the field width disables cut-through.
pub(crate) fn ct_threshold(bytes: usize) -> u64 {
    ((bytes >> 6) as u64).min(CT_DISABLE)
}

/// Aperture bytes a frame of `len` bytes occupies.
pub(crate) fn span_for(len: usize) -> usize {
    (CTPIO_HEADER_BYTES + len).next_multiple_of(CTPIO_ALIGNMENT)
}

pub(crate) struct CtpioWriter<'a> {
    aperture: &'a SharedRegion,
    pos: usize,
    tail: [u8; 8],
    tail_len: usize,
}

impl<'a> CtpioWriter<'a> {
    pub(crate) fn new(aperture: &'a SharedRegion, start: usize) -> Self {
        assert!(
            start % CTPIO_ALIGNMENT == 0,
            "CTPIO write starts unaligned at {start}"
        );
        CtpioWriter {
            aperture,
            pos: start,
            tail: [0; 8],
            tail_len: 0,
        }
    }

    #[inline]
    pub(crate) fn word(&mut self, value: u64) {
        self.aperture.write_u64(self.pos, value);
        self.pos += 8;
    }

    #[inline]
    fn word_bytes(&mut self, bytes: [u8; 8]) {
        // Stored little-endian, so the bytes land in the aperture in order.
        self.word(u64::from_le_bytes(bytes));
    }

    pub(crate) fn block(&mut self, mut data: &[u8]) {
        if self.tail_len != 0 {
            let take = data.len().min(8 - self.tail_len);
            self.tail[self.tail_len..self.tail_len + take].copy_from_slice(&data[..take]);
            self.tail_len += take;
            data = &data[take..];
            if self.tail_len < 8 {
                return;
            }
            let tail = std::mem::take(&mut self.tail);
            self.tail_len = 0;
            self.word_bytes(tail);
        }

        let mut chunks = data.chunks_exact(8);
        for chunk in &mut chunks {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            self.word_bytes(bytes);
        }
        let rest = chunks.remainder();
        self.tail[..rest.len()].copy_from_slice(rest);
        self.tail_len = rest.len();
    }

    /// Flush leftover bytes and pad to the next 64-byte boundary. Returns the
    /// position just past the packet.
    pub(crate) fn finish(mut self) -> usize {
        if self.tail_len != 0 {
            let tail = self.tail;
            self.word_bytes(tail);
        }
        while self.pos % CTPIO_ALIGNMENT != 0 {
            self.word(0);
        }
        self.pos
    }
}
