/// Tag type carrying a 24-bit sub-nanosecond timestamp fraction.
pub const TAG_SUBNANO: u8 = 0x01;
/// Tag type announcing a secondary tag with a 16-bit type and a word count.
pub const TAG_SECONDARY: u8 = 0x1f;

/// Upper bound on the number of tags walked in one trailer. Real trailers
/// carry a handful; the bound keeps a corrupt chain from scanning the whole
/// frame byte by byte.
pub const MAX_TAGS: usize = 64;

const TYPE_MASK: u8 = 0x1f;
const FINAL_FLAG: u8 = 0x20;
const LEN_CODE_SHIFT: u32 = 6;

/// Primary tags carry 3 bytes plus `4 * code` more.
const PRIMARY_MIN_LEN: usize = 3;
const SECONDARY_SUBHEADER_LEN: usize = 3;

/// One tag entry of a cpacket trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag<'a> {
    /// A primary tag: 5-bit type, 3 + 4*n payload bytes.
    Primary { kind: u8, payload: &'a [u8] },
    /// A secondary tag: 16-bit type, payload a whole number of 4-byte words.
    Secondary { kind: u16, payload: &'a [u8] },
}

impl<'a> Tag<'a> {
    /// The sub-nanosecond fraction, if this is a well-formed subnano tag.
    pub fn subnano(&self) -> Option<u32> {
        match *self {
            Tag::Primary {
                kind: TAG_SUBNANO,
                payload: &[a, b, c],
            } => Some(u32::from_be_bytes([0, a, b, c])),
            _ => None,
        }
    }

    pub fn payload(&self) -> &'a [u8] {
        match *self {
            Tag::Primary { payload, .. } | Tag::Secondary { payload, .. } => payload,
        }
    }
}

/// Iterator over the tags preceding a cpacket footer, nearest to the footer
/// first.
///
/// Constructed over the bytes in front of the footer. Iteration ends at a tag
/// flagged as final, after [`MAX_TAGS`] tags, or as soon as a header claims
/// more bytes than remain. A truncated chain simply ends; it never panics.
pub struct Tags<'a> {
    buf: &'a [u8],
    /// Exclusive end of the unwalked region.
    end: usize,
    remaining: usize,
    done: bool,
}

impl<'a> Tags<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Tags {
            buf,
            end: buf.len(),
            remaining: MAX_TAGS,
            done: false,
        }
    }

    /// Number of bytes in front of the tags walked so far.
    pub fn remaining_bytes(&self) -> usize {
        self.end
    }

    fn stop(&mut self) -> Option<Tag<'a>> {
        self.done = true;
        None
    }
}

impl<'a> Iterator for Tags<'a> {
    type Item = Tag<'a>;

    fn next(&mut self) -> Option<Tag<'a>> {
        if self.done || self.remaining == 0 || self.end == 0 {
            return self.stop();
        }
        self.remaining -= 1;

        let header = self.buf[self.end - 1];
        let kind = header & TYPE_MASK;
        let code = (header >> LEN_CODE_SHIFT) as usize;
        let mut pos = self.end - 1;

        let tag = if kind == TAG_SECONDARY {
            if pos < SECONDARY_SUBHEADER_LEN {
                return self.stop();
            }
            let sub = &self.buf[pos - SECONDARY_SUBHEADER_LEN..pos];
            pos -= SECONDARY_SUBHEADER_LEN;
            // 10-bit word count: 8 bits in the sub-header, 2 in the header.
            let words = ((sub[2] as usize) << 2) | code;
            let len = (words + 1) * 4;
            if pos < len {
                return self.stop();
            }
            let payload = &self.buf[pos - len..pos];
            pos -= len;
            Tag::Secondary {
                kind: u16::from_be_bytes([sub[0], sub[1]]),
                payload,
            }
        } else {
            let len = PRIMARY_MIN_LEN + 4 * code;
            if pos < len {
                return self.stop();
            }
            let payload = &self.buf[pos - len..pos];
            pos -= len;
            Tag::Primary { kind, payload }
        };

        self.end = pos;
        if header & FINAL_FLAG != 0 {
            self.done = true;
        }
        Some(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_final_primary() {
        let buf = [0xaa, 0x01, 0x02, 0x03, 0x20 | 7];
        let tags: Vec<_> = Tags::new(&buf).collect();
        assert_eq!(
            tags,
            vec![Tag::Primary {
                kind: 7,
                payload: &[0x01, 0x02, 0x03]
            }]
        );
    }

    #[test]
    fn primary_extended_length() {
        // Length code 2: 3 + 8 payload bytes.
        let mut buf: Vec<u8> = (0..11).collect();
        buf.push(0x20 | (2 << 6) | 8);
        let tag = Tags::new(&buf).next().unwrap();
        assert_eq!(tag.payload().len(), 11);
        assert_eq!(tag.subnano(), None);
    }

    #[test]
    fn secondary_word_count() {
        // 20 payload bytes = 5 words, stored as 4: sub-header 0x01, code 0.
        let mut buf = vec![0x5a; 20];
        buf.extend_from_slice(&[0x00, 0x2a, 0x01]);
        buf.push(0x20 | TAG_SECONDARY);
        let tag = Tags::new(&buf).next().unwrap();
        match tag {
            Tag::Secondary { kind, payload } => {
                assert_eq!(kind, 42);
                assert_eq!(payload.len(), 20);
            }
            other => panic!("unexpected tag {other:?}"),
        }
    }

    #[test]
    fn chain_walks_nearest_first() {
        // Front: subnano (final). Back: type 9.
        let buf = [0x56, 0x47, 0x38, 0x20 | TAG_SUBNANO, 0x00, 0x00, 0x2a, 9];
        let tags: Vec<_> = Tags::new(&buf).collect();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].subnano(), None);
        assert_eq!(tags[1].subnano(), Some(0x564738));
    }

    #[test]
    fn truncated_length_stops() {
        // Header claims 11 payload bytes but only 3 precede it.
        let buf = [0x01, 0x02, 0x03, (2 << 6) | 4];
        let mut tags = Tags::new(&buf);
        assert_eq!(tags.next(), None);
        assert_eq!(tags.next(), None);
    }

    #[test]
    fn truncated_secondary_subheader() {
        let buf = [0x00, TAG_SECONDARY];
        assert_eq!(Tags::new(&buf).count(), 0);
    }

    #[test]
    fn empty_buffer() {
        assert_eq!(Tags::new(&[]).count(), 0);
    }

    #[test]
    fn tag_count_is_bounded() {
        // An endless chain of non-final zero tags (4 bytes each).
        let buf = vec![0u8; 4 * (MAX_TAGS + 10)];
        assert_eq!(Tags::new(&buf).count(), MAX_TAGS);
    }

    #[test]
    fn malformed_subnano_is_ignored() {
        // Subnano type with length code 1 is not a valid fraction.
        let mut buf = vec![0u8; 7];
        buf.push(0x20 | (1 << 6) | TAG_SUBNANO);
        let tag = Tags::new(&buf).next().unwrap();
        assert_eq!(tag.subnano(), None);
    }
}
