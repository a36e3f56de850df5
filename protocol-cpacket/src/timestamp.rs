use std::fmt;

/// A hardware receive timestamp recovered from a cpacket trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Timestamp {
    /// Seconds.
    pub sec: u32,
    /// Nanoseconds within the second.
    pub nsec: u32,
    /// Sub-nanosecond fraction in units of 2^-24 ns. Zero when the trailer
    /// carried no sub-nanosecond tag.
    pub nsec_frac: u32,
}

impl Timestamp {
    /// The timestamp reported for frames without a trailer.
    pub const ZERO: Timestamp = Timestamp {
        sec: 0,
        nsec: 0,
        nsec_frac: 0,
    };

    pub const fn new(sec: u32, nsec: u32, nsec_frac: u32) -> Self {
        Timestamp {
            sec,
            nsec,
            nsec_frac,
        }
    }

    /// Whether nothing was decoded.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Whole nanoseconds since the epoch of the capture clock.
    pub fn as_nanos(&self) -> u64 {
        self.sec as u64 * 1_000_000_000 + self.nsec as u64
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)?;
        if self.nsec_frac != 0 {
            write!(f, "+{:#08x}", self.nsec_frac)?;
        }
        Ok(())
    }
}
