/// A bit field within a little-endian hardware qword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Field {
    lbn: u32,
    width: u32,
}

impl Field {
    pub(crate) const fn new(lbn: u32, width: u32) -> Self {
        assert!(width > 0 && lbn + width <= 64);
        Field { lbn, width }
    }

    /// Largest value the field can hold.
    pub(crate) const fn max(self) -> u64 {
        if self.width == 64 {
            u64::MAX
        } else {
            (1 << self.width) - 1
        }
    }

    #[inline]
    pub(crate) fn get(self, qword: u64) -> u64 {
        (qword >> self.lbn) & self.max()
    }

    #[inline]
    pub(crate) fn is_set(self, qword: u64) -> bool {
        self.get(qword) != 0
    }

    /// Return `qword` with this field replaced by `value`.
    #[inline]
    pub(crate) fn put(self, qword: u64, value: u64) -> u64 {
        debug_assert!(value <= self.max(), "value {value:#x} overflows field");
        let mask = self.max() << self.lbn;
        (qword & !mask) | ((value << self.lbn) & mask)
    }
}
