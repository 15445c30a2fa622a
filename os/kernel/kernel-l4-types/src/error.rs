/// Result code of a map operation as seen by user space.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum L4Error {
    /// Everything that was backed got mapped.
    #[default]
    None = 0,
    /// Quota or kernel memory ran out on some chunk.
    MapFailed = 1,
    /// The source range was not backed at all.
    EmptyMap = 2,
}

impl L4Error {
    #[inline]
    #[must_use]
    pub const fn ok(self) -> bool {
        matches!(self, Self::None)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u8 {
        self as u8
    }
}

/// A malformed flexpage word.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FpageError {
    #[error("memory flexpage of order {0} is smaller than a page")]
    OrderBelowPage(u8),
    #[error("flexpage address {address:#x} is not aligned to order {order}")]
    Misaligned { address: u64, order: u8 },
}
