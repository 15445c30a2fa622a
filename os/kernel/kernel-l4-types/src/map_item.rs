use crate::PAGE_SHIFT;
use bitfield_struct::bitfield;
use bitflags::bitflags;

/// Control word of a map item.
///
/// | Bits | Field |
/// |------|-------|
/// | 0 | grant instead of map |
/// | 1..3 | reserved |
/// | 4..7 | attribute field (cache mode for memory, extra rights for capabilities) |
/// | 8..11 | reserved |
/// | 12..63 | hot spot, in flexpage address units |
///
/// The hot spot picks the part of a large receive window that a smaller send
/// flexpage lands in (or the part of a large send flexpage that fits a small
/// receive window).
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct MapItem {
    pub grant: bool,
    #[bits(3)]
    __: u8,
    #[bits(4)]
    pub attr: u8,
    #[bits(4)]
    __: u8,
    #[bits(52)]
    hot_spot_bits: u64,
}

impl MapItem {
    /// Plain map item without hot spot.
    #[must_use]
    pub const fn map() -> Self {
        Self::new()
    }

    /// Grant item: the sender loses the transferred pages.
    #[must_use]
    pub const fn granting() -> Self {
        Self::new().with_grant(true)
    }

    /// Sets the hot spot from a store address (bytes for memory).
    #[must_use]
    pub const fn with_hot_spot(self, address: u64, memory: bool) -> Self {
        let bits = if memory {
            address >> PAGE_SHIFT
        } else {
            address
        };
        self.with_hot_spot_bits(bits)
    }

    /// Hot spot as a byte address, for memory maps.
    #[inline]
    #[must_use]
    pub const fn hot_spot_bytes(self) -> u64 {
        self.hot_spot_bits() << PAGE_SHIFT
    }

    /// Hot spot as a port or capability index.
    #[inline]
    #[must_use]
    pub const fn hot_spot_index(self) -> u64 {
        self.hot_spot_bits()
    }
}

bitflags! {
    /// Options of an unmap request.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct MapMask: u64 {
        /// Also remove the caller's own mapping, not only the derived ones.
        const SELF_UNMAP = 1 << 31;
        /// Delete the object if the caller's capability allows it.
        const DO_DELETE = 1 << 30;
    }
}

impl MapMask {
    #[inline]
    #[must_use]
    pub const fn self_unmap(self) -> bool {
        self.contains(Self::SELF_UNMAP)
    }

    #[inline]
    #[must_use]
    pub const fn do_delete(self) -> bool {
        self.contains(Self::DO_DELETE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_and_attr_bits() {
        let item = MapItem::granting().with_attr(0x3);
        assert_eq!(item.into_bits(), 0x31);
        assert!(item.grant());
        assert!(!MapItem::map().grant());
    }

    #[test]
    fn hot_spot_units() {
        let mem = MapItem::map().with_hot_spot(0x40_3000, true);
        assert_eq!(mem.hot_spot_bytes(), 0x40_3000);

        let io = MapItem::map().with_hot_spot(0x64, false);
        assert_eq!(io.hot_spot_index(), 0x64);
    }
}
