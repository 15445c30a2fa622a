use crate::{FpageError, PAGE_SHIFT, Rights};
use bitfield_struct::bitfield;

/// Backing store addressed by a flexpage.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FpageKind {
    /// Nil or "all spaces" page, depending on the order.
    Special = 0,
    Memory = 1,
    Io = 2,
    Obj = 3,
}

impl FpageKind {
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            1 => Self::Memory,
            2 => Self::Io,
            3 => Self::Obj,
            _ => Self::Special,
        }
    }

    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// A flexpage: a `2^order` sized, naturally aligned region with rights.
///
/// See the [crate documentation](crate) for the bit layout. Orders are
/// counted in the unit of the backing store, so a 4 KiB memory page has order
/// 12 and a single I/O port has order 0.
#[bitfield(u64)]
#[derive(PartialEq, Eq, Hash)]
pub struct Fpage {
    /// Rights (bits 0..3).
    #[bits(4)]
    rights_bits: u8,
    /// Type tag (bits 4..5).
    #[bits(2)]
    pub kind: FpageKind,
    /// log2 of the region size (bits 6..11).
    #[bits(6)]
    pub order: u8,
    /// Page number (memory) or index (I/O, objects), bits 12..63.
    #[bits(52)]
    address_bits: u64,
}

impl Fpage {
    /// Order of the "all spaces" flexpage.
    pub const WHOLE_SPACE: u8 = 63;

    /// Memory flexpage covering `2^order` bytes at byte address `address`.
    #[must_use]
    pub const fn mem(address: u64, order: u8, rights: Rights) -> Self {
        Self::new()
            .with_rights_bits(rights.bits())
            .with_kind(FpageKind::Memory)
            .with_order(order)
            .with_address_bits(address >> PAGE_SHIFT)
    }

    /// I/O flexpage covering `2^order` ports starting at `port`.
    #[must_use]
    pub const fn io(port: u64, order: u8, rights: Rights) -> Self {
        Self::new()
            .with_rights_bits(rights.bits())
            .with_kind(FpageKind::Io)
            .with_order(order)
            .with_address_bits(port)
    }

    /// Capability flexpage covering `2^order` slots starting at `index`.
    #[must_use]
    pub const fn obj(index: u64, order: u8, rights: Rights) -> Self {
        Self::new()
            .with_rights_bits(rights.bits())
            .with_kind(FpageKind::Obj)
            .with_order(order)
            .with_address_bits(index)
    }

    /// Flexpage addressing every backing store completely.
    #[must_use]
    pub const fn all_spaces(rights: Rights) -> Self {
        Self::new()
            .with_rights_bits(rights.bits())
            .with_kind(FpageKind::Special)
            .with_order(Self::WHOLE_SPACE)
    }

    /// The empty flexpage; matches nothing.
    #[must_use]
    pub const fn nil() -> Self {
        Self::new()
    }

    /// Decodes a flexpage word handed in from user space.
    ///
    /// # Errors
    /// Memory flexpages below page size and bases not aligned to the order
    /// are rejected.
    pub const fn from_raw(raw: u64) -> Result<Self, FpageError> {
        let fp = Self::from_bits(raw);
        if fp.is_mempage() && fp.order() < PAGE_SHIFT {
            return Err(FpageError::OrderBelowPage(fp.order()));
        }
        if !fp.is_all_spaces() {
            let mask = (1_u64 << fp.order()) - 1;
            if fp.base() & mask != 0 {
                return Err(FpageError::Misaligned {
                    address: fp.base(),
                    order: fp.order(),
                });
            }
        }
        Ok(fp)
    }

    #[inline]
    #[must_use]
    pub const fn rights(self) -> Rights {
        Rights::from_bits_truncate(self.rights_bits())
    }

    #[inline]
    #[must_use]
    pub const fn with_rights(self, rights: Rights) -> Self {
        self.with_rights_bits(rights.bits())
    }

    /// Start of the region in store units (bytes, ports or slots).
    #[inline]
    #[must_use]
    pub const fn base(self) -> u64 {
        match self.kind() {
            FpageKind::Memory => self.address_bits() << PAGE_SHIFT,
            _ => self.address_bits(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_mempage(self) -> bool {
        matches!(self.kind(), FpageKind::Memory)
    }

    #[inline]
    #[must_use]
    pub const fn is_iopage(self) -> bool {
        matches!(self.kind(), FpageKind::Io)
    }

    #[inline]
    #[must_use]
    pub const fn is_objpage(self) -> bool {
        matches!(self.kind(), FpageKind::Obj)
    }

    #[inline]
    #[must_use]
    pub const fn is_all_spaces(self) -> bool {
        matches!(self.kind(), FpageKind::Special) && self.order() == Self::WHOLE_SPACE
    }

    #[inline]
    #[must_use]
    pub const fn is_nil(self) -> bool {
        matches!(self.kind(), FpageKind::Special) && self.order() != Self::WHOLE_SPACE
    }
}
