use bitflags::bitflags;

bitflags! {
    /// Access rights carried by a flexpage.
    ///
    /// Memory and I/O pages use `R`, `W` and `X`. Capabilities reuse the same
    /// bits under their own names and add `CD`, the right to delete the
    /// object.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct Rights: u8 {
        const X = 0b0001;
        const W = 0b0010;
        const R = 0b0100;
        const CD = 0b1000;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();

        /// Capability: invoke the object.
        const CS = Self::X.bits();
        /// Capability: write access to the object.
        const CW = Self::W.bits();
        /// Capability: holding the capability at all.
        const CR = Self::R.bits();
        const CWS = Self::CW.bits() | Self::CS.bits();
        const FULL = 0b1111;
    }
}

impl Rights {
    /// Whether stripping `self` amounts to removing the mapping altogether.
    ///
    /// Without read access nothing of the mapping survives, so `R` marks a
    /// full flush.
    #[inline]
    #[must_use]
    pub const fn is_full_flush(self) -> bool {
        self.contains(Self::R)
    }
}

bitflags! {
    /// Usage state observed on a page, reported by unmap.
    ///
    /// The bit positions line up with [`Rights`]: a page that was written to
    /// reports the bit of the right that allowed it.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u8 {
        const EXECUTED = 0b0001;
        const DIRTY = 0b0010;
        const REFERENCED = 0b0100;
    }
}

impl From<AccessFlags> for Rights {
    fn from(flags: AccessFlags) -> Self {
        Self::from_bits_truncate(flags.bits())
    }
}
