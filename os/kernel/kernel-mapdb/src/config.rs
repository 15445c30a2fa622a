//! # Mapping database geometry
//!
//! Compile-time limits and the runtime [`MapperConfig`] handed to
//! [`Mapper::new`](crate::Mapper::new).

/// Smallest memory page.
pub const PAGE_SIZE: usize = 4096;

/// Deepest derivation chain a tree may hold. Mapping beyond it fails like an
/// allocation failure.
pub const DEPTH_MAX: u8 = 252;

/// Distinct spaces an [`AutoTlbFlush`](crate::AutoTlbFlush) tracks before
/// falling back to flushing everything.
pub const N_SPACES: usize = 4;

/// CPUs addressable in a [`CpuSet`](crate::CpuSet).
pub const MAX_CPUS: usize = 64;

/// Leaf page orders of a memory space, largest first (1 GiB, 2 MiB, 4 KiB).
pub const MEM_PAGE_ORDERS: [u32; 3] = [30, 21, 12];

/// Number of I/O ports is `2^IO_PORT_BITS`.
pub const IO_PORT_BITS: u32 = 16;

/// Leaf orders of an I/O space: the whole port range or a single port.
pub const IO_PAGE_ORDERS: [u32; 2] = [IO_PORT_BITS, 0];

/// Size of the I/O permission bitmap charged on first port insert.
pub const IO_BITMAP_BYTES: usize = 8192;

/// Capability table pointers in the directory page.
pub const SLOTS_PER_DIR: usize = PAGE_SIZE / size_of::<usize>();

/// log2 of the capabilities held by one table page.
pub const CAPS_PER_PAGE_LD2: u32 = 8;

/// Capabilities held by one table page.
pub const CAPS_PER_PAGE: usize = 1 << CAPS_PER_PAGE_LD2;

/// End of the user-visible part of a memory space.
pub const USER_LIMIT: u64 = 0x0000_8000_0000_0000;

const _: () = {
    assert!(SLOTS_PER_DIR.is_power_of_two());
    assert!(CAPS_PER_PAGE * 16 == PAGE_SIZE);
    assert!(DEPTH_MAX < u8::MAX);
    assert!(N_SPACES > 0);
};

/// Invalid [`MapperConfig`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("mapdb page shifts must be non-empty and strictly descending")]
    UnorderedShifts,
    #[error("mapdb levels must end at the smallest page order {expected}, found {found}")]
    SmallestShift { expected: u32, found: u32 },
    #[error("address width {bits} is smaller than the top mapdb level {top}")]
    AddressBits { bits: u32, top: u32 },
    #[error("mapdb level {shift} is not a page order of the backing store")]
    UnknownOrder { shift: u32 },
}

/// Runtime geometry of the mapping databases.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MapperConfig {
    /// Width of physical addresses tracked by the memory mapdb.
    pub phys_bits: u32,
    /// Memory mapdb levels, largest first. Every backing-store page order
    /// must appear.
    pub mem_shifts: &'static [u32],
    /// I/O mapdb levels, largest first.
    pub io_shifts: &'static [u32],
    /// Highest user address plus one.
    pub user_limit: u64,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            phys_bits: 36,
            mem_shifts: &MEM_PAGE_ORDERS,
            io_shifts: &[16, 8, 0],
            user_limit: USER_LIMIT,
        }
    }
}

impl MapperConfig {
    /// Checks both level lists against the page orders of their stores.
    ///
    /// # Errors
    /// See [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::validate_levels(self.mem_shifts, &MEM_PAGE_ORDERS, self.phys_bits)?;
        Self::validate_levels(self.io_shifts, &IO_PAGE_ORDERS, IO_PORT_BITS)
    }

    fn validate_levels(shifts: &[u32], orders: &[u32], bits: u32) -> Result<(), ConfigError> {
        let (Some(&top), Some(&last)) = (shifts.first(), shifts.last()) else {
            return Err(ConfigError::UnorderedShifts);
        };
        if shifts.windows(2).any(|w| w[0] <= w[1]) {
            return Err(ConfigError::UnorderedShifts);
        }

        let smallest = orders.iter().copied().min().unwrap_or(0);
        if last != smallest {
            return Err(ConfigError::SmallestShift {
                expected: smallest,
                found: last,
            });
        }
        if bits < top {
            return Err(ConfigError::AddressBits { bits, top });
        }
        if let Some(&shift) = orders.iter().find(|o| !shifts.contains(o)) {
            return Err(ConfigError::UnknownOrder { shift });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(MapperConfig::default().validate(), Ok(()));
    }

    #[test]
    fn levels_must_cover_page_orders() {
        let cfg = MapperConfig {
            mem_shifts: &[30, 12],
            ..MapperConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::UnknownOrder { shift: 21 }));

        let cfg = MapperConfig {
            io_shifts: &[0, 16],
            ..MapperConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::UnorderedShifts));

        let cfg = MapperConfig {
            phys_bits: 20,
            ..MapperConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::AddressBits { bits: 20, top: 30 })
        );
    }
}
