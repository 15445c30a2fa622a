//! # Address spaces
//!
//! A [`Space`] bundles the three backing stores of a task with the quota
//! they are charged to. Spaces are shared through `Arc`; mappings refer to
//! them weakly.

use crate::config::{MAX_CPUS, MapperConfig};
use crate::io_space::IoSpace;
use crate::mem_space::MemSpace;
use crate::obj_space::ObjSpacePhys;
use crate::quota::RamQuota;
use crate::tlb::CpuSet;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::HelpingLock;
use log::debug;

bitflags! {
    /// Backing stores a space accepts mappings into.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Caps: u8 {
        const MEM = 0x1;
        const IO = 0x2;
        const OBJ = 0x4;
        const ALL = Self::MEM.bits() | Self::IO.bits() | Self::OBJ.bits();
    }
}

pub struct Space {
    id: u64,
    quota: Arc<RamQuota>,
    caps: Caps,
    sigma0: bool,
    /// `true` while the space may be mapped into.
    existence: HelpingLock<bool>,
    active_cpus: AtomicU64,
    mem: MemSpace,
    io: IoSpace,
    obj: ObjSpacePhys,
}

impl Space {
    /// A task space accepting every kind of mapping.
    #[must_use]
    pub fn new(id: u64, quota: Arc<RamQuota>, config: &MapperConfig) -> Arc<Self> {
        Self::with_caps(id, quota, config, Caps::ALL)
    }

    #[must_use]
    pub fn with_caps(id: u64, quota: Arc<RamQuota>, config: &MapperConfig, caps: Caps) -> Arc<Self> {
        Arc::new(Self {
            id,
            caps,
            sigma0: false,
            existence: HelpingLock::new(true),
            active_cpus: AtomicU64::new(0),
            mem: MemSpace::new(quota.clone(), config.user_limit),
            io: IoSpace::new(quota.clone()),
            obj: ObjSpacePhys::new(quota.clone()),
            quota,
        })
    }

    /// The root space. It owns all physical memory below
    /// `2^config.phys_bits` and every I/O port without holding page-table
    /// entries for them.
    #[must_use]
    pub fn new_sigma0(id: u64, quota: Arc<RamQuota>, config: &MapperConfig) -> Arc<Self> {
        Arc::new(Self {
            id,
            caps: Caps::ALL,
            sigma0: true,
            existence: HelpingLock::new(true),
            active_cpus: AtomicU64::new(0),
            mem: MemSpace::sigma0(quota.clone(), config.user_limit, config.phys_bits),
            io: IoSpace::sigma0(quota.clone()),
            obj: ObjSpacePhys::new(quota.clone()),
            quota,
        })
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn ram_quota(&self) -> &RamQuota {
        &self.quota
    }

    #[inline]
    pub(crate) const fn quota_handle(&self) -> &Arc<RamQuota> {
        &self.quota
    }

    #[inline]
    #[must_use]
    pub const fn caps(&self) -> Caps {
        self.caps
    }

    #[inline]
    #[must_use]
    pub const fn is_sigma0(&self) -> bool {
        self.sigma0
    }

    #[inline]
    #[must_use]
    pub const fn mem(&self) -> &MemSpace {
        &self.mem
    }

    #[inline]
    #[must_use]
    pub const fn io(&self) -> &IoSpace {
        &self.io
    }

    #[inline]
    #[must_use]
    pub const fn obj(&self) -> &ObjSpacePhys {
        &self.obj
    }

    pub(crate) const fn existence(&self) -> &HelpingLock<bool> {
        &self.existence
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        *self.existence.lock()
    }

    /// Marks the space as going away. Later map calls into it fail.
    /// Returns `false` if it was already dead.
    pub fn kill(&self) -> bool {
        let mut alive = self.existence.lock();
        let was = core::mem::replace(&mut *alive, false);
        if was {
            debug!("{self}: marked dead");
        }
        was
    }

    /// CPUs the space is currently loaded on.
    #[must_use]
    pub fn active_cpus(&self) -> CpuSet {
        CpuSet::from_bits(self.active_cpus.load(Ordering::Acquire))
    }

    /// Called by the context switch when `cpu` starts running the space.
    ///
    /// # Panics
    /// If `cpu` is out of range.
    pub fn mark_active(&self, cpu: usize) {
        assert!(cpu < MAX_CPUS, "cpu {cpu} out of range");
        self.active_cpus.fetch_or(1 << cpu, Ordering::AcqRel);
    }

    /// Called when `cpu` switches away from the space.
    ///
    /// # Panics
    /// If `cpu` is out of range.
    pub fn mark_inactive(&self, cpu: usize) {
        assert!(cpu < MAX_CPUS, "cpu {cpu} out of range");
        self.active_cpus.fetch_and(!(1 << cpu), Ordering::AcqRel);
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "space#{}", self.id)
    }
}

impl fmt::Debug for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Space")
            .field("id", &self.id)
            .field("caps", &self.caps)
            .field("sigma0", &self.sigma0)
            .finish_non_exhaustive()
    }
}
