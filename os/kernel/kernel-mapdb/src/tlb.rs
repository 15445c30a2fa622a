//! # TLB shootdown batching
//!
//! Map and unmap edit page tables of up to two spaces per chunk and touch an
//! unbounded number of descendant spaces during a revocation. Instead of
//! flushing per page, the algorithms feed every edited page into a
//! [`TlbAccumulator`]; the memory variant, [`AutoTlbFlush`], issues one
//! cross-CPU flush when it goes out of scope.
//!
//! ```text
//!   add_page(A) add_page(B) ... add_page(E)   drop
//!   [A] [A,B] ... [A,B,C,D] -> all                 cpu_call_many(cpus, flush)
//! ```

use crate::config::{MAX_CPUS, N_SPACES};
use crate::space::Space;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{Ordering, fence};
use log::debug;

/// A set of CPUs, one bit per CPU number.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct CpuSet(u64);

impl CpuSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// # Panics
    /// If `cpu` is out of range.
    #[must_use]
    pub const fn with(self, cpu: usize) -> Self {
        assert!(cpu < MAX_CPUS);
        Self(self.0 | (1 << cpu))
    }

    #[must_use]
    pub const fn contains(self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.0 & (1 << cpu) != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_CPUS).filter(move |&cpu| self.contains(cpu))
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Architecture hooks for TLB maintenance.
pub trait TlbHardware: Sync {
    /// Runs `f(cpu)` on every CPU in `cpus` and waits for all of them.
    fn cpu_call_many(&self, cpus: CpuSet, f: &(dyn Fn(usize) + Sync));

    /// Drops every non-global TLB entry on `cpu`. Runs on `cpu`.
    fn flush_all(&self, cpu: usize);

    /// Drops the TLB entries of `space` on `cpu`. Runs on `cpu`.
    fn flush_space(&self, cpu: usize, space: &Space);
}

/// Collects the pages a map or unmap call edited.
pub trait TlbAccumulator {
    fn add_page(&mut self, space: &Arc<Space>, va: u64, order: u32);
}

/// Accumulator for stores without a TLB (I/O ports, capabilities).
#[derive(Debug, Default, Copy, Clone)]
pub struct NoTlbFlush;

impl TlbAccumulator for NoTlbFlush {
    #[inline]
    fn add_page(&mut self, _space: &Arc<Space>, _va: u64, _order: u32) {}
}

/// Memory TLB accumulator. Flushes on drop.
///
/// Up to [`N_SPACES`] distinct spaces are flushed individually. Beyond that
/// every CPU that ran any recorded space drops its whole TLB.
pub struct AutoTlbFlush<'h, H: TlbHardware> {
    hw: &'h H,
    spaces: [Option<Arc<Space>>; N_SPACES],
    all: bool,
    cpus: CpuSet,
}

impl<'h, H: TlbHardware> AutoTlbFlush<'h, H> {
    #[must_use]
    pub const fn new(hw: &'h H) -> Self {
        Self {
            hw,
            spaces: [const { None }; N_SPACES],
            all: false,
            cpus: CpuSet::empty(),
        }
    }

    /// Whether nothing was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.all && self.spaces.iter().all(Option::is_none)
    }

    /// Whether the accumulator gave up tracking individual spaces.
    #[must_use]
    pub const fn flushes_all(&self) -> bool {
        self.all
    }

    /// CPUs the flush will be sent to.
    #[must_use]
    pub const fn cpus(&self) -> CpuSet {
        self.cpus
    }

    fn record(&mut self, space: &Arc<Space>) {
        if self.all {
            return;
        }
        for slot in &mut self.spaces {
            match slot {
                Some(s) if Arc::ptr_eq(s, space) => return,
                Some(_) => {}
                None => {
                    *slot = Some(space.clone());
                    return;
                }
            }
        }
        debug!("tlb: more than {N_SPACES} spaces touched, flushing everything");
        self.all = true;
        self.spaces = [const { None }; N_SPACES];
    }

    /// Sends the collected flush and resets the accumulator.
    pub fn global_flush(&mut self) {
        if self.is_empty() {
            return;
        }
        let all = self.all;
        let spaces = &self.spaces;
        let hw = self.hw;
        hw.cpu_call_many(self.cpus, &|cpu| {
            if all {
                hw.flush_all(cpu);
            } else {
                for s in spaces.iter().flatten() {
                    hw.flush_space(cpu, s);
                }
            }
        });
        self.all = false;
        self.spaces = [const { None }; N_SPACES];
        self.cpus = CpuSet::empty();
    }
}

impl<H: TlbHardware> TlbAccumulator for AutoTlbFlush<'_, H> {
    fn add_page(&mut self, space: &Arc<Space>, _va: u64, _order: u32) {
        self.record(space);
        // Order the page-table edit before reading where the space runs; a
        // CPU loading the space later sees the new entry instead.
        fence(Ordering::SeqCst);
        self.cpus = self.cpus.union(space.active_cpus());
    }
}

impl<H: TlbHardware> Drop for AutoTlbFlush<'_, H> {
    fn drop(&mut self) {
        self.global_flush();
    }
}
