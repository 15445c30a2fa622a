use core::sync::atomic::{AtomicUsize, Ordering};
use log::trace;

/// Requested more kernel memory than a quota allows.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("quota exceeded: {requested} bytes requested, {available} available")]
pub struct QuotaExceeded {
    pub requested: usize,
    pub available: usize,
}

/// Kernel memory budget of one or more spaces.
///
/// Every mapping node, submap, capability table and page-table page is
/// charged against the quota of the space that caused it and refunded to the
/// same quota when it goes away.
#[derive(Debug)]
pub struct RamQuota {
    limit: usize,
    used: AtomicUsize,
}

impl RamQuota {
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// A quota that never runs out; used for the root space.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    /// Charges `bytes`.
    ///
    /// # Errors
    /// Nothing is charged if the limit would be exceeded.
    pub fn alloc(&self, bytes: usize) -> Result<(), QuotaExceeded> {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let next = used
                .checked_add(bytes)
                .filter(|&n| n <= self.limit)
                .ok_or(QuotaExceeded {
                    requested: bytes,
                    available: self.limit - used,
                })?;
            match self
                .used
                .compare_exchange_weak(used, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    trace!("quota: +{bytes} -> {next}/{}", self.limit);
                    return Ok(());
                }
                Err(seen) => used = seen,
            }
        }
    }

    /// Refunds `bytes` charged earlier.
    ///
    /// # Panics
    /// On refunding more than was charged.
    pub fn free(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::AcqRel);
        assert!(prev >= bytes, "quota refund of {bytes} exceeds usage {prev}");
        trace!("quota: -{bytes} -> {}/{}", prev - bytes, self.limit);
    }

    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    #[inline]
    #[must_use]
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_respects_limit() {
        let q = RamQuota::new(100);
        assert_eq!(q.alloc(60), Ok(()));
        assert_eq!(
            q.alloc(50),
            Err(QuotaExceeded {
                requested: 50,
                available: 40
            })
        );
        assert_eq!(q.used(), 60);
        assert_eq!(q.alloc(40), Ok(()));
        assert_eq!(q.available(), 0);
    }

    #[test]
    fn free_returns_budget() {
        let q = RamQuota::new(10);
        q.alloc(10).unwrap();
        q.free(4);
        assert_eq!(q.used(), 6);
        assert_eq!(q.alloc(4), Ok(()));
    }

    #[test]
    #[should_panic(expected = "exceeds usage")]
    fn over_refund_panics() {
        let q = RamQuota::new(10);
        q.free(1);
    }

    #[test]
    fn unlimited_never_fails() {
        let q = RamQuota::unlimited();
        assert!(q.alloc(usize::MAX / 2).is_ok());
        assert!(q.alloc(1024).is_ok());
    }
}
