use crate::{HelpingLock, HelpingLockGuard};

/// Locks two helping locks in address order, lower address first.
///
/// Two contexts locking the same pair from opposite ends therefore never
/// deadlock. If both references name the same lock it is taken once and the
/// second guard is `None`. Guards are returned in acquisition order.
pub fn lock_pair<'a, T>(
    a: &'a HelpingLock<T>,
    b: &'a HelpingLock<T>,
) -> (HelpingLockGuard<'a, T>, Option<HelpingLockGuard<'a, T>>) {
    if core::ptr::eq(a, b) {
        return (a.lock(), None);
    }

    let (first, second) = if (a as *const HelpingLock<T>) < (b as *const HelpingLock<T>) {
        (a, b)
    } else {
        (b, a)
    };

    let g1 = first.lock();
    let g2 = second.lock();
    (g1, Some(g2))
}
