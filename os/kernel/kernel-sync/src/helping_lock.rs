use crate::SyncOnceCell;
use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

/// Lock word value of an unlocked [`HelpingLock`].
const FREE: usize = 0;

/// Owner recorded when no [`LockHooks`] are installed.
///
/// All contexts share it, so recursion cannot be told apart from contention.
const ANONYMOUS: usize = usize::MAX;

/// Scheduler integration for [`HelpingLock`].
#[derive(Copy, Clone)]
pub struct LockHooks {
    /// Returns a non-zero identifier of the running execution context.
    pub current: fn() -> usize,
    /// Called while spinning on a lock held by the given context.
    pub help: fn(holder: usize),
}

static HOOKS: SyncOnceCell<LockHooks> = SyncOnceCell::new();

/// Installs the lock hooks for the lifetime of the kernel.
///
/// Returns `false` if hooks were already installed; the first set stays active.
pub fn install_lock_hooks(hooks: LockHooks) -> bool {
    HOOKS.set(hooks).is_ok()
}

#[inline]
fn current_context() -> Option<usize> {
    HOOKS.get().map(|h| (h.current)()).filter(|&id| id != FREE)
}

#[inline]
fn help(holder: usize) {
    match HOOKS.get() {
        Some(h) if holder != ANONYMOUS => (h.help)(holder),
        _ => spin_loop(),
    }
}

/// A lock that records its holder.
///
/// Waiters spin test-and-test-and-set style and call [`LockHooks::help`] on the
/// holder between attempts. Re-acquisition by the holder panics.
pub struct HelpingLock<T> {
    /// Lock word:
    /// * [`FREE`]: unlocked
    /// * anything else: the context id of the holder
    owner: AtomicUsize,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for HelpingLock<T> {}
unsafe impl<T: Send> Send for HelpingLock<T> {}

impl<T: Default> Default for HelpingLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> HelpingLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            owner: AtomicUsize::new(FREE),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Try once; returns immediately.
    ///
    /// # Panics
    /// If the calling context already holds the lock.
    #[inline]
    pub fn try_lock(&self) -> Option<HelpingLockGuard<'_, T>> {
        let me = current_context();
        match self.acquire_once(me) {
            Ok(()) => Some(HelpingLockGuard { lock: self }),
            Err(holder) => {
                Self::check_recursion(me, holder);
                None
            }
        }
    }

    /// Spin until acquired, then return a guard.
    ///
    /// # Panics
    /// If the calling context already holds the lock.
    #[inline]
    pub fn lock(&self) -> HelpingLockGuard<'_, T> {
        let me = current_context();
        while let Err(holder) = self.acquire_once(me) {
            Self::check_recursion(me, holder);
            // Wait on a plain read until the word flips back.
            let mut seen = holder;
            while seen != FREE {
                help(seen);
                seen = self.owner.load(Ordering::Relaxed);
            }
        }
        HelpingLockGuard { lock: self }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    /// Whether any context currently holds the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != FREE
    }

    /// Whether the calling context holds the lock.
    ///
    /// Always `false` without installed [`LockHooks`].
    #[inline]
    pub fn is_held_by_current(&self) -> bool {
        current_context().is_some_and(|me| self.owner.load(Ordering::Relaxed) == me)
    }

    #[inline]
    fn acquire_once(&self, me: Option<usize>) -> Result<(), usize> {
        self.owner
            .compare_exchange(
                FREE,
                me.unwrap_or(ANONYMOUS),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .map(|_| ())
    }

    #[inline]
    fn check_recursion(me: Option<usize>, holder: usize) {
        if let Some(me) = me {
            assert_ne!(holder, me, "helping lock acquired twice by context {me:#x}");
        }
    }
}

pub struct HelpingLockGuard<'a, T> {
    lock: &'a HelpingLock<T>,
}

impl<T> Deref for HelpingLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for HelpingLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for HelpingLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release publishes the critical section.
        self.lock.owner.store(FREE, Ordering::Release);
    }
}
