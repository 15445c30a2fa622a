//! # Kernel synchronization primitives
//!
//! Locks used by the mapping database and the address spaces it touches.
//!
//! | Type | Used for |
//! |------|----------|
//! | [`HelpingLock`] | per-frame mapping trees, per-space existence, backing-store tables |
//! | [`lock_pair`] | taking the existence locks of two spaces in a global order |
//! | [`SyncOnceCell`] | one-time installation of the [`LockHooks`] |
//!
//! A helping lock knows which execution context holds it. Acquiring it a second
//! time from the same context is a kernel bug and panics instead of spinning forever.
//! While a lock is contended the waiter hands its time to the holder through
//! [`LockHooks::help`]; without a scheduler this is a plain spin.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod helping_lock;
mod ordered;
mod sync_once_cell;

pub use helping_lock::{HelpingLock, HelpingLockGuard, LockHooks, install_lock_hooks};
pub use ordered::lock_pair;
pub use sync_once_cell::SyncOnceCell;
