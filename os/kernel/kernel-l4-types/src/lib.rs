//! # L4 map/unmap ABI types
//!
//! Wire-level descriptors exchanged between user space and the mapping
//! database:
//!
//! - [`Fpage`]: a flexpage, i.e. a naturally aligned `2^order` region of one
//!   backing store (memory, I/O ports or capability slots) plus rights.
//! - [`MapItem`]: the control word sent along with a map item (grant flag,
//!   attribute field, hot spot).
//! - [`MapMask`]: flags of an unmap request.
//! - [`Rights`] and [`AccessFlags`]: rights to transfer or strip, and the
//!   accessed/dirty state reported back by unmap.
//! - [`L4Error`]: the error code returned to user space.
//!
//! ## Flexpage layout
//!
//! ```text
//! | 63 ............. 12 | 11 .. 6 | 5 .. 4 | 3 .. 0 |
//! |      address        |  order  |  type  | rights |
//! ```
//!
//! Memory flexpages carry a page number in the address field, the other
//! kinds carry a plain port or capability index.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod error;
mod fpage;
mod map_item;
mod rights;

pub use error::{FpageError, L4Error};
pub use fpage::{Fpage, FpageKind};
pub use map_item::{MapItem, MapMask};
pub use rights::{AccessFlags, Rights};

/// log2 of the smallest memory page.
pub const PAGE_SHIFT: u8 = 12;
