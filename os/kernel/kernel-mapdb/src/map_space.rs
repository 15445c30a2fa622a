//! # Backing-store contract
//!
//! The map and unmap algorithms are written once against [`MapSpace`], which
//! every store of a [`Space`] implements (memory pages, I/O ports,
//! capability slots), and [`MapTraits`], the per-store attribute and object
//! life-cycle policy. The provenance side is [`MapDb`].
//!
//! Addresses and orders are in store units: bytes for memory, ports for I/O,
//! slots for capabilities.

use crate::mapping::Mapping;
use crate::reap::ReapList;
use crate::space::Space;
use alloc::sync::Arc;
use core::fmt::Debug;
use kernel_l4_types::{AccessFlags, Fpage, MapItem, MapMask, Rights};

/// A present entry of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<P, A> {
    /// What the entry refers to, at the start of the page.
    pub phys: P,
    /// log2 of the page size.
    pub order: u32,
    pub attr: A,
}

/// Result of looking up an address in a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageLookup<P, A> {
    Mapped(Page<P, A>),
    /// Nothing there; the free block around the address has this order.
    Hole { order: u32 },
}

impl<P, A> PageLookup<P, A> {
    /// Order of the entry or of the hole.
    #[inline]
    pub const fn order(&self) -> u32 {
        match self {
            Self::Mapped(page) => page.order,
            Self::Hole { order } => *order,
        }
    }
}

/// Outcome of [`MapSpace::v_insert`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InsertStatus {
    /// New entry created.
    Ok,
    /// The same page is already there with at least these attributes.
    WarnExists,
    /// The same page is already there; its attributes were extended.
    WarnAttribUpgrade,
    /// No memory for the entry or its table.
    ErrNomem,
    /// Something else occupies the slot.
    ErrExists,
}

/// Attributes of a store entry.
pub trait PageAttr: Copy + PartialEq + Debug {
    fn rights(&self) -> Rights;

    /// Restricts `self` by a requested attribute set.
    #[must_use]
    fn apply(self, requested: Self) -> Self;

    /// Extends `self` by `other`. Returns whether anything changed.
    fn merge(&mut self, other: Self) -> bool;

    /// Removes rights, for a narrowing unmap.
    fn strip(&mut self, rights: Rights);
}

impl PageAttr for Rights {
    fn rights(&self) -> Rights {
        *self
    }

    fn apply(self, requested: Self) -> Self {
        self & requested
    }

    fn merge(&mut self, other: Self) -> bool {
        let before = *self;
        *self |= other;
        *self != before
    }

    fn strip(&mut self, rights: Rights) {
        self.remove(rights);
    }
}

/// A backing store: the "page table" the algorithms edit.
///
/// Stores live inside a shared [`Space`] and lock internally; the frame lock
/// of the mapdb is always taken first.
pub trait MapSpace: Sized + 'static {
    type Phys: Clone + PartialEq + Debug;
    type Attr: PageAttr;

    /// Store name for diagnostics.
    const NAME: &'static str;

    /// The store of this kind inside `space`.
    fn of(space: &Space) -> &Self;

    fn v_lookup(&self, va: u64) -> PageLookup<Self::Phys, Self::Attr>;

    /// Like [`v_lookup`](Self::v_lookup), but may invent an entry that has
    /// no table behind it (the root space's identity mapping).
    fn v_fabricate(&self, va: u64) -> PageLookup<Self::Phys, Self::Attr> {
        self.v_lookup(va)
    }

    fn v_insert(&self, phys: Self::Phys, va: u64, order: u32, attr: Self::Attr) -> InsertStatus;

    /// Removes `rights` from the entry at `va`; everything if they include
    /// read. Returns the access flags collected on the entry.
    fn v_delete(&self, va: u64, order: u32, rights: Rights) -> AccessFlags;

    /// Keeps access flags observed on a descendant.
    fn v_set_access_flags(&self, _va: u64, _flags: AccessFlags) {}

    /// First address not reachable through map and unmap.
    fn map_max_address(&self) -> u64;

    /// Largest supported page order not above `order`.
    fn fitting_order(&self, order: u32) -> u32;

    /// Smallest supported page order.
    fn min_order(&self) -> u32;

    /// The part of `phys` at `offset` units into it.
    fn subpage(phys: &Self::Phys, offset: u64) -> Self::Phys;

    /// Whether `phys` is the page of order `order` containing `other`.
    fn same_page(phys: &Self::Phys, other: &Self::Phys, order: u32) -> bool;
}

/// Per-store policy of the map and unmap algorithms.
pub trait MapTraits: MapSpace {
    /// Whether this store is addressed by the flexpage pair.
    fn matches(from: Fpage, to: Fpage) -> bool;

    /// Attributes requested by a map item.
    fn attribs(fp: Fpage, control: MapItem) -> Self::Attr;

    /// Attributes of the new entry. May replace `phys` by a weaker variant.
    fn apply_attribs(src: Self::Attr, _phys: &mut Self::Phys, requested: Self::Attr) -> Self::Attr {
        src.apply(requested)
    }

    /// Called after a full flush; queues `phys` for destruction if its last
    /// mapping is gone. Returns whether it was queued.
    fn free_object(_phys: &Self::Phys, _reap: &mut ReapList) -> bool {
        false
    }

    /// Whether new mappings of `phys` may still be created.
    fn is_mappable(_phys: &Self::Phys) -> bool {
        true
    }

    /// Whether unmapping the caller's entry with these attributes revokes
    /// every mapping of `phys`, not only the derived ones.
    fn revokes_all(_attr: Self::Attr, _mask: MapMask) -> bool {
        false
    }
}

/// Provenance records of one store kind.
pub trait MapDb<S: MapSpace> {
    /// A located and locked tree position. Dropping it releases the lock.
    type Frame<'a>
    where
        Self: 'a;

    fn valid_address(&self, phys: &S::Phys) -> bool;

    /// Finds the mapping of `space` at `va` referring to `phys`.
    fn lookup<'a>(&'a self, space: &Space, va: u64, phys: &'a S::Phys) -> Option<Self::Frame<'a>>;

    /// Locates the receiver's mapping of `r_phys` and succeeds if it is a
    /// direct child of the sender's mapping at `snd_va`. The frame is
    /// positioned at the sender.
    fn check_for_upgrade<'a>(
        &'a self,
        r_phys: &'a S::Phys,
        from: &Space,
        snd_va: u64,
        to: &Space,
        rcv_va: u64,
    ) -> Option<Self::Frame<'a>>;

    /// Records a child of the frame's mapping. `false` on exhaustion.
    fn insert(
        &self,
        frame: &mut Self::Frame<'_>,
        space: &Arc<Space>,
        va: u64,
        phys: &S::Phys,
        order: u32,
    ) -> bool;

    /// Moves the frame's mapping to `space` at `va`. `false` on exhaustion.
    fn grant(&self, frame: &mut Self::Frame<'_>, space: &Arc<Space>, va: u64) -> bool;

    /// Removes the mappings derived from the frame's mapping that overlap
    /// `offs_begin..offs_end` (relative to the frame's page), and the
    /// mapping itself if `me_too`.
    fn flush(&self, frame: &mut Self::Frame<'_>, me_too: bool, offs_begin: u64, offs_end: u64);

    /// Calls `f` for every mapping derived from the frame's mapping, with
    /// the page order it was recorded at.
    fn foreach_mapping(
        &self,
        frame: &Self::Frame<'_>,
        offs_begin: u64,
        offs_end: u64,
        f: &mut dyn FnMut(&Mapping, u32),
    );

    /// Space and address of the mapping the frame's mapping derives from,
    /// if that is a real mapping.
    fn parent(&self, frame: &Self::Frame<'_>) -> Option<(Arc<Space>, u64)>;

    /// Whether the frame stands for the root owner rather than a mapping.
    fn is_root(&self, frame: &Self::Frame<'_>) -> bool;

    /// Moves the frame to the root owner so that a flush reaches every
    /// mapping of the object.
    fn reanchor_root(&self, _frame: &mut Self::Frame<'_>) {}
}
