//! Software page table shared by the memory and I/O stores.
//!
//! Leaves are kept in an ordered map keyed by their (aligned) address. The
//! intermediate tables a hardware walker would need are only accounted: the
//! first leaf inside a table's span charges one table to the quota, the last
//! one leaving refunds it.

use crate::map_space::{InsertStatus, Page, PageAttr, PageLookup};
use crate::quota::RamQuota;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use kernel_l4_types::{AccessFlags, Rights};
use log::trace;

#[derive(Debug, Clone)]
struct Pte<P, A> {
    phys: P,
    order: u32,
    attr: A,
    access: AccessFlags,
}

/// Shape of a [`PageTable`].
#[derive(Debug, Copy, Clone)]
pub(crate) struct TableGeometry {
    /// Supported leaf orders, largest first.
    pub orders: &'static [u32],
    /// log2 of the addressable range.
    pub address_bits: u32,
    /// log2 of the span of one table relative to the leaves it holds.
    pub table_span: u32,
    /// Bytes charged per table.
    pub table_bytes: usize,
}

pub(crate) struct PageTable<P, A> {
    geometry: TableGeometry,
    quota: Arc<RamQuota>,
    entries: BTreeMap<u64, Pte<P, A>>,
    /// Live leaves per (table order, table index).
    tables: BTreeMap<(u32, u64), usize>,
}

#[inline]
const fn align_down(va: u64, order: u32) -> u64 {
    if order >= u64::BITS {
        0
    } else {
        va & !((1 << order) - 1)
    }
}

#[inline]
const fn block_end(start: u64, order: u32) -> u64 {
    if order >= u64::BITS {
        u64::MAX
    } else {
        start.saturating_add(1 << order)
    }
}

impl<P: Clone + PartialEq, A: PageAttr> PageTable<P, A> {
    pub(crate) const fn new(geometry: TableGeometry, quota: Arc<RamQuota>) -> Self {
        Self {
            geometry,
            quota,
            entries: BTreeMap::new(),
            tables: BTreeMap::new(),
        }
    }

    /// The entry covering `va`.
    fn covering(&self, va: u64) -> Option<(u64, &Pte<P, A>)> {
        let (&start, pte) = self.entries.range(..=va).next_back()?;
        (va < block_end(start, pte.order)).then_some((start, pte))
    }

    /// Whether any entry overlaps `start..start + 2^order`.
    fn occupied(&self, start: u64, order: u32) -> bool {
        let end = block_end(start, order);
        self.entries
            .range(..end)
            .next_back()
            .is_some_and(|(&s, pte)| block_end(s, pte.order) > start)
    }

    pub(crate) fn lookup(&self, va: u64) -> PageLookup<P, A> {
        if let Some((_, pte)) = self.covering(va) {
            return PageLookup::Mapped(Page {
                phys: pte.phys.clone(),
                order: pte.order,
                attr: pte.attr,
            });
        }
        let order = self
            .geometry
            .orders
            .iter()
            .copied()
            .find(|&o| !self.occupied(align_down(va, o), o))
            .unwrap_or_else(|| self.min_order());
        PageLookup::Hole { order }
    }

    fn table_of(&self, va: u64, order: u32) -> (u32, u64) {
        let span = (order + self.geometry.table_span).min(self.geometry.address_bits);
        let index = if span >= u64::BITS { 0 } else { va >> span };
        (span, index)
    }

    pub(crate) fn insert(&mut self, phys: P, va: u64, order: u32, attr: A) -> InsertStatus {
        debug_assert_eq!(align_down(va, order), va);

        if let Some(pte) = self.entries.get_mut(&va) {
            if pte.order == order && pte.phys == phys {
                return if pte.attr.merge(attr) {
                    InsertStatus::WarnAttribUpgrade
                } else {
                    InsertStatus::WarnExists
                };
            }
            return InsertStatus::ErrExists;
        }
        if self.occupied(va, order) {
            return InsertStatus::ErrExists;
        }

        let table = self.table_of(va, order);
        let leaves = self.tables.get(&table).copied().unwrap_or(0);
        if leaves == 0 && self.quota.alloc(self.geometry.table_bytes).is_err() {
            return InsertStatus::ErrNomem;
        }
        self.tables.insert(table, leaves + 1);
        self.entries.insert(
            va,
            Pte {
                phys,
                order,
                attr,
                access: AccessFlags::empty(),
            },
        );
        trace!("ptab: inserted {va:#x}/{order}");
        InsertStatus::Ok
    }

    /// Strips `rights` from the entry covering `va`, or removes it on a full
    /// flush. Returns and clears the access flags.
    pub(crate) fn delete(&mut self, va: u64, rights: Rights) -> AccessFlags {
        let Some((start, _)) = self.covering(va) else {
            return AccessFlags::empty();
        };

        if !rights.is_full_flush() {
            let Some(pte) = self.entries.get_mut(&start) else {
                return AccessFlags::empty();
            };
            pte.attr.strip(rights);
            return core::mem::take(&mut pte.access);
        }

        let Some(pte) = self.entries.remove(&start) else {
            return AccessFlags::empty();
        };
        let table = self.table_of(start, pte.order);
        match self.tables.get_mut(&table) {
            Some(1) => {
                self.tables.remove(&table);
                self.quota.free(self.geometry.table_bytes);
            }
            Some(n) => *n -= 1,
            None => unreachable!("leaf without table"),
        }
        trace!("ptab: removed {start:#x}/{}", pte.order);
        pte.access
    }

    /// ORs access flags into the entry covering `va`.
    pub(crate) fn record_access(&mut self, va: u64, flags: AccessFlags) -> bool {
        let Some((start, _)) = self.covering(va) else {
            return false;
        };
        if let Some(pte) = self.entries.get_mut(&start) {
            pte.access |= flags;
        }
        true
    }

    /// Number of leaves.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Bytes currently charged for tables.
    pub(crate) fn table_bytes(&self) -> usize {
        self.tables.len() * self.geometry.table_bytes
    }

    pub(crate) fn fitting_order(&self, order: u32) -> u32 {
        let orders = self.geometry.orders;
        orders
            .iter()
            .copied()
            .find(|&o| o <= order)
            .unwrap_or(orders[orders.len() - 1])
    }

    pub(crate) fn min_order(&self) -> u32 {
        self.geometry.orders[self.geometry.orders.len() - 1]
    }
}

impl<P, A> Drop for PageTable<P, A> {
    fn drop(&mut self) {
        let charged = self.tables.len() * self.geometry.table_bytes;
        if charged > 0 {
            self.quota.free(charged);
        }
    }
}
