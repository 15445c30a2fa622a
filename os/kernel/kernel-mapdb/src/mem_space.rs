use crate::config::{MEM_PAGE_ORDERS, PAGE_SIZE};
use crate::map_space::{InsertStatus, MapSpace, MapTraits, Page, PageAttr, PageLookup};
use crate::page_table::{PageTable, TableGeometry};
use crate::quota::RamQuota;
use crate::space::Space;
use alloc::sync::Arc;
use kernel_l4_types::{AccessFlags, Fpage, MapItem, Rights};
use kernel_sync::HelpingLock;

const GEOMETRY: TableGeometry = TableGeometry {
    orders: &MEM_PAGE_ORDERS,
    address_bits: 48,
    table_span: 9,
    table_bytes: PAGE_SIZE,
};

/// Memory type of a page, as selected by the attribute field of a map item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Keep the sender's type.
    #[default]
    Inherit,
    Cached,
    Uncached,
    Buffered,
}

impl CacheMode {
    #[must_use]
    pub const fn from_attr(attr: u8) -> Self {
        match attr & 0x3 {
            1 => Self::Cached,
            2 => Self::Uncached,
            3 => Self::Buffered,
            _ => Self::Inherit,
        }
    }
}

/// Attributes of a memory page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemAttr {
    pub rights: Rights,
    pub cache: CacheMode,
}

impl MemAttr {
    #[must_use]
    pub const fn new(rights: Rights) -> Self {
        Self {
            rights,
            cache: CacheMode::Inherit,
        }
    }

    /// What the root space holds: everything, cached.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            rights: Rights::RWX,
            cache: CacheMode::Cached,
        }
    }
}

impl PageAttr for MemAttr {
    fn rights(&self) -> Rights {
        self.rights
    }

    fn apply(self, requested: Self) -> Self {
        Self {
            rights: self.rights & requested.rights,
            cache: match requested.cache {
                CacheMode::Inherit => self.cache,
                other => other,
            },
        }
    }

    fn merge(&mut self, other: Self) -> bool {
        let before = *self;
        self.rights |= other.rights & Rights::RWX;
        if other.cache != CacheMode::Inherit {
            self.cache = other.cache;
        }
        *self != before
    }

    fn strip(&mut self, rights: Rights) {
        self.rights.remove(rights & Rights::RWX);
    }
}

/// The memory store of a space: a software page table over 4 KiB, 2 MiB
/// and 1 GiB leaves.
pub struct MemSpace {
    table: HelpingLock<PageTable<u64, MemAttr>>,
    /// Set for the root space, which can hand out any physical page.
    fabricate_below: Option<u64>,
    user_limit: u64,
}

impl MemSpace {
    pub(crate) fn new(quota: Arc<RamQuota>, user_limit: u64) -> Self {
        Self {
            table: HelpingLock::new(PageTable::new(GEOMETRY, quota)),
            fabricate_below: None,
            user_limit,
        }
    }

    /// Store of the root space, identity-mapping physical memory below
    /// `2^phys_bits`.
    pub(crate) fn sigma0(quota: Arc<RamQuota>, user_limit: u64, phys_bits: u32) -> Self {
        Self {
            fabricate_below: Some(1 << phys_bits),
            ..Self::new(quota, user_limit)
        }
    }

    /// Marks the page at `va` as touched, standing in for the hardware
    /// walker. Returns `false` if nothing is mapped there.
    pub fn record_access(&self, va: u64, flags: AccessFlags) -> bool {
        self.table.lock().record_access(va, flags)
    }

    /// Number of leaf entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Quota held by page-table pages.
    #[must_use]
    pub fn table_bytes(&self) -> usize {
        self.table.lock().table_bytes()
    }
}

impl MapSpace for MemSpace {
    type Phys = u64;
    type Attr = MemAttr;

    const NAME: &'static str = "mem";

    fn of(space: &Space) -> &Self {
        space.mem()
    }

    fn v_lookup(&self, va: u64) -> PageLookup<u64, MemAttr> {
        self.table.lock().lookup(va)
    }

    fn v_fabricate(&self, va: u64) -> PageLookup<u64, MemAttr> {
        let found = self.v_lookup(va);
        let Some(limit) = self.fabricate_below else {
            return found;
        };
        if va >= limit || matches!(found, PageLookup::Mapped(_)) {
            return found;
        }
        let order = MEM_PAGE_ORDERS
            .iter()
            .copied()
            .find(|&o| (1_u64 << o) <= limit)
            .unwrap_or(GEOMETRY.orders[GEOMETRY.orders.len() - 1]);
        PageLookup::Mapped(Page {
            phys: va & !((1 << order) - 1),
            order,
            attr: MemAttr::full(),
        })
    }

    fn v_insert(&self, phys: u64, va: u64, order: u32, attr: MemAttr) -> InsertStatus {
        self.table.lock().insert(phys, va, order, attr)
    }

    fn v_delete(&self, va: u64, _order: u32, rights: Rights) -> AccessFlags {
        self.table.lock().delete(va, rights)
    }

    fn v_set_access_flags(&self, va: u64, flags: AccessFlags) {
        self.table.lock().record_access(va, flags);
    }

    fn map_max_address(&self) -> u64 {
        self.user_limit
    }

    fn fitting_order(&self, order: u32) -> u32 {
        self.table.lock().fitting_order(order)
    }

    fn min_order(&self) -> u32 {
        self.table.lock().min_order()
    }

    fn subpage(phys: &u64, offset: u64) -> u64 {
        phys + offset
    }

    fn same_page(phys: &u64, other: &u64, order: u32) -> bool {
        phys & !((1 << order) - 1) == *other
    }
}

impl MapTraits for MemSpace {
    fn matches(from: Fpage, to: Fpage) -> bool {
        from.is_mempage() && (to.is_mempage() || to.is_all_spaces())
    }

    fn attribs(fp: Fpage, control: MapItem) -> MemAttr {
        MemAttr {
            rights: fp.rights() & Rights::RWX,
            cache: CacheMode::from_attr(control.attr()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_intersect_rights_and_override_cache_mode() {
        let src = MemAttr::full();
        let req = MemAttr {
            rights: Rights::RW,
            cache: CacheMode::Uncached,
        };
        assert_eq!(
            src.apply(req),
            MemAttr {
                rights: Rights::RW,
                cache: CacheMode::Uncached
            }
        );
        assert_eq!(src.apply(MemAttr::new(Rights::R)).cache, CacheMode::Cached);
    }

    #[test]
    fn sigma0_fabricates_identity_superpages() {
        let quota = Arc::new(RamQuota::unlimited());
        let mem = MemSpace::sigma0(quota, 1 << 47, 36);
        assert_eq!(
            mem.v_fabricate(0x4123_4000),
            PageLookup::Mapped(Page {
                phys: 0x4000_0000,
                order: 30,
                attr: MemAttr::full()
            })
        );
        assert!(matches!(mem.v_fabricate(1 << 36), PageLookup::Hole { .. }));
        assert!(matches!(mem.v_lookup(0x4123_4000), PageLookup::Hole { .. }));
    }

    #[test]
    fn ordinary_spaces_fabricate_nothing() {
        let mem = MemSpace::new(Arc::new(RamQuota::unlimited()), 1 << 47);
        assert_eq!(mem.v_fabricate(0x1000), PageLookup::Hole { order: 30 });
    }

    #[test]
    fn cache_mode_decoding() {
        assert_eq!(CacheMode::from_attr(0), CacheMode::Inherit);
        assert_eq!(CacheMode::from_attr(2), CacheMode::Uncached);
        assert_eq!(
            MemSpace::attribs(Fpage::mem(0, 12, Rights::FULL), MapItem::map().with_attr(3)),
            MemAttr {
                rights: Rights::RWX,
                cache: CacheMode::Buffered
            }
        );
    }
}
