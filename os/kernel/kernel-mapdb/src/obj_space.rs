//! # Capability store
//!
//! A space's capabilities live in a two-level table: one directory page of
//! [`SLOTS_PER_DIR`] pointers, each to a table page of [`CAPS_PER_PAGE`]
//! slots. Pages are allocated on first use and charged to the space's quota.
//!
//! ```text
//!   index:  | dir slot | table slot |
//!           |          |<- LD2 bits->|
//! ```

use crate::config::{CAPS_PER_PAGE, CAPS_PER_PAGE_LD2, PAGE_SIZE, SLOTS_PER_DIR};
use crate::kobject::Kobject;
use crate::map_space::{InsertStatus, MapSpace, MapTraits, Page, PageAttr, PageLookup};
use crate::quota::RamQuota;
use crate::reap::ReapList;
use crate::space::Space;
use alloc::boxed::Box;
use alloc::sync::Arc;
use bitfield_struct::bitfield;
use bitflags::bitflags;
use kernel_l4_types::{AccessFlags, Fpage, MapItem, MapMask, Rights};
use kernel_sync::HelpingLock;
use log::debug;

bitflags! {
    /// Capability properties beyond the flexpage rights.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct ObjExtra: u8 {
        /// The capability keeps its object alive. Mapping with the weak-ref
        /// attribute bit set clears it.
        const STRONG = 0x1;
    }
}

/// Attributes of a capability slot.
///
/// | Bits | Field |
/// |------|-------|
/// | 0..3 | rights |
/// | 4..7 | extra ([`ObjExtra`]) |
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct ObjAttr {
    #[bits(4)]
    rights_bits: u8,
    #[bits(4)]
    extra_bits: u8,
}

impl ObjAttr {
    #[must_use]
    pub const fn from_parts(rights: Rights, extra: ObjExtra) -> Self {
        Self::new()
            .with_rights_bits(rights.bits())
            .with_extra_bits(extra.bits())
    }

    /// Every right, strong.
    #[must_use]
    pub const fn full() -> Self {
        Self::from_parts(Rights::FULL, ObjExtra::STRONG)
    }

    #[inline]
    #[must_use]
    pub const fn extra(self) -> ObjExtra {
        ObjExtra::from_bits_truncate(self.extra_bits())
    }
}

impl PageAttr for ObjAttr {
    fn rights(&self) -> Rights {
        Rights::from_bits_truncate(self.rights_bits())
    }

    fn apply(self, requested: Self) -> Self {
        Self::from_parts(
            self.rights() & requested.rights(),
            self.extra() & requested.extra(),
        )
    }

    fn merge(&mut self, other: Self) -> bool {
        let merged = Self::from_parts(
            self.rights() | other.rights(),
            self.extra() | other.extra(),
        );
        let changed = merged != *self;
        *self = merged;
        changed
    }

    /// Removes everything in `rights` but `CR`, which invalidates the slot
    /// instead.
    fn strip(&mut self, rights: Rights) {
        let kept = self.rights() - (rights & (Rights::CWS | Rights::CD));
        self.set_rights_bits(kept.bits());
    }
}

/// A valid capability slot.
#[derive(Debug, Clone)]
pub struct Capability {
    pub obj: Arc<Kobject>,
    pub attr: ObjAttr,
}

type CapTable = Box<[Option<Capability>]>;
type CapDir = Box<[Option<CapTable>]>;

/// The capability store of a space.
pub struct ObjSpacePhys {
    quota: Arc<RamQuota>,
    dir: HelpingLock<Option<CapDir>>,
}

#[inline]
const fn split(index: u64) -> (usize, usize) {
    // Callers bound index by map_max_address, which fits a usize.
    #[allow(clippy::cast_possible_truncation)]
    let index = index as usize;
    (index >> CAPS_PER_PAGE_LD2, index & (CAPS_PER_PAGE - 1))
}

impl ObjSpacePhys {
    pub(crate) fn new(quota: Arc<RamQuota>) -> Self {
        Self {
            quota,
            dir: HelpingLock::new(None),
        }
    }

    /// The capability at `index`, if valid.
    #[must_use]
    pub fn lookup_cap(&self, index: u64) -> Option<Capability> {
        if index >= self.map_max_address() {
            return None;
        }
        let (d, t) = split(index);
        let dir = self.dir.lock();
        dir.as_ref()?[d].as_ref()?[t].clone()
    }

    /// Number of valid capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dir.lock().as_ref().map_or(0, |dir| {
            dir.iter()
                .flatten()
                .map(|table| table.iter().flatten().count())
                .sum()
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Quota held by the directory and table pages.
    #[must_use]
    pub fn table_bytes(&self) -> usize {
        Self::charged(self.dir.lock().as_ref())
    }

    fn charged(dir: Option<&CapDir>) -> usize {
        dir.map_or(0, |dir| {
            PAGE_SIZE * (1 + dir.iter().filter(|t| t.is_some()).count())
        })
    }

    /// Releases all table pages. Remaining capabilities are dropped without
    /// touching the mapping database.
    pub fn caps_free(&self) {
        let freed = self.dir.lock().take();
        let bytes = Self::charged(freed.as_ref());
        if bytes > 0 {
            self.quota.free(bytes);
        }
        debug!("obj: released {bytes} bytes of capability tables");
    }

    fn alloc_page(&self) -> bool {
        self.quota.alloc(PAGE_SIZE).is_ok()
    }
}

impl Drop for ObjSpacePhys {
    fn drop(&mut self) {
        let bytes = Self::charged(self.dir.get_mut().as_ref());
        if bytes > 0 {
            self.quota.free(bytes);
        }
    }
}

impl MapSpace for ObjSpacePhys {
    type Phys = Arc<Kobject>;
    type Attr = ObjAttr;

    const NAME: &'static str = "obj";

    fn of(space: &Space) -> &Self {
        space.obj()
    }

    fn v_lookup(&self, index: u64) -> PageLookup<Arc<Kobject>, ObjAttr> {
        if index >= self.map_max_address() {
            return PageLookup::Hole { order: 0 };
        }
        let (d, t) = split(index);
        let dir = self.dir.lock();
        let Some(table) = dir.as_ref().and_then(|dir| dir[d].as_ref()) else {
            return PageLookup::Hole {
                order: CAPS_PER_PAGE_LD2,
            };
        };
        match &table[t] {
            Some(cap) => PageLookup::Mapped(Page {
                phys: cap.obj.clone(),
                order: 0,
                attr: cap.attr,
            }),
            None => PageLookup::Hole { order: 0 },
        }
    }

    fn v_insert(&self, obj: Arc<Kobject>, index: u64, order: u32, attr: ObjAttr) -> InsertStatus {
        debug_assert_eq!(order, 0, "capabilities are mapped one at a time");
        if index >= self.map_max_address() {
            return InsertStatus::ErrNomem;
        }
        let (d, t) = split(index);
        let mut dir = self.dir.lock();

        if dir.is_none() && !self.alloc_page() {
            return InsertStatus::ErrNomem;
        }
        let dir = dir.get_or_insert_with(|| (0..SLOTS_PER_DIR).map(|_| None).collect());
        if dir[d].is_none() && !self.alloc_page() {
            return InsertStatus::ErrNomem;
        }
        let table = dir[d].get_or_insert_with(|| (0..CAPS_PER_PAGE).map(|_| None).collect());

        match &mut table[t] {
            Some(cap) if Arc::ptr_eq(&cap.obj, &obj) => {
                if cap.attr.merge(attr) {
                    InsertStatus::WarnAttribUpgrade
                } else {
                    InsertStatus::WarnExists
                }
            }
            Some(_) => InsertStatus::ErrExists,
            slot @ None => {
                *slot = Some(Capability { obj, attr });
                InsertStatus::Ok
            }
        }
    }

    fn v_delete(&self, index: u64, _order: u32, rights: Rights) -> AccessFlags {
        if index >= self.map_max_address() {
            return AccessFlags::empty();
        }
        let (d, t) = split(index);
        let mut dir = self.dir.lock();
        let Some(slot) = dir
            .as_mut()
            .and_then(|dir| dir[d].as_mut())
            .map(|table| &mut table[t])
        else {
            return AccessFlags::empty();
        };

        if rights.contains(Rights::CR) {
            // Dropped after the store lock is released.
            let gone = slot.take();
            drop(dir);
            drop(gone);
        } else if let Some(cap) = slot {
            cap.attr.strip(rights);
        }
        AccessFlags::empty()
    }

    fn map_max_address(&self) -> u64 {
        (SLOTS_PER_DIR * CAPS_PER_PAGE) as u64
    }

    fn fitting_order(&self, _order: u32) -> u32 {
        0
    }

    fn min_order(&self) -> u32 {
        0
    }

    fn subpage(obj: &Arc<Kobject>, offset: u64) -> Arc<Kobject> {
        debug_assert_eq!(offset, 0);
        obj.clone()
    }

    fn same_page(obj: &Arc<Kobject>, other: &Arc<Kobject>, _order: u32) -> bool {
        Arc::ptr_eq(obj, other)
    }
}

impl MapTraits for ObjSpacePhys {
    fn matches(from: Fpage, to: Fpage) -> bool {
        from.is_objpage() && (to.is_objpage() || to.is_all_spaces())
    }

    /// A plain map hands out a strong reference; the weak-ref bit of the
    /// control word takes it away.
    fn attribs(fp: Fpage, control: MapItem) -> ObjAttr {
        let extra = ObjExtra::from_bits_truncate(ObjExtra::STRONG.bits() ^ control.attr());
        ObjAttr::from_parts(fp.rights(), extra)
    }

    fn apply_attribs(src: ObjAttr, obj: &mut Arc<Kobject>, requested: ObjAttr) -> ObjAttr {
        if !(src.extra() - requested.extra()).is_empty() {
            *obj = obj.downgrade();
        }
        src.apply(requested)
    }

    fn free_object(obj: &Arc<Kobject>, reap: &mut ReapList) -> bool {
        if obj.has_mappings() || !obj.initiate_deletion() {
            return false;
        }
        reap.push(obj.clone());
        true
    }

    fn is_mappable(obj: &Arc<Kobject>) -> bool {
        obj.is_live()
    }

    fn revokes_all(attr: ObjAttr, mask: MapMask) -> bool {
        mask.self_unmap() && mask.do_delete() && attr.rights().contains(Rights::CD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kobject::KobjectKind;

    fn store(limit: usize) -> (Arc<RamQuota>, ObjSpacePhys) {
        let quota = Arc::new(RamQuota::new(limit));
        (quota.clone(), ObjSpacePhys::new(quota))
    }

    #[test]
    fn missing_table_reports_a_table_sized_hole() {
        let (_, caps) = store(1 << 20);
        assert_eq!(caps.v_lookup(5), PageLookup::Hole { order: CAPS_PER_PAGE_LD2 });
        let obj = Kobject::new(1, KobjectKind::IpcGate);
        assert_eq!(caps.v_insert(obj, 5, 0, ObjAttr::full()), InsertStatus::Ok);
        assert_eq!(caps.v_lookup(6), PageLookup::Hole { order: 0 });
        assert!(matches!(caps.v_lookup(5), PageLookup::Mapped(Page { order: 0, .. })));
    }

    #[test]
    fn insert_taxonomy() {
        let (_, caps) = store(1 << 20);
        let a = Kobject::new(1, KobjectKind::IpcGate);
        let b = Kobject::new(2, KobjectKind::IpcGate);
        let r = ObjAttr::from_parts(Rights::CR, ObjExtra::STRONG);
        let rw = ObjAttr::from_parts(Rights::CR | Rights::CW, ObjExtra::STRONG);

        assert_eq!(caps.v_insert(a.clone(), 3, 0, r), InsertStatus::Ok);
        assert_eq!(caps.v_insert(a.clone(), 3, 0, r), InsertStatus::WarnExists);
        assert_eq!(caps.v_insert(a.clone(), 3, 0, rw), InsertStatus::WarnAttribUpgrade);
        assert_eq!(caps.v_insert(b, 3, 0, r), InsertStatus::ErrExists);
        assert_eq!(caps.lookup_cap(3).map(|c| c.attr.rights()), Some(Rights::CR | Rights::CW));
    }

    #[test]
    fn tables_are_charged_and_released() {
        let (quota, caps) = store(2 * PAGE_SIZE);
        let a = Kobject::new(1, KobjectKind::Task);
        assert_eq!(caps.v_insert(a.clone(), 0, 0, ObjAttr::full()), InsertStatus::Ok);
        assert_eq!(quota.used(), 2 * PAGE_SIZE);
        // A second table does not fit.
        let far = CAPS_PER_PAGE as u64 * 3;
        assert_eq!(caps.v_insert(a, far, 0, ObjAttr::full()), InsertStatus::ErrNomem);

        caps.caps_free();
        assert_eq!(quota.used(), 0);
        assert!(caps.is_empty());
    }

    #[test]
    fn delete_without_read_right_only_narrows() {
        let (_, caps) = store(1 << 20);
        let a = Kobject::new(1, KobjectKind::IpcGate);
        caps.v_insert(a, 9, 0, ObjAttr::full());

        caps.v_delete(9, 0, Rights::CW);
        let cap = caps.lookup_cap(9).unwrap();
        assert_eq!(cap.attr.rights(), Rights::CR | Rights::CS | Rights::CD);

        caps.v_delete(9, 0, Rights::CR);
        assert!(caps.lookup_cap(9).is_none());
    }

    #[test]
    fn delete_right_can_be_stripped() {
        let mut attr = ObjAttr::full();
        attr.strip(Rights::CD);
        assert_eq!(attr.rights(), Rights::CR | Rights::CW | Rights::CS);
        attr.strip(Rights::FULL - Rights::CR);
        assert_eq!(attr.rights(), Rights::CR);
    }

    #[test]
    fn upgrade_merges_strength() {
        let mut attr = ObjAttr::from_parts(Rights::CR, ObjExtra::empty());
        assert!(attr.merge(ObjAttr::from_parts(Rights::CR, ObjExtra::STRONG)));
        assert_eq!(attr.extra(), ObjExtra::STRONG);
        assert!(!attr.merge(ObjAttr::from_parts(Rights::CR, ObjExtra::STRONG)));
    }

    #[test]
    fn weak_reference_bit_strips_strength() {
        let fp = Fpage::obj(0, 0, Rights::CR);
        assert_eq!(
            ObjSpacePhys::attribs(fp, MapItem::map()).extra(),
            ObjExtra::STRONG
        );
        assert_eq!(
            ObjSpacePhys::attribs(fp, MapItem::map().with_attr(1)).extra(),
            ObjExtra::empty()
        );
    }

    #[test]
    fn weak_map_of_a_strong_cap_downgrades_the_object() {
        let weak = Kobject::new(2, KobjectKind::IpcGate);
        let strong = Kobject::with_restricted(1, KobjectKind::IpcGate, weak.clone());
        let mut phys = strong.clone();
        let req = ObjAttr::from_parts(Rights::CR, ObjExtra::empty());

        let attr = ObjSpacePhys::apply_attribs(ObjAttr::full(), &mut phys, req);
        assert!(Arc::ptr_eq(&phys, &weak));
        assert_eq!(attr, req);
    }
}
