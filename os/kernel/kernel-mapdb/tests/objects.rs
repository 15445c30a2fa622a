mod common;

use common::World;
use kernel_l4_types::{Fpage, L4Error, MapItem, MapMask, Rights};
use kernel_mapdb::config::{CAPS_PER_PAGE, SLOTS_PER_DIR};
use kernel_mapdb::{Kobject, KobjectKind, Lifecycle, ObjAttr, ObjExtra, PageAttr, ReapList};
use std::sync::Arc;

fn cap(index: u64, rights: Rights) -> Fpage {
    Fpage::obj(index, 0, rights)
}

#[test]
fn first_capability_is_the_root_of_the_object_tree() {
    let w = World::new();
    let a = w.task(1);
    let obj = Kobject::new(100, KobjectKind::IpcGate);
    let mut reap = ReapList::new();

    assert!(w.mapper.map_obj_initially(&a, &obj, 5, ObjAttr::full(), &mut reap));
    let slot = a.obj().lookup_cap(5).unwrap();
    assert!(Arc::ptr_eq(&slot.obj, &obj));
    assert_eq!(slot.attr, ObjAttr::full());

    let tree = obj.mappings();
    assert_eq!(tree.len(), 1);
    assert_eq!((tree[0].depth, tree[0].space_id, tree[0].va), (0, 1, 5));
}

#[test]
fn initial_mapping_out_of_range_fails() {
    let w = World::new();
    let a = w.task(1);
    let obj = Kobject::new(100, KobjectKind::Irq);
    let mut reap = ReapList::new();

    let end = (SLOTS_PER_DIR * CAPS_PER_PAGE) as u64;
    assert!(!w.mapper.map_obj_initially(&a, &obj, end, ObjAttr::full(), &mut reap));
    assert!(!obj.has_mappings());
}

#[test]
fn capabilities_derive_and_narrow_rights() {
    let w = World::new();
    let (a, b) = (w.task(1), w.task(2));
    let obj = Kobject::new(100, KobjectKind::IpcGate);
    let mut reap = ReapList::new();
    w.mapper.map_obj_initially(&a, &obj, 5, ObjAttr::full(), &mut reap);

    let err = w.mapper.fpage_map(
        &a,
        cap(5, Rights::CR | Rights::CW),
        &b,
        cap(7, Rights::FULL),
        MapItem::map(),
        &mut reap,
    );
    assert_eq!(err, L4Error::None);

    let slot = b.obj().lookup_cap(7).unwrap();
    assert!(Arc::ptr_eq(&slot.obj, &obj));
    assert_eq!(slot.attr.rights(), Rights::CR | Rights::CW);
    assert_eq!(slot.attr.extra(), ObjExtra::STRONG);

    let tree = obj.mappings();
    assert_eq!(tree.len(), 2);
    assert_eq!((tree[1].depth, tree[1].space_id, tree[1].va), (1, 2, 7));
}

#[test]
fn hot_spot_selects_the_receiving_slot() {
    let w = World::new();
    let (a, b) = (w.task(1), w.task(2));
    let obj = Kobject::new(100, KobjectKind::Thread);
    let mut reap = ReapList::new();
    w.mapper.map_obj_initially(&a, &obj, 3, ObjAttr::full(), &mut reap);

    let err = w.mapper.fpage_map(
        &a,
        cap(3, Rights::CR),
        &b,
        Fpage::obj(16, 4, Rights::FULL),
        MapItem::map().with_hot_spot(9, false),
        &mut reap,
    );
    assert_eq!(err, L4Error::None);
    assert!(b.obj().lookup_cap(25).is_some());
    assert_eq!(b.obj().len(), 1);
}

#[test]
fn weak_map_hands_out_the_restricted_twin() {
    let w = World::new();
    let (a, b) = (w.task(1), w.task(2));
    let weak = Kobject::new(101, KobjectKind::IpcGate);
    let strong = Kobject::with_restricted(100, KobjectKind::IpcGate, weak.clone());
    let mut reap = ReapList::new();
    w.mapper.map_obj_initially(&a, &strong, 0, ObjAttr::full(), &mut reap);

    let err = w.mapper.fpage_map(
        &a,
        cap(0, Rights::CR),
        &b,
        cap(3, Rights::FULL),
        MapItem::map().with_attr(1),
        &mut reap,
    );
    assert_eq!(err, L4Error::None);

    let slot = b.obj().lookup_cap(3).unwrap();
    assert!(Arc::ptr_eq(&slot.obj, &weak));
    assert_eq!(slot.attr.extra(), ObjExtra::empty());
    assert_eq!(strong.mappings().len(), 1);
    assert_eq!(weak.mappings().len(), 1);
}

#[test]
fn losing_the_last_capability_queues_the_object() {
    let w = World::new();
    let a = w.task(1);
    let obj = Kobject::new(100, KobjectKind::Factory);
    let mut reap = ReapList::new();
    w.mapper.map_obj_initially(&a, &obj, 2, ObjAttr::full(), &mut reap);

    w.mapper.fpage_unmap(&a, cap(2, Rights::FULL), MapMask::SELF_UNMAP, &mut reap);
    assert!(a.obj().lookup_cap(2).is_none());
    assert_eq!(reap.len(), 1);
    assert_eq!(obj.state(), Lifecycle::DeletionInitiated);
    assert!(!obj.is_live());

    assert_eq!(reap.reap(), 1);
    assert_eq!(obj.state(), Lifecycle::Destroyed);
}

#[test]
fn delete_right_revokes_every_capability() {
    let w = World::new();
    let (a, b, c) = (w.task(1), w.task(2), w.task(3));
    let obj = Kobject::new(100, KobjectKind::IpcGate);
    let mut reap = ReapList::new();
    w.mapper.map_obj_initially(&a, &obj, 1, ObjAttr::full(), &mut reap);
    w.mapper.fpage_map(&a, cap(1, Rights::FULL), &b, cap(1, Rights::FULL), MapItem::map(), &mut reap);
    w.mapper.fpage_map(&b, cap(1, Rights::CR), &c, cap(1, Rights::FULL), MapItem::map(), &mut reap);
    assert_eq!(obj.mappings().len(), 3);

    // B holds the delete right, derived from A.
    w.mapper.fpage_unmap(
        &b,
        cap(1, Rights::FULL),
        MapMask::SELF_UNMAP | MapMask::DO_DELETE,
        &mut reap,
    );
    assert!(a.obj().lookup_cap(1).is_none());
    assert!(b.obj().lookup_cap(1).is_none());
    assert!(c.obj().lookup_cap(1).is_none());
    assert!(!obj.has_mappings());
    assert_eq!(reap.len(), 1);
}

#[test]
fn narrowing_unmap_takes_the_delete_right() {
    let w = World::new();
    let (a, b) = (w.task(1), w.task(2));
    let obj = Kobject::new(100, KobjectKind::IpcGate);
    let mut reap = ReapList::new();
    w.mapper.map_obj_initially(&a, &obj, 5, ObjAttr::full(), &mut reap);
    w.mapper.fpage_map(&a, cap(5, Rights::FULL), &b, cap(7, Rights::FULL), MapItem::map(), &mut reap);
    assert_eq!(b.obj().lookup_cap(7).unwrap().attr.rights(), Rights::FULL);

    w.mapper.fpage_unmap(&a, cap(5, Rights::CD), MapMask::empty(), &mut reap);
    assert_eq!(
        b.obj().lookup_cap(7).unwrap().attr.rights(),
        Rights::CR | Rights::CW | Rights::CS
    );
    assert_eq!(a.obj().lookup_cap(5).unwrap().attr.rights(), Rights::FULL);

    // Without the delete right B can only drop its own capability.
    w.mapper.fpage_unmap(
        &b,
        cap(7, Rights::FULL),
        MapMask::SELF_UNMAP | MapMask::DO_DELETE,
        &mut reap,
    );
    assert!(b.obj().lookup_cap(7).is_none());
    assert!(a.obj().lookup_cap(5).is_some());
    assert_eq!(obj.mappings().len(), 1);
    assert!(reap.is_empty());
}

#[test]
fn self_unmap_without_delete_keeps_the_ancestors() {
    let w = World::new();
    let (a, b, c) = (w.task(1), w.task(2), w.task(3));
    let obj = Kobject::new(100, KobjectKind::IpcGate);
    let mut reap = ReapList::new();
    w.mapper.map_obj_initially(&a, &obj, 1, ObjAttr::full(), &mut reap);
    w.mapper.fpage_map(&a, cap(1, Rights::FULL), &b, cap(1, Rights::FULL), MapItem::map(), &mut reap);
    w.mapper.fpage_map(&b, cap(1, Rights::CR), &c, cap(1, Rights::FULL), MapItem::map(), &mut reap);

    w.mapper.fpage_unmap(&b, cap(1, Rights::FULL), MapMask::SELF_UNMAP, &mut reap);
    assert!(a.obj().lookup_cap(1).is_some());
    assert!(b.obj().lookup_cap(1).is_none());
    assert!(c.obj().lookup_cap(1).is_none());
    assert_eq!(obj.mappings().len(), 1);
    assert!(reap.is_empty());
}

#[test]
fn mapping_over_an_occupied_slot_replaces_it() {
    let w = World::new();
    let (a, b) = (w.task(1), w.task(2));
    let gate = Kobject::new(100, KobjectKind::IpcGate);
    let irq = Kobject::new(200, KobjectKind::Irq);
    let mut reap = ReapList::new();
    w.mapper.map_obj_initially(&a, &gate, 0, ObjAttr::full(), &mut reap);
    w.mapper.map_obj_initially(&b, &irq, 4, ObjAttr::full(), &mut reap);

    let err = w.mapper.fpage_map(&a, cap(0, Rights::CR), &b, cap(4, Rights::FULL), MapItem::map(), &mut reap);
    assert_eq!(err, L4Error::None);
    assert!(Arc::ptr_eq(&b.obj().lookup_cap(4).unwrap().obj, &gate));
    // B held the only capability to the interrupt.
    assert_eq!(reap.len(), 1);
    assert!(Arc::ptr_eq(reap.iter().next().unwrap(), &irq));
}
