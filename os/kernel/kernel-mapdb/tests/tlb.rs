mod common;

use common::{Flush, World};
use kernel_l4_types::{Fpage, MapItem, MapMask, Rights};
use kernel_mapdb::ReapList;

fn page(addr: u64) -> Fpage {
    Fpage::mem(addr, 12, Rights::RW)
}

#[test]
fn map_flushes_the_receiver_where_it_runs() {
    let w = World::new();
    let (a, b) = (w.task(1), w.task(2));
    let mut reap = ReapList::new();

    w.mapper.fpage_map(&w.sigma0, page(0x1000), &a, page(0x1000), MapItem::map(), &mut reap);
    a.mark_active(1);
    b.mark_active(2);
    w.tlb().take();

    w.mapper.fpage_map(&a, page(0x1000), &b, page(0x2000), MapItem::map(), &mut reap);
    assert_eq!(w.tlb().take(), [Flush::Space { cpu: 2, space: 2 }]);

    w.mapper.fpage_unmap(&b, page(0x2000), MapMask::SELF_UNMAP, &mut reap);
    assert_eq!(w.tlb().take(), [Flush::Space { cpu: 2, space: 2 }]);
}

#[test]
fn grant_flushes_both_sides() {
    let w = World::new();
    let (a, c) = (w.task(1), w.task(3));
    let mut reap = ReapList::new();

    w.mapper.fpage_map(&w.sigma0, page(0x1000), &a, page(0x1000), MapItem::map(), &mut reap);
    a.mark_active(1);
    c.mark_active(3);
    w.tlb().take();

    w.mapper.fpage_map(&a, page(0x1000), &c, page(0x5000), MapItem::granting(), &mut reap);
    assert_eq!(
        w.tlb().take(),
        [
            Flush::Space { cpu: 1, space: 1 },
            Flush::Space { cpu: 1, space: 3 },
            Flush::Space { cpu: 3, space: 1 },
            Flush::Space { cpu: 3, space: 3 },
        ]
    );
}

#[test]
fn spaces_not_running_anywhere_need_no_flush() {
    let w = World::new();
    let a = w.task(1);
    let mut reap = ReapList::new();

    w.mapper.fpage_map(&w.sigma0, page(0x1000), &a, page(0x1000), MapItem::map(), &mut reap);
    w.mapper.fpage_unmap(&a, page(0x1000), MapMask::SELF_UNMAP, &mut reap);
    assert!(w.tlb().take().is_empty());
}

#[test]
fn wide_revocation_flushes_everything_once() {
    let w = World::new();
    let a = w.task(1);
    let mut reap = ReapList::new();
    w.mapper.fpage_map(&w.sigma0, page(0x1000), &a, page(0x1000), MapItem::map(), &mut reap);

    let children: Vec<_> = (0..6_u64)
        .map(|i| {
            let s = w.task(10 + i);
            w.mapper.fpage_map(&a, page(0x1000), &s, page(0x1000), MapItem::map(), &mut reap);
            s.mark_active(usize::try_from(i).unwrap());
            s
        })
        .collect();
    w.tlb().take();
    let calls = w.tlb().cross_cpu_calls();

    w.mapper.fpage_unmap(&a, Fpage::mem(0x1000, 12, Rights::FULL), MapMask::empty(), &mut reap);
    assert!(children.iter().all(|s| s.mem().is_empty()));
    assert_eq!(w.tlb().cross_cpu_calls(), calls + 1);
    assert_eq!(
        w.tlb().take(),
        (0..6).map(|cpu| Flush::All { cpu }).collect::<Vec<_>>()
    );
}
