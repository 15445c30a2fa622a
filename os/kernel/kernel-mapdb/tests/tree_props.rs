//! Random map, grant and unmap sequences against the memory mapdb.
//!
//! After every step the trees must be well formed, every page a task holds
//! must be recorded, and each task's quota must be exactly what its page
//! tables and tree nodes hold. Tearing everything down must return every
//! byte.

mod common;

use common::World;
use kernel_l4_types::{Fpage, MapItem, MapMask, Rights};
use kernel_mapdb::{MapSpace, PageLookup, ReapList, Space};
use proptest::prelude::*;
use std::sync::Arc;

const BASE: u64 = 0x40_0000;
const SLOTS: u64 = 8;
const TASKS: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    /// sigma0 hands out a small page, or the superpage at `BASE`.
    FromSigma0 { to: usize, phys: u64, slot: u64, large: bool },
    Map { from: usize, to: usize, src: u64, dst: u64, grant: bool },
    Unmap { space: usize, slot: u64, large: bool, me_too: bool, full: bool },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..TASKS, 0..16_u64, 0..SLOTS, any::<bool>())
            .prop_map(|(to, phys, slot, large)| Op::FromSigma0 { to, phys, slot, large }),
        (0..TASKS, 0..TASKS, 0..SLOTS, 0..SLOTS, any::<bool>())
            .prop_map(|(from, to, src, dst, grant)| Op::Map { from, to, src, dst, grant }),
        (0..TASKS, 0..SLOTS, any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
            |(space, slot, large, me_too, full)| Op::Unmap { space, slot, large, me_too, full }
        ),
    ]
}

fn slot(n: u64) -> u64 {
    BASE + n * 0x1000
}

fn apply(w: &World, tasks: &[Arc<Space>], op: &Op, reap: &mut ReapList) {
    match *op {
        Op::FromSigma0 { to, phys, slot: s, large } => {
            let (snd, rcv) = if large {
                (
                    Fpage::mem(0x20_0000 * (1 + phys % 2), 21, Rights::RWX),
                    Fpage::mem(BASE, 21, Rights::RWX),
                )
            } else {
                (
                    Fpage::mem(phys * 0x1000, 12, Rights::RWX),
                    Fpage::mem(slot(s), 12, Rights::RWX),
                )
            };
            w.mapper.fpage_map(&w.sigma0, snd, &tasks[to], rcv, MapItem::map(), reap);
        }
        Op::Map { from, to, src, dst, grant } => {
            let control = if grant { MapItem::granting() } else { MapItem::map() };
            w.mapper.fpage_map(
                &tasks[from],
                Fpage::mem(slot(src), 12, Rights::RW),
                &tasks[to],
                Fpage::mem(slot(dst), 12, Rights::RWX),
                control,
                reap,
            );
        }
        Op::Unmap { space, slot: s, large, me_too, full } => {
            let rights = if full { Rights::FULL } else { Rights::W };
            let fp = if large {
                Fpage::mem(BASE, 21, rights)
            } else {
                Fpage::mem(slot(s), 12, rights)
            };
            let mask = if me_too { MapMask::SELF_UNMAP } else { MapMask::empty() };
            w.mapper.fpage_unmap(&tasks[space], fp, mask, reap);
        }
    }
}

fn check(w: &World, tasks: &[Arc<Space>]) -> Result<(), TestCaseError> {
    let db = w.mapper.mem_mapdb();
    prop_assert_eq!(db.check_invariants(), Ok(()));

    for task in tasks.iter().chain(std::iter::once(&w.sigma0)) {
        prop_assert_eq!(
            task.ram_quota().used(),
            task.mem().table_bytes() + db.charged_by(task),
            "quota of {} drifted",
            task
        );
    }

    for task in tasks {
        for n in 0..SLOTS {
            let PageLookup::Mapped(page) = task.mem().v_lookup(slot(n)) else {
                continue;
            };
            let va = slot(n) & !((1 << page.order) - 1);
            let recorded = db
                .mappings_of(page.phys)
                .iter()
                .any(|m| m.space_id == task.id() && m.va == va && m.order == page.order);
            prop_assert!(recorded, "{} holds {:#x} without a mapping", task, va);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn trees_and_quota_stay_consistent(ops in prop::collection::vec(arb_op(), 1..40)) {
        let w = World::new();
        let tasks: Vec<_> = (1..=TASKS as u64).map(|id| w.task(id)).collect();
        let mut reap = ReapList::new();

        for op in &ops {
            apply(&w, &tasks, op, &mut reap);
            check(&w, &tasks)?;
        }

        for task in &tasks {
            w.mapper.fpage_unmap(task, Fpage::mem(BASE, 21, Rights::FULL), MapMask::SELF_UNMAP, &mut reap);
        }
        prop_assert!(w.mapper.mem_mapdb().is_empty());
        for task in &tasks {
            prop_assert!(task.mem().is_empty());
            prop_assert_eq!(task.ram_quota().used(), 0);
        }
        prop_assert_eq!(w.sigma0.ram_quota().used(), 0);
        prop_assert!(reap.is_empty());
    }
}
