//! # Mapping database for memory and I/O ports
//!
//! Physical memory is cut into top-level frames of `2^shifts[0]` bytes, each
//! a [`BaseMappable`] with its own lock. A frame mapped at a smaller page
//! size gets a [`Treemap`] submap at the next level, and so on down to the
//! smallest page order:
//!
//! ```text
//!  level 0 (1 GiB)  [frame 0] [frame 1] ...
//!                      |
//!                   A@30 ── submap(21) ── B@30
//!                              |
//!                         [0] [1] ... [511]
//!                              |
//!                           C@21 ── submap(12) ...
//! ```
//!
//! The mapdb owner (sigma0) holds every frame without a node of its own.
//! Submaps below nested frames are protected by the top-level frame lock.

use crate::arena::Handle;
use crate::config::MapperConfig;
use crate::io_space::IoSpace;
use crate::map_space::MapDb;
use crate::mapping::{Mapping, MappingInfo};
use crate::mapping_tree::{MappingTree, NodeKind, TreeCorruption};
use crate::mem_space::MemSpace;
use crate::space::Space;
use crate::treemap::{BaseMappable, Treemap};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_sync::HelpingLockGuard;
use log::{debug, trace};

/// One descent into a submap: the submap node and the subframe taken.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct PathStep {
    submap: Handle,
    key: usize,
}

/// A locked position in a top-level frame.
///
/// `node == None` with an empty path stands for the mapdb owner.
pub struct MapdbFrame<'a> {
    tree: HelpingLockGuard<'a, MappingTree>,
    path: Vec<PathStep>,
    node: Option<Handle>,
}

impl MapdbFrame<'_> {
    /// Level of the tree the frame points into.
    #[must_use]
    pub fn level(&self) -> usize {
        self.path.len()
    }
}

/// Where the derivation parent of a node lives.
enum Parent {
    /// The mapdb owner.
    Root,
    Node { path: Vec<PathStep>, node: Handle },
}

fn tree_at<'t>(root: &'t MappingTree, path: &[PathStep]) -> &'t MappingTree {
    path.iter()
        .fold(root, |tree, step| tree.submap(step.submap).frame(step.key))
}

fn tree_at_mut<'t>(root: &'t mut MappingTree, path: &[PathStep]) -> &'t mut MappingTree {
    path.iter().fold(root, |tree, step| {
        tree.submap_mut(step.submap).frame_mut(step.key)
    })
}

fn find_in(
    tree: &MappingTree,
    space: &Space,
    va: u64,
    phys: u64,
    path: &mut Vec<PathStep>,
) -> Option<Handle> {
    for h in tree.iter() {
        if let Some(m) = tree.mapping(h) {
            if m.is_owned_by(space) && m.va() == va {
                return Some(h);
            }
            continue;
        }
        let sub = tree.submap(h);
        let key = sub.key_of(phys);
        path.push(PathStep { submap: h, key });
        if let Some(found) = find_in(sub.frame(key), space, va, phys, path) {
            return Some(found);
        }
        path.pop();
    }
    None
}

fn parent_of(root: &MappingTree, path: &[PathStep], node: Handle) -> Parent {
    let mut path = path.to_vec();
    let mut cur = node;
    loop {
        if let Some(parent) = tree_at(root, &path).parent_of(cur) {
            return Parent::Node { path, node: parent };
        }
        // Top of a subframe: continue at the submap in the enclosing tree.
        let Some(step) = path.pop() else {
            return Parent::Root;
        };
        cur = step.submap;
    }
}

/// Drops empty submaps along `path`, innermost first.
fn prune(root: &mut MappingTree, path: &[PathStep]) {
    for i in (0..path.len()).rev() {
        let step = path[i];
        let tree = tree_at_mut(root, &path[..i]);
        if !tree.submap(step.submap).is_empty() {
            break;
        }
        trace!("mapdb: dropping empty submap at level {}", i + 1);
        tree.free_mapping(step.submap);
    }
}

#[inline]
const fn align_down(addr: u64, shift: u32) -> u64 {
    addr & !((1 << shift) - 1)
}

/// Mapping database of one physical resource (memory or I/O ports).
pub struct Mapdb {
    owner: Arc<Space>,
    shifts: &'static [u32],
    frames: Box<[BaseMappable]>,
}

impl Mapdb {
    /// A mapdb over `2^bits` units, with levels at `shifts` (largest first).
    ///
    /// # Panics
    /// If `shifts` is empty or its top level exceeds `bits`.
    #[must_use]
    pub fn new(owner: Arc<Space>, bits: u32, shifts: &'static [u32]) -> Self {
        let top = shifts[0];
        assert!(top <= bits, "top mapdb level {top} exceeds {bits} address bits");
        let count = 1_usize << (bits - top);
        debug!("mapdb: {count} top-level frames of order {top}, levels {shifts:?}");
        Self {
            owner,
            shifts,
            frames: (0..count).map(|_| BaseMappable::new()).collect(),
        }
    }

    /// The memory mapdb described by `config`.
    #[must_use]
    pub fn for_memory(owner: Arc<Space>, config: &MapperConfig) -> Self {
        Self::new(owner, config.phys_bits, config.mem_shifts)
    }

    /// The I/O port mapdb described by `config`.
    #[must_use]
    pub fn for_io(owner: Arc<Space>, config: &MapperConfig) -> Self {
        Self::new(owner, crate::config::IO_PORT_BITS, config.io_shifts)
    }

    #[must_use]
    pub fn owner(&self) -> &Arc<Space> {
        &self.owner
    }

    #[must_use]
    pub fn shifts(&self) -> &[u32] {
        self.shifts
    }

    fn top_index(&self, phys: u64) -> Option<usize> {
        let index = usize::try_from(phys >> self.shifts[0]).ok()?;
        (index < self.frames.len()).then_some(index)
    }

    fn is_owner(&self, space: &Space) -> bool {
        core::ptr::eq(Arc::as_ptr(&self.owner), space)
    }

    fn level_of(&self, order: u32) -> Option<usize> {
        self.shifts.iter().position(|&s| s == order)
    }

    fn valid(&self, phys: u64) -> bool {
        self.top_index(phys).is_some()
    }

    fn locate(&self, space: &Space, va: u64, phys: u64) -> Option<MapdbFrame<'_>> {
        let top = self.top_index(phys)?;
        let tree = self.frames[top].lock();
        if self.is_owner(space) {
            return Some(MapdbFrame {
                tree,
                path: Vec::new(),
                node: None,
            });
        }
        let mut path = Vec::new();
        let node = find_in(&tree, space, va, phys, &mut path)?;
        Some(MapdbFrame {
            tree,
            path,
            node: Some(node),
        })
    }

    fn upgrade_frame(
        &self,
        r_phys: u64,
        from: &Space,
        snd_va: u64,
        to: &Space,
        rcv_va: u64,
    ) -> Option<MapdbFrame<'_>> {
        let mut frame = self.locate(to, rcv_va, r_phys)?;
        let node = frame.node?;
        match parent_of(&frame.tree, &frame.path, node) {
            Parent::Root if self.is_owner(from) => {
                frame.path.clear();
                frame.node = None;
                Some(frame)
            }
            Parent::Root => None,
            Parent::Node { path, node } => {
                let shift = self.shifts[path.len()];
                let m = tree_at(&frame.tree, &path).mapping(node)?;
                if !(m.is_owned_by(from) && m.va() == align_down(snd_va, shift)) {
                    return None;
                }
                frame.path = path;
                frame.node = Some(node);
                Some(frame)
            }
        }
    }

    /// Owner of a submap created below `anchor` in the tree at `path`.
    fn submap_owner(
        &self,
        root: &MappingTree,
        path: &[PathStep],
        anchor: Option<Handle>,
    ) -> Option<Arc<Space>> {
        let tree = tree_at(root, path);
        if let Some(a) = anchor {
            return tree.mapping(a).map(Mapping::space);
        }
        match path.split_last() {
            None => Some(self.owner.clone()),
            Some((last, outer)) => tree_at(root, outer).submap(last.submap).owner(),
        }
    }

    fn insert_at(
        &self,
        frame: &mut MapdbFrame<'_>,
        space: &Arc<Space>,
        va: u64,
        phys: u64,
        order: u32,
    ) -> bool {
        let Some(target) = self.level_of(order) else {
            debug!("mapdb: order {order} is not a mapdb level");
            return false;
        };
        let level = frame.path.len();
        if target < level {
            debug!("mapdb: cannot insert order {order} above level {level}");
            return false;
        }

        let mut path = frame.path.clone();
        let mut anchor = frame.node;
        let mut created = Vec::new();
        for l in level..target {
            let existing = tree_at(&frame.tree, &path).find_submap(anchor);
            let submap = match existing {
                Some(s) => s,
                None => {
                    let Some(owner) = self.submap_owner(&frame.tree, &path, anchor) else {
                        break;
                    };
                    let shift = self.shifts[l + 1];
                    let key_end = 1_usize << (self.shifts[l] - shift);
                    let Some(tm) = Treemap::create(&owner, shift, key_end) else {
                        break;
                    };
                    let tree = tree_at_mut(&mut frame.tree, &path);
                    let Some(s) = tree.allocate(&owner, anchor, NodeKind::Submap(tm)) else {
                        break;
                    };
                    created.push(path.len());
                    s
                }
            };
            let key = tree_at(&frame.tree, &path).submap(submap).key_of(phys);
            path.push(PathStep { submap, key });
            anchor = None;
        }

        if path.len() == target
            && tree_at_mut(&mut frame.tree, &path)
                .allocate_mapping(space, anchor, va)
                .is_some()
        {
            return true;
        }

        // Undo the submaps made for this insert, innermost first.
        for &depth in created.iter().rev() {
            let step = path[depth];
            let tree = tree_at_mut(&mut frame.tree, &path[..depth]);
            if tree.submap(step.submap).is_empty() {
                tree.free_mapping(step.submap);
            }
        }
        false
    }

    fn grant_at(frame: &mut MapdbFrame<'_>, space: &Arc<Space>, va: u64) -> bool {
        let Some(node) = frame.node else {
            return false;
        };
        tree_at_mut(&mut frame.tree, &frame.path).grant(node, space, va)
    }

    fn flush_at(frame: &mut MapdbFrame<'_>, me_too: bool, offs_begin: u64, offs_end: u64) {
        tree_at_mut(&mut frame.tree, &frame.path).flush(frame.node, me_too, offs_begin, offs_end);
        prune(&mut frame.tree, &frame.path);
        if me_too {
            frame.node = None;
        }
    }

    fn foreach_at(
        &self,
        frame: &MapdbFrame<'_>,
        offs_begin: u64,
        offs_end: u64,
        f: &mut dyn FnMut(&Mapping, u32),
    ) {
        let shift = self.shifts[frame.path.len()];
        tree_at(&frame.tree, &frame.path).for_each_below(frame.node, shift, offs_begin, offs_end, f);
    }

    fn parent_at(frame: &MapdbFrame<'_>) -> Option<(Arc<Space>, u64)> {
        let node = frame.node?;
        match parent_of(&frame.tree, &frame.path, node) {
            Parent::Root => None,
            Parent::Node { path, node } => {
                let m = tree_at(&frame.tree, &path).mapping(node)?;
                Some((m.space(), m.va()))
            }
        }
    }

    /// Mappings covering `phys`, in derivation order.
    #[must_use]
    pub fn mappings_of(&self, phys: u64) -> Vec<MappingInfo> {
        self.top_index(phys)
            .map_or_else(Vec::new, |top| self.frames[top].mappings_at(self.shifts[0], phys))
    }

    /// Quota the trees charge to `space`.
    #[must_use]
    pub fn charged_by(&self, space: &Space) -> usize {
        self.frames.iter().map(|f| f.lock().charged_by(space)).sum()
    }

    /// Whether no frame holds a mapping.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.iter().all(|f| f.lock().is_empty())
    }

    /// Verifies every tree.
    ///
    /// # Errors
    /// The first broken invariant found.
    pub fn check_invariants(&self) -> Result<(), TreeCorruption> {
        self.frames.iter().try_for_each(|f| f.lock().check())
    }
}

macro_rules! impl_mapdb {
    ($store:ty) => {
        impl MapDb<$store> for Mapdb {
            type Frame<'a>
                = MapdbFrame<'a>
            where
                Self: 'a;

            fn valid_address(&self, phys: &u64) -> bool {
                self.valid(*phys)
            }

            fn lookup<'a>(
                &'a self,
                space: &Space,
                va: u64,
                phys: &'a u64,
            ) -> Option<MapdbFrame<'a>> {
                self.locate(space, va, *phys)
            }

            fn check_for_upgrade<'a>(
                &'a self,
                r_phys: &'a u64,
                from: &Space,
                snd_va: u64,
                to: &Space,
                rcv_va: u64,
            ) -> Option<MapdbFrame<'a>> {
                self.upgrade_frame(*r_phys, from, snd_va, to, rcv_va)
            }

            fn insert(
                &self,
                frame: &mut MapdbFrame<'_>,
                space: &Arc<Space>,
                va: u64,
                phys: &u64,
                order: u32,
            ) -> bool {
                self.insert_at(frame, space, va, *phys, order)
            }

            fn grant(&self, frame: &mut MapdbFrame<'_>, space: &Arc<Space>, va: u64) -> bool {
                Self::grant_at(frame, space, va)
            }

            fn flush(&self, frame: &mut MapdbFrame<'_>, me_too: bool, offs_begin: u64, offs_end: u64) {
                Self::flush_at(frame, me_too, offs_begin, offs_end);
            }

            fn foreach_mapping(
                &self,
                frame: &MapdbFrame<'_>,
                offs_begin: u64,
                offs_end: u64,
                f: &mut dyn FnMut(&Mapping, u32),
            ) {
                self.foreach_at(frame, offs_begin, offs_end, f);
            }

            fn parent(&self, frame: &MapdbFrame<'_>) -> Option<(Arc<Space>, u64)> {
                Self::parent_at(frame)
            }

            fn is_root(&self, frame: &MapdbFrame<'_>) -> bool {
                frame.path.is_empty() && frame.node.is_none()
            }
        }
    };
}

impl_mapdb!(MemSpace);
impl_mapdb!(IoSpace);
