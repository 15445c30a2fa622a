//! # Derivation trees
//!
//! A [`MappingTree`] records every mapping of one frame, in pre-order:
//!
//! ```text
//!   depth  0   1   1   2   0        A
//!          A   B   C   D   E       / \        E
//!                                 B   C
//!                                      \
//!                                       D
//! ```
//!
//! A node's subtree is the run of nodes after it whose depth is larger. The
//! root owner of the frame (sigma0 for physical memory, nobody for objects)
//! does not appear in the list; it is the *insertion head*, written as `None`
//! wherever a parent position is expected.
//!
//! ## Submaps
//!
//! When a part of a frame is mapped at a smaller page size, the finer
//! mappings go into a [`Treemap`] that subdivides the frame. The treemap is
//! stored as a node of its own and is always the *first child* of the mapping
//! it was split from, so [`MappingTree::find_submap`] is a single step.
//!
//! ## Quota
//!
//! Each node charges [`Mapping::QUOTA_SIZE`] to its payer: the owning space
//! of a mapping, or the owner of a submap. Dropping a node refunds it to the
//! same payer, so freeing never has to guess which space paid.

use crate::arena::{Arena, Handle};
use crate::config::DEPTH_MAX;
use crate::mapping::{Mapping, MappingInfo};
use crate::space::Space;
use crate::treemap::Treemap;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{debug, trace};

pub(crate) enum NodeKind {
    Mapping(Mapping),
    Submap(Box<Treemap>),
}

pub(crate) struct TreeNode {
    depth: u8,
    prev: Option<Handle>,
    next: Option<Handle>,
    kind: NodeKind,
}

impl TreeNode {
    fn payer(&self) -> Option<Arc<Space>> {
        match &self.kind {
            NodeKind::Mapping(m) => m.try_space(),
            NodeKind::Submap(t) => t.owner(),
        }
    }
}

impl Drop for TreeNode {
    fn drop(&mut self) {
        if let Some(payer) = self.payer() {
            payer.ram_quota().free(Mapping::QUOTA_SIZE);
        }
    }
}

/// A broken structural invariant found by [`MappingTree::check`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeCorruption {
    #[error("first node has depth {0}, expected 0")]
    RootDepth(u8),
    #[error("depth jumps from {previous} to {depth}")]
    DepthJump { previous: u8, depth: u8 },
    #[error("depth {0} exceeds the maximum")]
    DepthOverflow(u8),
    #[error("submap at depth {0} is not the first child of its parent")]
    MisplacedSubmap(u8),
    #[error("empty submap left in the tree")]
    EmptySubmap,
    #[error("node links are inconsistent")]
    BrokenLinks,
}

/// The mappings of one frame.
pub struct MappingTree {
    nodes: Arena<TreeNode>,
    head: Option<Handle>,
}

impl Default for MappingTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingTree {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: Arena::new(),
            head: None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of nodes, submaps included.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    #[must_use]
    pub const fn first(&self) -> Option<Handle> {
        self.head
    }

    #[inline]
    #[must_use]
    pub fn next(&self, h: Handle) -> Option<Handle> {
        self.nodes.get(h).next
    }

    #[inline]
    #[must_use]
    pub fn depth(&self, h: Handle) -> u8 {
        self.nodes.get(h).depth
    }

    /// The mapping stored at `h`, or `None` for a submap node.
    #[must_use]
    pub fn mapping(&self, h: Handle) -> Option<&Mapping> {
        match &self.nodes.get(h).kind {
            NodeKind::Mapping(m) => Some(m),
            NodeKind::Submap(_) => None,
        }
    }

    /// Pre-order walk over all node handles.
    #[must_use]
    pub const fn iter(&self) -> Iter<'_> {
        Iter {
            tree: self,
            cur: self.head,
        }
    }

    pub(crate) fn is_submap(&self, h: Handle) -> bool {
        matches!(self.nodes.get(h).kind, NodeKind::Submap(_))
    }

    pub(crate) fn submap(&self, h: Handle) -> &Treemap {
        match &self.nodes.get(h).kind {
            NodeKind::Submap(t) => t,
            NodeKind::Mapping(_) => panic!("node {h:?} is not a submap"),
        }
    }

    pub(crate) fn submap_mut(&mut self, h: Handle) -> &mut Treemap {
        match &mut self.nodes.get_mut(h).kind {
            NodeKind::Submap(t) => t,
            NodeKind::Mapping(_) => panic!("node {h:?} is not a submap"),
        }
    }

    fn child_depth(&self, parent: Option<Handle>) -> u8 {
        parent.map_or(0, |p| self.depth(p) + 1)
    }

    /// Adds a node below `parent` (`None`: below the insertion head).
    ///
    /// Mappings are placed after the parent's submap, submaps directly after
    /// the parent. Charges the payer and fails without side effects on quota
    /// exhaustion or when the derivation chain is already [`DEPTH_MAX`] deep.
    pub(crate) fn allocate(
        &mut self,
        payer: &Arc<Space>,
        parent: Option<Handle>,
        kind: NodeKind,
    ) -> Option<Handle> {
        let depth = self.child_depth(parent);
        if depth > DEPTH_MAX {
            debug!("mapdb: derivation chain of {payer} reached the depth limit");
            return None;
        }

        if let Err(e) = payer.ram_quota().alloc(Mapping::QUOTA_SIZE) {
            debug!("mapdb: cannot allocate mapping for {payer}: {e}");
            return None;
        }

        let after = match kind {
            NodeKind::Submap(_) => {
                debug_assert!(self.find_submap(parent).is_none());
                parent
            }
            NodeKind::Mapping(_) => self.find_submap(parent).or(parent),
        };

        let h = self.link_after(
            after,
            TreeNode {
                depth,
                prev: None,
                next: None,
                kind,
            },
        );
        trace!("mapdb: allocated node {h:?} at depth {depth}");
        Some(h)
    }

    pub(crate) fn allocate_mapping(
        &mut self,
        space: &Arc<Space>,
        parent: Option<Handle>,
        va: u64,
    ) -> Option<Handle> {
        self.allocate(space, parent, NodeKind::Mapping(Mapping::new(space, va)))
    }

    fn link_after(&mut self, pos: Option<Handle>, mut node: TreeNode) -> Handle {
        let next = match pos {
            Some(p) => self.nodes.get(p).next,
            None => self.head,
        };
        node.prev = pos;
        node.next = next;

        let h = self.nodes.insert(node);
        match pos {
            Some(p) => self.nodes.get_mut(p).next = Some(h),
            None => self.head = Some(h),
        }
        if let Some(n) = next {
            self.nodes.get_mut(n).prev = Some(h);
        }
        h
    }

    /// Removes one node and returns its successor.
    ///
    /// The quota goes back to the node's payer. Children are not touched;
    /// use [`flush`](Self::flush) to remove a whole subtree.
    pub(crate) fn free_mapping(&mut self, h: Handle) -> Option<Handle> {
        let (prev, next) = {
            let n = self.nodes.get(h);
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.nodes.get_mut(p).next = next,
            None => self.head = next,
        }
        if let Some(n) = next {
            self.nodes.get_mut(n).prev = prev;
        }

        let node = self.nodes.remove(h);
        trace!("mapdb: freed node {h:?} at depth {}", node.depth);
        next
    }

    /// The submap hanging below `parent`, if any.
    #[must_use]
    pub fn find_submap(&self, parent: Option<Handle>) -> Option<Handle> {
        let candidate = match parent {
            Some(p) => self.next(p)?,
            None => self.head?,
        };
        let node = self.nodes.get(candidate);
        (node.depth == self.child_depth(parent) && matches!(node.kind, NodeKind::Submap(_)))
            .then_some(candidate)
    }

    /// Logical parent of `h`; `None` if `h` hangs below the insertion head.
    #[must_use]
    pub fn parent_of(&self, h: Handle) -> Option<Handle> {
        let depth = self.depth(h);
        let mut cur = self.nodes.get(h).prev;
        while let Some(p) = cur {
            let node = self.nodes.get(p);
            if node.depth < depth {
                return Some(p);
            }
            cur = node.prev;
        }
        None
    }

    /// Finds the mapping of `space` at `va`, ignoring submaps.
    #[must_use]
    pub fn find(&self, space: &Space, va: u64) -> Option<Handle> {
        self.iter().find(|&h| {
            self.mapping(h)
                .is_some_and(|m| m.is_owned_by(space) && m.va() == va)
        })
    }

    /// Deletes the subtree below `parent`, and `parent` itself if `me_too`.
    ///
    /// `offs_begin..offs_end` is the flushed part of the frame. Mappings in
    /// the subtree always span the whole frame and are removed together with
    /// their submaps. The submap of `parent` itself is flushed recursively
    /// unless fully covered, and dropped once empty. With `me_too` it goes
    /// along with `parent`.
    pub(crate) fn flush(
        &mut self,
        parent: Option<Handle>,
        me_too: bool,
        offs_begin: u64,
        offs_end: u64,
    ) {
        let limit = parent.map(|p| self.depth(p));
        let own_submap = self
            .find_submap(parent)
            .filter(|&s| !me_too && !self.submap(s).covered_by(offs_begin, offs_end));
        let mut cur = match parent {
            Some(p) if me_too => Some(p),
            Some(p) => self.next(p),
            None => self.head,
        };
        let mut at_parent = me_too && parent.is_some();

        while let Some(h) = cur {
            let node = self.nodes.get(h);
            if !at_parent && limit.is_some_and(|d| node.depth <= d) {
                break;
            }
            at_parent = false;

            if own_submap == Some(h) {
                let next = node.next;
                let submap = self.submap_mut(h);
                submap.flush(offs_begin, offs_end);
                if submap.is_empty() {
                    self.free_mapping(h);
                }
                cur = next;
            } else {
                cur = self.free_mapping(h);
            }
        }
    }

    /// Calls `f` for every mapping below `parent` overlapping the range.
    ///
    /// `shift` is the page size of this tree's level; submaps report their
    /// own.
    pub(crate) fn for_each_below(
        &self,
        parent: Option<Handle>,
        shift: u32,
        offs_begin: u64,
        offs_end: u64,
        f: &mut dyn FnMut(&Mapping, u32),
    ) {
        let limit = parent.map(|p| self.depth(p));
        let mut cur = match parent {
            Some(p) => self.next(p),
            None => self.head,
        };
        while let Some(h) = cur {
            let node = self.nodes.get(h);
            if limit.is_some_and(|d| node.depth <= d) {
                break;
            }
            match &node.kind {
                NodeKind::Mapping(m) => f(m, shift),
                NodeKind::Submap(t) => t.for_each(offs_begin, offs_end, f),
            }
            cur = node.next;
        }
    }

    /// Moves mapping `h` to `new_space` at `new_va`, with its submap.
    ///
    /// The quota for the node and the submap moves to the new space. On
    /// exhaustion nothing changes and `false` is returned.
    pub(crate) fn grant(&mut self, h: Handle, new_space: &Arc<Space>, new_va: u64) -> bool {
        let old_space = match self.mapping(h) {
            Some(m) => m.space(),
            None => panic!("granting submap node {h:?}"),
        };
        let submap = self.find_submap(Some(h));
        let moved = Mapping::QUOTA_SIZE
            + submap.map_or(0, |s| Mapping::QUOTA_SIZE + self.submap(s).owned_size());

        if !Arc::ptr_eq(old_space.quota_handle(), new_space.quota_handle()) {
            if let Err(e) = new_space.ram_quota().alloc(moved) {
                debug!("mapdb: grant from {old_space} to {new_space} failed: {e}");
                return false;
            }
            old_space.ram_quota().free(moved);
        }

        if let NodeKind::Mapping(m) = &mut self.nodes.get_mut(h).kind {
            m.reassign(new_space, new_va);
        }
        if let Some(s) = submap {
            self.submap_mut(s).set_owner(new_space);
        }
        true
    }

    /// Quota held by the submap at the head of this tree, which belongs to
    /// the treemap's owner.
    pub(crate) fn head_submap_size(&self) -> usize {
        self.find_submap(None)
            .map_or(0, |s| Mapping::QUOTA_SIZE + self.submap(s).owned_size())
    }

    pub(crate) fn set_head_submap_owner(&mut self, owner: &Arc<Space>) {
        if let Some(s) = self.find_submap(None) {
            self.submap_mut(s).set_owner(owner);
        }
    }

    /// Quota this tree and its submaps charge to `space`.
    pub(crate) fn charged_by(&self, space: &Space) -> usize {
        self.iter()
            .map(|h| match &self.nodes.get(h).kind {
                NodeKind::Mapping(m) if m.is_owned_by(space) => Mapping::QUOTA_SIZE,
                NodeKind::Mapping(_) => 0,
                NodeKind::Submap(t) => {
                    let own = if t.is_owned_by(space) {
                        Mapping::QUOTA_SIZE + Treemap::quota_size(t.key_end())
                    } else {
                        0
                    };
                    own + t.charged_by(space)
                }
            })
            .sum()
    }

    /// Appends the mappings covering `phys` in pre-order.
    ///
    /// `base` is the derivation depth of this tree's insertion head children.
    pub(crate) fn collect(&self, base: u8, shift: u32, phys: u64, out: &mut Vec<MappingInfo>) {
        for h in self.iter() {
            let node = self.nodes.get(h);
            let depth = base + node.depth;
            match &node.kind {
                NodeKind::Mapping(m) => out.push(MappingInfo {
                    depth,
                    space_id: m.space().id(),
                    va: m.va(),
                    order: shift,
                }),
                NodeKind::Submap(t) => {
                    t.frame(t.key_of(phys))
                        .collect(depth, t.page_shift(), phys, out);
                }
            }
        }
    }

    /// Verifies the pre-order encoding, recursing into submaps.
    ///
    /// # Errors
    /// The first broken invariant found.
    pub fn check(&self) -> Result<(), TreeCorruption> {
        let mut previous: Option<(Handle, u8)> = None;
        for h in self.iter() {
            let node = self.nodes.get(h);
            if node.prev != previous.map(|(p, _)| p) {
                return Err(TreeCorruption::BrokenLinks);
            }
            if node.depth > DEPTH_MAX {
                return Err(TreeCorruption::DepthOverflow(node.depth));
            }
            match previous {
                None if node.depth != 0 => return Err(TreeCorruption::RootDepth(node.depth)),
                Some((_, prev_depth)) if node.depth > prev_depth + 1 => {
                    return Err(TreeCorruption::DepthJump {
                        previous: prev_depth,
                        depth: node.depth,
                    });
                }
                _ => {}
            }

            if let NodeKind::Submap(t) = &node.kind {
                let first_child = match previous {
                    None => node.depth == 0,
                    Some((p, prev_depth)) => {
                        prev_depth + 1 == node.depth && !self.is_submap(p)
                    }
                };
                if !first_child {
                    return Err(TreeCorruption::MisplacedSubmap(node.depth));
                }
                if t.is_empty() {
                    return Err(TreeCorruption::EmptySubmap);
                }
                t.check()?;
            }
            previous = Some((h, node.depth));
        }
        if self.iter().count() != self.len() {
            return Err(TreeCorruption::BrokenLinks);
        }
        Ok(())
    }
}

/// Pre-order iterator over the node handles of a [`MappingTree`].
pub struct Iter<'a> {
    tree: &'a MappingTree,
    cur: Option<Handle>,
}

impl Iterator for Iter<'_> {
    type Item = Handle;

    fn next(&mut self) -> Option<Handle> {
        let h = self.cur?;
        self.cur = self.tree.nodes.get(h).next;
        Some(h)
    }
}
