//! # Kernel objects and their mapping database
//!
//! Every kernel object carries its own derivation tree of capabilities. The
//! object that is mapped is the "physical page", the capability slot index
//! is the virtual address. Object trees have no submaps and no root owner:
//! the first capability, created together with the object, is a real node
//! at depth 0.

use crate::arena::Handle;
use crate::map_space::MapDb;
use crate::mapping::{Mapping, MappingInfo};
use crate::mapping_tree::MappingTree;
use crate::obj_space::ObjSpacePhys;
use crate::space::Space;
use crate::treemap::BaseMappable;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use kernel_sync::HelpingLockGuard;
use log::{debug, trace};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KobjectKind {
    Task,
    Thread,
    IpcGate,
    Irq,
    Factory,
}

/// Life cycle of a kernel object.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Live = 0,
    /// The last capability is gone; the object sits on a reap list.
    DeletionInitiated = 1,
    Destroyed = 2,
}

impl Lifecycle {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Live,
            1 => Self::DeletionInitiated,
            _ => Self::Destroyed,
        }
    }
}

pub struct Kobject {
    id: u64,
    kind: KobjectKind,
    mappable: BaseMappable,
    state: AtomicU8,
    /// What a weak capability to this object refers to.
    restricted: Option<Arc<Kobject>>,
}

impl Kobject {
    #[must_use]
    pub fn new(id: u64, kind: KobjectKind) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            mappable: BaseMappable::new(),
            state: AtomicU8::new(Lifecycle::Live as u8),
            restricted: None,
        })
    }

    /// An object whose weak capabilities refer to `restricted` instead.
    #[must_use]
    pub fn with_restricted(id: u64, kind: KobjectKind, restricted: Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            mappable: BaseMappable::new(),
            state: AtomicU8::new(Lifecycle::Live as u8),
            restricted: Some(restricted),
        })
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> KobjectKind {
        self.kind
    }

    #[must_use]
    pub fn state(&self) -> Lifecycle {
        Lifecycle::from_raw(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() == Lifecycle::Live
    }

    /// The object a capability without the strong bit refers to.
    #[must_use]
    pub fn downgrade(self: &Arc<Self>) -> Arc<Self> {
        self.restricted.clone().unwrap_or_else(|| self.clone())
    }

    pub(crate) const fn mappable(&self) -> &BaseMappable {
        &self.mappable
    }

    #[must_use]
    pub fn has_mappings(&self) -> bool {
        !self.mappable.lock().is_empty()
    }

    /// Capabilities referring to this object, in derivation order.
    #[must_use]
    pub fn mappings(&self) -> Vec<MappingInfo> {
        self.mappable.mappings_at(0, 0)
    }

    /// Moves a live object to deletion. Returns `false` if that already
    /// happened.
    pub(crate) fn initiate_deletion(&self) -> bool {
        let won = self
            .state
            .compare_exchange(
                Lifecycle::Live as u8,
                Lifecycle::DeletionInitiated as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            debug!("kobject {}: deletion initiated", self.id);
        }
        won
    }

    pub(crate) fn destroy(&self) {
        let prev = self.state.swap(Lifecycle::Destroyed as u8, Ordering::AcqRel);
        assert_eq!(
            prev,
            Lifecycle::DeletionInitiated as u8,
            "kobject {} destroyed without deletion",
            self.id
        );
        trace!("kobject {}: destroyed", self.id);
    }
}

impl PartialEq for Kobject {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Kobject {}

impl fmt::Debug for Kobject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kobject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A locked position in an object's capability tree.
pub struct ObjFrame<'a> {
    obj: &'a Arc<Kobject>,
    tree: HelpingLockGuard<'a, MappingTree>,
    node: Option<Handle>,
}

/// The object mapping database. Stateless: the trees live in the objects.
#[derive(Debug, Default, Copy, Clone)]
pub struct KobjectMapdb;

impl KobjectMapdb {
    /// Records the first capability of a fresh object.
    pub(crate) fn insert_root(obj: &Kobject, space: &Arc<Space>, index: u64) -> bool {
        let mut tree = obj.mappable().lock();
        debug_assert!(tree.is_empty(), "object {} is already mapped", obj.id());
        tree.allocate_mapping(space, None, index).is_some()
    }
}

impl MapDb<ObjSpacePhys> for KobjectMapdb {
    type Frame<'a>
        = ObjFrame<'a>
    where
        Self: 'a;

    fn valid_address(&self, _obj: &Arc<Kobject>) -> bool {
        true
    }

    fn lookup<'a>(
        &'a self,
        space: &Space,
        index: u64,
        obj: &'a Arc<Kobject>,
    ) -> Option<ObjFrame<'a>> {
        let tree = obj.mappable().lock();
        let node = tree.find(space, index)?;
        Some(ObjFrame {
            obj,
            tree,
            node: Some(node),
        })
    }

    fn check_for_upgrade<'a>(
        &'a self,
        r_obj: &'a Arc<Kobject>,
        from: &Space,
        snd_index: u64,
        to: &Space,
        rcv_index: u64,
    ) -> Option<ObjFrame<'a>> {
        let mut frame = self.lookup(to, rcv_index, r_obj)?;
        let parent = frame.tree.parent_of(frame.node?)?;
        let m = frame.tree.mapping(parent)?;
        if !(m.is_owned_by(from) && m.va() == snd_index) {
            return None;
        }
        frame.node = Some(parent);
        Some(frame)
    }

    fn insert(
        &self,
        frame: &mut ObjFrame<'_>,
        space: &Arc<Space>,
        index: u64,
        obj: &Arc<Kobject>,
        _order: u32,
    ) -> bool {
        if Arc::ptr_eq(obj, frame.obj) {
            return frame.tree.allocate_mapping(space, frame.node, index).is_some();
        }
        // A downgraded capability starts a derivation tree of the restricted
        // object; the restricted object's lock nests inside the original's.
        obj.mappable()
            .lock()
            .allocate_mapping(space, None, index)
            .is_some()
    }

    fn grant(&self, frame: &mut ObjFrame<'_>, space: &Arc<Space>, index: u64) -> bool {
        let Some(node) = frame.node else {
            return false;
        };
        frame.tree.grant(node, space, index)
    }

    fn flush(&self, frame: &mut ObjFrame<'_>, me_too: bool, _offs_begin: u64, _offs_end: u64) {
        frame.tree.flush(frame.node, me_too, 0, 1);
        if me_too {
            frame.node = None;
        }
    }

    fn foreach_mapping(
        &self,
        frame: &ObjFrame<'_>,
        _offs_begin: u64,
        _offs_end: u64,
        f: &mut dyn FnMut(&Mapping, u32),
    ) {
        frame.tree.for_each_below(frame.node, 0, 0, 1, f);
    }

    fn parent(&self, frame: &ObjFrame<'_>) -> Option<(Arc<Space>, u64)> {
        let parent = frame.tree.parent_of(frame.node?)?;
        let m = frame.tree.mapping(parent)?;
        Some((m.space(), m.va()))
    }

    fn is_root(&self, frame: &ObjFrame<'_>) -> bool {
        frame.node.is_none()
    }

    fn reanchor_root(&self, frame: &mut ObjFrame<'_>) {
        debug!("kobject {}: revoking every capability", frame.obj.id());
        frame.node = None;
    }
}
