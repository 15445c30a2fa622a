use crate::mapping_tree::TreeNode;
use crate::space::Space;
use alloc::sync::{Arc, Weak};

/// One node of a derivation tree: `space` holds the frame at `va`.
///
/// A mapping does not keep its space alive. Spaces revoke their mappings
/// before they go away; finding a mapping whose space is gone is a kernel bug.
pub struct Mapping {
    space: Weak<Space>,
    va: u64,
}

impl Mapping {
    /// Bytes charged against the owning space per tree node.
    pub const QUOTA_SIZE: usize = size_of::<TreeNode>();

    pub(crate) fn new(space: &Arc<Space>, va: u64) -> Self {
        Self {
            space: Arc::downgrade(space),
            va,
        }
    }

    /// Owning space.
    ///
    /// # Panics
    /// If the space was dropped while still holding this mapping.
    #[must_use]
    pub fn space(&self) -> Arc<Space> {
        let Some(space) = self.space.upgrade() else {
            panic!("mapping at {:#x} outlived its space", self.va);
        };
        space
    }

    pub(crate) fn try_space(&self) -> Option<Arc<Space>> {
        self.space.upgrade()
    }

    #[inline]
    #[must_use]
    pub fn is_owned_by(&self, space: &Space) -> bool {
        core::ptr::eq(self.space.as_ptr(), space)
    }

    /// Virtual address of the mapped page, aligned to the page size of the
    /// tree level the node lives on.
    #[inline]
    #[must_use]
    pub const fn va(&self) -> u64 {
        self.va
    }

    pub(crate) fn reassign(&mut self, space: &Arc<Space>, va: u64) {
        self.space = Arc::downgrade(space);
        self.va = va;
    }
}

/// Snapshot of one mapping, for inspection and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingInfo {
    /// Derivation depth; children of the root owner have depth 0.
    pub depth: u8,
    pub space_id: u64,
    pub va: u64,
    /// log2 of the mapped page size.
    pub order: u32,
}
