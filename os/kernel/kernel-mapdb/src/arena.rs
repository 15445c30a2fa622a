//! Generational slab backing the nodes of a mapping tree.
//!
//! Slots are reused after removal; every reuse bumps the slot's generation so
//! a [`Handle`] to a removed node can never alias its successor.

use alloc::vec::Vec;

/// Typed reference to a node in an [`Arena`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn insert(&mut self, value: T) -> Handle {
        self.len += 1;
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let Slot::Vacant {
                generation,
                next_free,
            } = *slot
            else {
                unreachable!("free list points at an occupied slot");
            };
            self.free_head = next_free;
            let generation = generation.wrapping_add(1);
            *slot = Slot::Occupied { generation, value };
            return Handle { index, generation };
        }

        let Ok(index) = u32::try_from(self.slots.len()) else {
            panic!("mapping arena exhausted");
        };
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        Handle {
            index,
            generation: 0,
        }
    }

    /// Removes and returns the node.
    ///
    /// # Panics
    /// On a stale handle.
    pub(crate) fn remove(&mut self, h: Handle) -> T {
        let slot = &mut self.slots[h.index as usize];
        match slot {
            Slot::Occupied { generation, .. } if *generation == h.generation => {}
            _ => panic!("stale mapping handle {h:?}"),
        }
        let vacant = Slot::Vacant {
            generation: h.generation,
            next_free: self.free_head,
        };
        let Slot::Occupied { value, .. } = core::mem::replace(slot, vacant) else {
            unreachable!();
        };
        self.free_head = Some(h.index);
        self.len -= 1;
        value
    }

    #[inline]
    pub(crate) fn get(&self, h: Handle) -> &T {
        match self.slots.get(h.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == h.generation => value,
            _ => panic!("stale mapping handle {h:?}"),
        }
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, h: Handle) -> &mut T {
        match self.slots.get_mut(h.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == h.generation => value,
            _ => panic!("stale mapping handle {h:?}"),
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, h: Handle) -> bool {
        matches!(
            self.slots.get(h.index as usize),
            Some(Slot::Occupied { generation, .. }) if *generation == h.generation
        )
    }
}
