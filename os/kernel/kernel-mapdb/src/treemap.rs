use crate::mapping::{Mapping, MappingInfo};
use crate::mapping_tree::{MappingTree, TreeCorruption};
use crate::space::Space;
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::ops::Range;
use kernel_sync::{HelpingLock, HelpingLockGuard};
use log::{debug, trace};

/// Subdivision of one frame into `key_end` smaller frames of
/// `2^page_shift` bytes (or ports, or slots) each.
///
/// The treemap's memory is charged to its owner: the space of the mapping
/// it hangs below, or the owner of the enclosing structure when it hangs
/// below the insertion head.
pub struct Treemap {
    owner: Weak<Space>,
    page_shift: u32,
    frames: Box<[MappingTree]>,
}

impl Treemap {
    /// Bytes charged for a treemap with `key_end` frames.
    #[must_use]
    pub const fn quota_size(key_end: usize) -> usize {
        size_of::<Self>() + key_end * size_of::<MappingTree>()
    }

    pub(crate) fn create(owner: &Arc<Space>, page_shift: u32, key_end: usize) -> Option<Box<Self>> {
        debug_assert!(key_end.is_power_of_two());
        if let Err(e) = owner.ram_quota().alloc(Self::quota_size(key_end)) {
            debug!("mapdb: cannot allocate submap for {owner}: {e}");
            return None;
        }
        trace!("mapdb: new submap of {key_end} frames at shift {page_shift} for {owner}");
        Some(Box::new(Self {
            owner: Arc::downgrade(owner),
            page_shift,
            frames: (0..key_end).map(|_| MappingTree::new()).collect(),
        }))
    }

    #[inline]
    #[must_use]
    pub const fn page_shift(&self) -> u32 {
        self.page_shift
    }

    #[inline]
    #[must_use]
    pub const fn key_end(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn owner(&self) -> Option<Arc<Space>> {
        self.owner.upgrade()
    }

    pub(crate) fn is_owned_by(&self, space: &Space) -> bool {
        core::ptr::eq(self.owner.as_ptr(), space)
    }

    /// Subframe index of `phys`.
    #[inline]
    #[must_use]
    pub fn key_of(&self, phys: u64) -> usize {
        // Masked to key_end, which is a usize.
        #[allow(clippy::cast_possible_truncation)]
        let key = ((phys >> self.page_shift) & (self.key_end() as u64 - 1)) as usize;
        key
    }

    #[inline]
    pub(crate) fn frame(&self, key: usize) -> &MappingTree {
        &self.frames[key]
    }

    #[inline]
    pub(crate) fn frame_mut(&mut self, key: usize) -> &mut MappingTree {
        &mut self.frames[key]
    }

    /// Whether `offs_begin..offs_end` spans every subframe.
    #[must_use]
    pub fn covered_by(&self, offs_begin: u64, offs_end: u64) -> bool {
        offs_begin == 0 && offs_end >= (self.key_end() as u64) << self.page_shift
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.iter().all(MappingTree::is_empty)
    }

    /// Subframes overlapping the range, with the range clipped to each.
    fn overlapping(&self, offs_begin: u64, offs_end: u64) -> impl Iterator<Item = (usize, Range<u64>)> {
        let shift = self.page_shift;
        let first = offs_begin >> shift;
        let last = offs_end
            .div_ceil(1 << shift)
            .min(self.key_end() as u64);
        (first..last).map(move |key| {
            let base = key << shift;
            let begin = offs_begin.saturating_sub(base);
            let end = (offs_end - base).min(1 << shift);
            // Bounded by key_end.
            #[allow(clippy::cast_possible_truncation)]
            let key = key as usize;
            (key, begin..end)
        })
    }

    /// Removes all mappings of the subframes overlapping the range. Head
    /// submaps of partly covered subframes are flushed recursively.
    pub(crate) fn flush(&mut self, offs_begin: u64, offs_end: u64) {
        let ranges: Vec<_> = self.overlapping(offs_begin, offs_end).collect();
        for (key, range) in ranges {
            self.frames[key].flush(None, false, range.start, range.end);
        }
    }

    pub(crate) fn for_each(&self, offs_begin: u64, offs_end: u64, f: &mut dyn FnMut(&Mapping, u32)) {
        for (key, range) in self.overlapping(offs_begin, offs_end) {
            self.frames[key].for_each_below(None, self.page_shift, range.start, range.end, f);
        }
    }

    /// Everything charged to the owner: this treemap and the submaps hanging
    /// directly below the insertion head of its frames.
    #[must_use]
    pub fn owned_size(&self) -> usize {
        Self::quota_size(self.key_end())
            + self
                .frames
                .iter()
                .map(MappingTree::head_submap_size)
                .sum::<usize>()
    }

    /// Hands the treemap and its head submaps to a new owner. The caller
    /// moves the quota.
    pub(crate) fn set_owner(&mut self, owner: &Arc<Space>) {
        self.owner = Arc::downgrade(owner);
        for frame in &mut self.frames {
            frame.set_head_submap_owner(owner);
        }
    }

    pub(crate) fn charged_by(&self, space: &Space) -> usize {
        self.frames.iter().map(|f| f.charged_by(space)).sum()
    }

    pub(crate) fn check(&self) -> Result<(), TreeCorruption> {
        self.frames.iter().try_for_each(MappingTree::check)
    }
}

impl Drop for Treemap {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.ram_quota().free(Self::quota_size(self.key_end()));
        }
    }
}

/// A lockable derivation tree: the top-level frames of a mapdb and the
/// mapping state of every kernel object.
///
/// Submaps below a base mappable are protected by its lock.
pub struct BaseMappable {
    tree: HelpingLock<MappingTree>,
}

impl Default for BaseMappable {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseMappable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tree: HelpingLock::new(MappingTree::new()),
        }
    }

    #[inline]
    pub fn lock(&self) -> HelpingLockGuard<'_, MappingTree> {
        self.tree.lock()
    }

    /// Mappings covering `phys`, submaps resolved, in derivation order.
    #[must_use]
    pub fn mappings_at(&self, shift: u32, phys: u64) -> Vec<MappingInfo> {
        let mut out = Vec::new();
        self.lock().collect(0, shift, phys, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::RamQuota;

    fn owner(limit: usize) -> Arc<Space> {
        Space::new(7, Arc::new(RamQuota::new(limit)), &crate::MapperConfig::default())
    }

    #[test]
    fn creation_charges_the_owner() {
        let o = owner(1 << 20);
        let t = Treemap::create(&o, 12, 512).unwrap();
        assert_eq!(o.ram_quota().used(), Treemap::quota_size(512));
        assert_eq!(t.owned_size(), Treemap::quota_size(512));
        drop(t);
        assert_eq!(o.ram_quota().used(), 0);
    }

    #[test]
    fn creation_fails_without_quota() {
        let o = owner(Treemap::quota_size(512) - 1);
        assert!(Treemap::create(&o, 12, 512).is_none());
        assert_eq!(o.ram_quota().used(), 0);
    }

    #[test]
    fn keys_and_coverage() {
        let o = owner(1 << 20);
        let t = Treemap::create(&o, 12, 512).unwrap();
        assert_eq!(t.key_of(0x20_3000), 3);
        assert_eq!(t.key_of(0x1fff), 1);
        assert!(t.covered_by(0, 0x20_0000));
        assert!(!t.covered_by(0x1000, 0x20_0000));
        assert!(!t.covered_by(0, 0x1f_f000));

        let keys: Vec<_> = t.overlapping(0x1800, 0x3800).collect();
        assert_eq!(keys, [(1, 0x800..0x1000), (2, 0..0x1000), (3, 0..0x800)]);
    }

    #[test]
    fn flush_clears_only_overlapping_frames() {
        let o = owner(1 << 20);
        let mut t = Treemap::create(&o, 12, 16).unwrap();
        for key in 0..4 {
            t.frame_mut(key)
                .allocate_mapping(&o, None, 0x1000 * key as u64)
                .unwrap();
        }
        t.flush(0x1000, 0x3000);
        let left: Vec<_> = (0..4).map(|k| t.frame(k).is_empty()).collect();
        assert_eq!(left, [false, true, true, false]);
        assert!(!t.is_empty());

        t.flush(0, 0x10_000);
        assert!(t.is_empty());
        assert_eq!(o.ram_quota().used(), Treemap::quota_size(16));
    }
}
