//! # Generic map and unmap
//!
//! Both algorithms walk a range page by page in lock step between sender and
//! receiver. Each page is handled under the frame lock of its mapping tree,
//! which is released before the next page; a call never holds two frame
//! locks at once.

use crate::map_space::{InsertStatus, MapDb, MapSpace, MapTraits, Page, PageLookup};
use crate::reap::ReapList;
use crate::space::Space;
use crate::tlb::TlbAccumulator;
use alloc::sync::Arc;
use core::ops::Range;
use kernel_l4_types::{AccessFlags, L4Error, MapMask, Rights};
use log::{debug, warn};

/// Why a map call did not map everything it was asked to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("out of kernel memory or quota")]
    MapFailed,
    #[error("nothing mapped: the source range is not backed")]
    EmptyMap,
    #[error("a space involved is being destroyed")]
    DeadSpace,
}

impl From<MapError> for L4Error {
    fn from(e: MapError) -> Self {
        match e {
            MapError::MapFailed | MapError::DeadSpace => Self::MapFailed,
            MapError::EmptyMap => Self::EmptyMap,
        }
    }
}

/// Error code of a whole map call.
#[must_use]
pub fn l4_error(result: Result<(), MapError>) -> L4Error {
    result.map_or_else(L4Error::from, |()| L4Error::None)
}

/// Bytes (ports, slots) covered by a page of `order`.
#[inline]
#[must_use]
pub const fn page_size(order: u32) -> u64 {
    if order >= u64::BITS { u64::MAX } else { 1 << order }
}

#[inline]
#[must_use]
pub const fn page_start(addr: u64, order: u32) -> u64 {
    if order >= u64::BITS { 0 } else { addr & !((1 << order) - 1) }
}

#[inline]
#[must_use]
pub const fn subpage_offset(addr: u64, order: u32) -> u64 {
    addr - page_start(addr, order)
}

/// Places the send window inside the receive window at the hot spot.
///
/// A larger receive window takes the send window at the hot spot, rounded
/// down to the send size. A smaller one narrows the send window to the
/// receive-sized block containing the hot spot.
pub fn free_constraint(
    snd_addr: &mut u64,
    snd_order: &mut u32,
    rcv_addr: &mut u64,
    rcv_order: u32,
    hot_spot: u64,
) {
    if rcv_order >= *snd_order {
        let within = subpage_offset(hot_spot, rcv_order);
        *rcv_addr = rcv_addr.saturating_add(page_start(within, *snd_order));
    } else {
        let within = subpage_offset(hot_spot, *snd_order);
        *snd_addr = snd_addr.saturating_add(page_start(within, rcv_order));
        *snd_order = rcv_order;
    }
}

/// One map request in store units.
#[derive(Debug, Clone)]
pub struct MapRange<'s, A> {
    pub from: &'s Arc<Space>,
    pub snd_addr: u64,
    pub snd_size: u64,
    pub to: &'s Arc<Space>,
    pub rcv_addr: u64,
    /// Move instead of copy.
    pub grant: bool,
    /// Requested attributes; the result never exceeds the sender's.
    pub attribs: A,
}

/// Largest receiver order for the chunk starting from `order`, and whether
/// it had to shrink. `None` if not even the smallest page fits.
fn fit_order<S: MapSpace>(
    dst: &S,
    mut order: u32,
    snd_addr: u64,
    snd_size: u64,
    rcv_addr: u64,
    rcv_end: u64,
    r_order: u32,
) -> Option<(u32, bool)> {
    let fits = |o: u32| {
        page_size(o) <= snd_size
            && o <= r_order
            && subpage_offset(snd_addr, o) == 0
            && subpage_offset(rcv_addr, o) == 0
            && rcv_addr.saturating_add(page_size(o)) <= rcv_end
    };
    let mut shrunk = false;
    while !fits(order) {
        if order <= dst.min_order() {
            return None;
        }
        order = dst.fitting_order(order - 1);
        shrunk = true;
    }
    Some((order, shrunk))
}

/// Maps (or grants) `req.snd_size` units from `req.from` to `req.to`.
///
/// Chunks are mapped at the largest page size both sides allow. The call
/// stops at the first chunk that runs out of memory; earlier chunks stay
/// mapped.
///
/// # Errors
/// [`MapError::MapFailed`] if a chunk ran out of memory or quota,
/// [`MapError::EmptyMap`] if no part of the source range was backed.
#[allow(clippy::too_many_lines)]
pub fn map<S, D, T>(
    mapdb: &D,
    req: MapRange<'_, S::Attr>,
    tlb: &mut T,
    reap: &mut ReapList,
) -> Result<(), MapError>
where
    S: MapTraits,
    D: MapDb<S>,
    T: TlbAccumulator,
{
    let MapRange {
        from,
        mut snd_addr,
        mut snd_size,
        to,
        mut rcv_addr,
        mut grant,
        attribs,
    } = req;
    let src = S::of(from);
    let dst = S::of(to);

    let rcv_end = rcv_addr.saturating_add(snd_size);
    let to_max = dst.map_max_address();
    let from_max = src.map_max_address();
    let mut backed = false;
    let mut result = Ok(());

    'pages: while snd_size != 0 && rcv_addr < to_max && snd_addr < from_max {
        let size = 'chunk: {
            let (s_phys, s_order, s_attr) = match src.v_fabricate(snd_addr) {
                PageLookup::Mapped(Page { phys, order, attr }) => (phys, order, attr),
                PageLookup::Hole { order } => {
                    let rest = page_size(order) - subpage_offset(snd_addr, order);
                    if rest >= snd_size {
                        break 'pages;
                    }
                    break 'chunk rest;
                }
            };
            backed = true;

            let page_offset = subpage_offset(snd_addr, s_order);
            if Arc::ptr_eq(from, to) && snd_addr == rcv_addr {
                debug!("map ({}): {from} maps {snd_addr:#x} onto itself", S::NAME);
                break 'chunk (page_size(s_order) - page_offset).min(snd_size);
            }

            let mut i_phys = S::subpage(&s_phys, page_offset);
            let receiver = dst.v_lookup(rcv_addr);
            let r_order = receiver.order();
            let Some((i_order, shrunk)) = fit_order(
                dst,
                dst.fitting_order(s_order),
                snd_addr,
                snd_size,
                rcv_addr,
                rcv_end,
                r_order,
            ) else {
                debug!("map ({}): no page order fits at {rcv_addr:#x}", S::NAME);
                break 'pages;
            };
            let i_size = page_size(i_order);
            if grant && shrunk {
                warn!(
                    "map ({}): cannot grant part of a superpage ({from}: {snd_addr:#x} -> {to}: {rcv_addr:#x}), demoting to map",
                    S::NAME
                );
                grant = false;
            }

            let s_valid = mapdb.valid_address(&s_phys);
            let mut frame = None;

            if let PageLookup::Mapped(r_page) = &receiver {
                if !grant
                    && r_page.order <= i_order
                    && S::same_page(&r_page.phys, &i_phys, i_order)
                    && s_valid
                {
                    frame = mapdb.check_for_upgrade(&r_page.phys, from, snd_addr, to, rcv_addr);
                }
                if frame.is_none() {
                    let r_start = page_start(rcv_addr, r_order);
                    unmap::<S, D, T>(
                        mapdb,
                        to,
                        r_start..r_start.saturating_add(page_size(r_order)),
                        Rights::FULL,
                        MapMask::SELF_UNMAP,
                        tlb,
                        reap,
                    );
                }
            }

            if s_valid && frame.is_none() {
                frame = mapdb.lookup(from, page_start(snd_addr, s_order), &s_phys);
                if frame.is_none() {
                    debug!("map ({}): sender mapping at {snd_addr:#x} vanished", S::NAME);
                    break 'chunk i_size;
                }
            }

            if grant && frame.as_ref().is_some_and(|f| mapdb.is_root(f)) {
                warn!(
                    "map ({}): cannot grant from the root owner {from}, demoting to map",
                    S::NAME
                );
                grant = false;
            }

            if !S::is_mappable(&i_phys) {
                debug!("map ({}): object at {snd_addr:#x} is being deleted", S::NAME);
                break 'chunk i_size;
            }

            let i_attr = S::apply_attribs(s_attr, &mut i_phys, attribs);
            let status = dst.v_insert(i_phys.clone(), rcv_addr, i_order, i_attr);
            debug!(
                "map ({}): {from}:{snd_addr:#x} -> {to}:{rcv_addr:#x} order {i_order}: {status:?}",
                S::NAME
            );

            match status {
                InsertStatus::Ok | InsertStatus::WarnExists | InsertStatus::WarnAttribUpgrade => {
                    if grant {
                        if s_valid && !frame.as_mut().is_some_and(|f| mapdb.grant(f, to, rcv_addr)) {
                            dst.v_delete(rcv_addr, i_order, Rights::FULL);
                            tlb.add_page(to, rcv_addr, i_order);
                            result = Err(MapError::MapFailed);
                            break 'pages;
                        }
                        let s_page = page_start(snd_addr, s_order);
                        src.v_delete(s_page, s_order, Rights::FULL);
                        tlb.add_page(from, s_page, s_order);
                    } else if status == InsertStatus::Ok
                        && s_valid
                        && !frame
                            .as_mut()
                            .is_some_and(|f| mapdb.insert(f, to, rcv_addr, &i_phys, i_order))
                    {
                        dst.v_delete(rcv_addr, i_order, Rights::FULL);
                        tlb.add_page(to, rcv_addr, i_order);
                        result = Err(MapError::MapFailed);
                        break 'pages;
                    }
                    tlb.add_page(to, rcv_addr, i_order);
                }
                InsertStatus::ErrNomem => {
                    result = Err(MapError::MapFailed);
                    break 'pages;
                }
                InsertStatus::ErrExists => {
                    warn!(
                        "map ({}) skipping area {from}:{snd_addr:#x} -> {to}:{rcv_addr:#x} ({i_size:#x})",
                        S::NAME
                    );
                }
            }
            i_size
        };

        rcv_addr = rcv_addr.saturating_add(size);
        snd_addr = snd_addr.saturating_add(size);
        snd_size = snd_size.saturating_sub(size);
    }

    result?;
    if !backed {
        warn!(
            "nothing mapped: ({}) from {from}:{snd_addr:#x} to {to}",
            S::NAME
        );
        return Err(MapError::EmptyMap);
    }
    Ok(())
}

/// Removes `rights` from the mappings derived from `space`'s pages in
/// `range`, and from `space` itself with [`MapMask::SELF_UNMAP`].
///
/// Revoking read access removes mappings; anything less only narrows them.
/// Returns the access flags collected from every touched entry.
pub fn unmap<S, D, T>(
    mapdb: &D,
    space: &Arc<Space>,
    range: Range<u64>,
    rights: Rights,
    mask: MapMask,
    tlb: &mut T,
    reap: &mut ReapList,
) -> AccessFlags
where
    S: MapTraits,
    D: MapDb<S>,
    T: TlbAccumulator,
{
    let store = S::of(space);
    let me_too = mask.self_unmap();
    let full_flush = rights.is_full_flush();
    let map_max = store.map_max_address();

    let mut flushed = AccessFlags::empty();
    let mut address = range.start;
    let mut end = range.end;

    while address < end && address < map_max {
        let lookup = store.v_fabricate(address);
        let order = lookup.order();
        let page = page_start(address, order);
        let next = page.saturating_add(page_size(order));

        let PageLookup::Mapped(Page { phys, attr, .. }) = lookup else {
            address = next;
            continue;
        };

        if me_too {
            // Never flush part of a page the caller holds.
            address = page;
            end = end.max(next);
        }

        let Some(mut frame) = mapdb.lookup(space, page, &phys) else {
            debug!("unmap ({}): {space}:{page:#x} unmapped concurrently", S::NAME);
            address = next;
            continue;
        };

        if full_flush && S::revokes_all(attr, mask) {
            mapdb.reanchor_root(&mut frame);
        }

        let mut page_flags = AccessFlags::empty();
        if me_too {
            page_flags |= store.v_delete(address, order, rights);
            tlb.add_page(space, address, order);
        }

        let offs_begin = address - page;
        let offs_end = end.min(next) - page;
        mapdb.foreach_mapping(&frame, offs_begin, offs_end, &mut |m, m_order| {
            let child = m.space();
            page_flags |= S::of(&child).v_delete(m.va(), m_order, rights);
            tlb.add_page(&child, m.va(), m_order);
        });
        flushed |= page_flags;

        let accessed = page_flags & (AccessFlags::REFERENCED | AccessFlags::DIRTY);
        if !accessed.is_empty() {
            match mapdb.parent(&frame) {
                Some((parent, va)) if me_too => S::of(&parent).v_set_access_flags(va, accessed),
                _ => store.v_set_access_flags(page, accessed),
            }
        }

        if full_flush {
            mapdb.flush(&mut frame, me_too, offs_begin, offs_end);
            drop(frame);
            if S::free_object(&phys, reap) {
                debug!("unmap ({}): last mapping of {phys:?} gone", S::NAME);
            }
        }

        address = next;
    }
    flushed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapperConfig;
    use crate::quota::RamQuota;

    #[test]
    fn hot_spot_places_small_send_window_in_large_receive_window() {
        let (mut snd, mut so, mut rcv) = (0x1_0000, 12, 0x40_0000);
        free_constraint(&mut snd, &mut so, &mut rcv, 21, 0x1234_5678);
        assert_eq!((snd, so, rcv), (0x1_0000, 12, 0x40_0000 + 0x14_5000));
    }

    #[test]
    fn hot_spot_narrows_large_send_window() {
        let (mut snd, mut so, mut rcv) = (0x20_0000, 21, 0x9000);
        free_constraint(&mut snd, &mut so, &mut rcv, 12, 0x3456);
        assert_eq!((snd, so, rcv), (0x20_3000, 12, 0x9000));
    }

    #[test]
    fn fit_order_reports_shrinking() {
        let space = Space::new(1, Arc::new(RamQuota::unlimited()), &MapperConfig::default());
        let mem = space.mem();
        // A whole superpage into a free superpage slot.
        assert_eq!(
            fit_order(mem, 21, 0x20_0000, 0x20_0000, 0x40_0000, 0x60_0000, 30),
            Some((21, false))
        );
        // Receiver hole too small.
        assert_eq!(
            fit_order(mem, 21, 0x20_0000, 0x20_0000, 0x40_0000, 0x60_0000, 12),
            Some((12, true))
        );
        // A source order without a page size of its own is not a shrink.
        let start = mem.fitting_order(22);
        assert_eq!(start, 21);
        assert_eq!(
            fit_order(mem, start, 0x40_0000, 0x40_0000, 0x40_0000, 0x80_0000, 30),
            Some((21, false))
        );
        assert_eq!(fit_order(mem, 12, 0x1800, 0x1000, 0x1000, 0x2000, 12), None);
    }

    #[test]
    fn page_helpers_saturate_at_full_width() {
        assert_eq!(page_size(12), 0x1000);
        assert_eq!(page_size(64), u64::MAX);
        assert_eq!(page_start(0x1fff, 12), 0x1000);
        assert_eq!(subpage_offset(0x1fff, 12), 0xfff);
        assert_eq!(page_start(0x1fff, 64), 0);
    }

    #[test]
    fn error_codes() {
        assert_eq!(l4_error(Ok(())), L4Error::None);
        assert_eq!(l4_error(Err(MapError::EmptyMap)), L4Error::EmptyMap);
        assert_eq!(l4_error(Err(MapError::DeadSpace)), L4Error::MapFailed);
    }
}
