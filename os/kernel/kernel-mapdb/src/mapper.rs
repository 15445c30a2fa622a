//! # Map and unmap system calls
//!
//! [`Mapper`] is the entry point used by the syscall layer. It decodes the
//! flexpages, picks the backing store by type tag and runs the generic
//! algorithms of [`map_util`](crate::map_util) against the matching mapdb.

use crate::config::{ConfigError, MapperConfig};
use crate::kobject::{Kobject, KobjectMapdb};
use crate::io_space::IoSpace;
use crate::map_space::{InsertStatus, MapSpace, MapTraits, PageLookup};
use crate::map_util::{
    MapError, MapRange, free_constraint, l4_error, map, page_size, page_start, unmap,
};
use crate::mapdb::Mapdb;
use crate::mem_space::MemSpace;
use crate::obj_space::{ObjAttr, ObjSpacePhys};
use crate::reap::ReapList;
use crate::space::{Caps, Space};
use crate::tlb::{AutoTlbFlush, NoTlbFlush, TlbHardware};
use alloc::sync::Arc;
use core::ops::Range;
use kernel_l4_types::{AccessFlags, Fpage, L4Error, MapItem, MapMask, PAGE_SHIFT, Rights};
use kernel_sync::lock_pair;
use log::{debug, warn};

/// Region of a flexpage in store units.
fn fpage_range(fp: Fpage) -> Range<u64> {
    let order = u32::from(fp.order());
    let start = page_start(fp.base(), order);
    start..start.saturating_add(page_size(order))
}

/// The mapping databases of a system and the hardware they flush.
pub struct Mapper<H: TlbHardware> {
    config: MapperConfig,
    mem: Mapdb,
    io: Mapdb,
    obj: KobjectMapdb,
    hw: H,
}

impl<H: TlbHardware> Mapper<H> {
    /// Builds the memory and I/O mapdbs, both owned by `sigma0`.
    ///
    /// # Errors
    /// If `config` does not describe the backing stores.
    pub fn new(sigma0: Arc<Space>, config: MapperConfig, hw: H) -> Result<Self, ConfigError> {
        config.validate()?;
        if !sigma0.is_sigma0() {
            warn!("mapper: root {sigma0} does not fabricate physical memory");
        }
        Ok(Self {
            mem: Mapdb::for_memory(sigma0.clone(), &config),
            io: Mapdb::for_io(sigma0, &config),
            obj: KobjectMapdb,
            config,
            hw,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &MapperConfig {
        &self.config
    }

    #[must_use]
    pub const fn hardware(&self) -> &H {
        &self.hw
    }

    #[must_use]
    pub fn sigma0(&self) -> &Arc<Space> {
        self.mem.owner()
    }

    #[must_use]
    pub const fn mem_mapdb(&self) -> &Mapdb {
        &self.mem
    }

    #[must_use]
    pub const fn io_mapdb(&self) -> &Mapdb {
        &self.io
    }

    /// Maps (or grants, per `control`) the part of `fp_from` in `from`
    /// selected by the hot spot into the receive window `fp_to` of `to`.
    ///
    /// Flexpages of different kinds, or a kind one of the spaces does not
    /// accept, map nothing and succeed. Objects that lose their last
    /// capability on the way are queued on `reap`.
    pub fn fpage_map(
        &self,
        from: &Arc<Space>,
        fp_from: Fpage,
        to: &Arc<Space>,
        fp_to: Fpage,
        control: MapItem,
        reap: &mut ReapList,
    ) -> L4Error {
        let caps = from.caps() & to.caps();

        let (first, second) = lock_pair(from.existence(), to.existence());
        if !*first || second.as_deref().is_some_and(|alive| !*alive) {
            warn!("map: {from} -> {to}: space is being destroyed");
            return MapError::DeadSpace.into();
        }

        let result = if caps.contains(Caps::MEM) && MemSpace::matches(fp_from, fp_to) {
            self.mem_map(from, fp_from, to, fp_to, control, reap)
        } else if caps.contains(Caps::IO) && IoSpace::matches(fp_from, fp_to) {
            self.io_map(from, fp_from, to, fp_to, control, reap)
        } else if caps.contains(Caps::OBJ) && ObjSpacePhys::matches(fp_from, fp_to) {
            self.obj_map(from, fp_from, to, fp_to, control, reap)
        } else {
            debug!("map: {fp_from:?} -> {fp_to:?} selects no store");
            Ok(())
        };
        drop(second);
        drop(first);
        l4_error(result)
    }

    /// Memory part of [`fpage_map`](Self::fpage_map). Windows smaller than a
    /// page map nothing.
    ///
    /// # Errors
    /// See [`map`].
    pub fn mem_map(
        &self,
        from: &Arc<Space>,
        fp_from: Fpage,
        to: &Arc<Space>,
        fp_to: Fpage,
        control: MapItem,
        reap: &mut ReapList,
    ) -> Result<(), MapError> {
        let page = u32::from(PAGE_SHIFT);
        let mut so = u32::from(fp_from.order());
        let ro = u32::from(fp_to.order());
        if so < page || ro < page {
            return Ok(());
        }

        let mut snd_addr = page_start(fp_from.base(), so);
        let mut rcv_addr = page_start(fp_to.base(), ro);
        free_constraint(&mut snd_addr, &mut so, &mut rcv_addr, ro, control.hot_spot_bytes());

        let mut tlb = AutoTlbFlush::new(&self.hw);
        map::<MemSpace, _, _>(
            &self.mem,
            MapRange {
                from,
                snd_addr,
                snd_size: page_size(so),
                to,
                rcv_addr,
                grant: control.grant(),
                attribs: MemSpace::attribs(fp_from, control),
            },
            &mut tlb,
            reap,
        )
    }

    /// I/O part of [`fpage_map`](Self::fpage_map). Ports are identity
    /// mapped, so only the overlap of both windows is transferred.
    ///
    /// # Errors
    /// See [`map`].
    pub fn io_map(
        &self,
        from: &Arc<Space>,
        fp_from: Fpage,
        to: &Arc<Space>,
        fp_to: Fpage,
        control: MapItem,
        reap: &mut ReapList,
    ) -> Result<(), MapError> {
        let snd = fpage_range(fp_from);
        let rcv = fpage_range(fp_to);
        let start = snd.start.max(rcv.start);
        let end = snd.end.min(rcv.end);
        if start >= end {
            return Ok(());
        }

        map::<IoSpace, _, _>(
            &self.io,
            MapRange {
                from,
                snd_addr: start,
                snd_size: end - start,
                to,
                rcv_addr: start,
                grant: control.grant(),
                attribs: IoSpace::attribs(fp_from, control),
            },
            &mut NoTlbFlush,
            reap,
        )
    }

    /// Capability part of [`fpage_map`](Self::fpage_map).
    ///
    /// # Errors
    /// See [`map`].
    pub fn obj_map(
        &self,
        from: &Arc<Space>,
        fp_from: Fpage,
        to: &Arc<Space>,
        fp_to: Fpage,
        control: MapItem,
        reap: &mut ReapList,
    ) -> Result<(), MapError> {
        let mut so = u32::from(fp_from.order());
        let ro = u32::from(fp_to.order());
        let mut snd_addr = page_start(fp_from.base(), so);
        let mut rcv_addr = page_start(fp_to.base(), ro);
        free_constraint(&mut snd_addr, &mut so, &mut rcv_addr, ro, control.hot_spot_index());

        map::<ObjSpacePhys, _, _>(
            &self.obj,
            MapRange {
                from,
                snd_addr,
                snd_size: page_size(so),
                to,
                rcv_addr,
                grant: control.grant(),
                attribs: ObjSpacePhys::attribs(fp_from, control),
            },
            &mut NoTlbFlush,
            reap,
        )
    }

    /// Revokes `fp.rights()` from everything derived from `space`'s part of
    /// `fp`, and from `space` itself with [`MapMask::SELF_UNMAP`].
    ///
    /// An all-spaces flexpage covers every store. Returns the access flags
    /// observed on the removed or narrowed entries.
    pub fn fpage_unmap(
        &self,
        space: &Arc<Space>,
        fp: Fpage,
        mask: MapMask,
        reap: &mut ReapList,
    ) -> AccessFlags {
        let caps = space.caps();
        let all = fp.is_all_spaces();
        let rights = fp.rights();
        let range = fpage_range(fp);
        let mut flags = AccessFlags::empty();

        if caps.contains(Caps::IO) && (all || fp.is_iopage()) {
            flags |= unmap::<IoSpace, _, _>(
                &self.io,
                space,
                range.clone(),
                rights,
                mask,
                &mut NoTlbFlush,
                reap,
            );
        }
        if caps.contains(Caps::OBJ) && (all || fp.is_objpage()) {
            flags |= unmap::<ObjSpacePhys, _, _>(
                &self.obj,
                space,
                range.clone(),
                rights,
                mask,
                &mut NoTlbFlush,
                reap,
            );
        }
        if caps.contains(Caps::MEM) && (all || fp.is_mempage()) {
            let mut tlb = AutoTlbFlush::new(&self.hw);
            flags |= unmap::<MemSpace, _, _>(&self.mem, space, range, rights, mask, &mut tlb, reap);
        }
        flags
    }

    /// Installs the first capability of a freshly created `obj` at `index`
    /// in `space`, replacing whatever was there.
    ///
    /// Returns `false` if the index is out of range or memory ran out.
    pub fn map_obj_initially(
        &self,
        space: &Arc<Space>,
        obj: &Arc<Kobject>,
        index: u64,
        attr: ObjAttr,
        reap: &mut ReapList,
    ) -> bool {
        let store = space.obj();
        if index >= store.map_max_address() {
            return false;
        }

        if let PageLookup::Mapped(_) = store.v_lookup(index) {
            unmap::<ObjSpacePhys, _, _>(
                &self.obj,
                space,
                index..index + 1,
                Rights::FULL,
                MapMask::SELF_UNMAP,
                &mut NoTlbFlush,
                reap,
            );
        }

        match store.v_insert(obj.clone(), index, 0, attr) {
            InsertStatus::Ok => {
                if KobjectMapdb::insert_root(obj, space, index) {
                    return true;
                }
                store.v_delete(index, 0, Rights::FULL);
                false
            }
            InsertStatus::ErrNomem => false,
            InsertStatus::WarnExists | InsertStatus::WarnAttribUpgrade | InsertStatus::ErrExists => {
                true
            }
        }
    }

    /// Tears down a space: later maps into it fail, then everything it holds
    /// and everything derived from it is revoked.
    pub fn release_space(&self, space: &Arc<Space>, reap: &mut ReapList) {
        if !space.kill() {
            return;
        }
        let flags = self.fpage_unmap(
            space,
            Fpage::all_spaces(Rights::FULL),
            MapMask::SELF_UNMAP,
            reap,
        );
        space.obj().caps_free();
        debug!("mapper: released {space} (flags {flags:?}, {} objects to reap)", reap.len());
    }
}
