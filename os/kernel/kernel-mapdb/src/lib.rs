//! # Mapping Database
//!
//! Provenance tracking for the L4 map, grant and unmap operations. Every
//! mapping a task holds was derived from a mapping of another task, back to
//! the root task (sigma0) that owns all physical memory and I/O ports, or to
//! the creator of a kernel object. This crate records that derivation and
//! uses it to revoke everything derived from a page when the page is
//! unmapped.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Mapper: fpage_map / fpage_unmap / map_obj_initially     │
//! └──────────────┬───────────────────────────┬───────────────┘
//!                │                           │
//! ┌──────────────▼────────────┐  ┌───────────▼───────────────┐
//! │  map / unmap (map_util)   │  │  AutoTlbFlush             │
//! │  generic over MapTraits   │──▶  one shootdown per call   │
//! └──────┬─────────────┬──────┘  └───────────────────────────┘
//!        │             │
//! ┌──────▼──────┐ ┌────▼─────────────────────────────────────┐
//! │  MapSpace   │ │  MapDb: Mapdb (memory, I/O)              │
//! │  mem/io/obj │ │         KobjectMapdb (capabilities)      │
//! └─────────────┘ │  MappingTree + Treemap submaps           │
//!                 └──────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Derivation trees ([`mapping_tree`], [`treemap`])
//!
//! A [`MappingTree`] holds the mappings of one frame in pre-order with their
//! depth. A frame that was mapped at a smaller page size below some mapping
//! carries a [`Treemap`] submap as the first child of that mapping. Every
//! node is charged to the [`RamQuota`] of the space that holds it.
//!
//! ### Backing stores ([`mem_space`], [`io_space`], [`obj_space`])
//!
//! The page-table side of a [`Space`]: memory pages, I/O ports and
//! capability slots, behind the [`MapSpace`] contract and the per-store
//! [`MapTraits`] policy.
//!
//! ### Algorithms ([`map_util`])
//!
//! [`map`] and [`unmap`] are written once for all stores. They walk a range
//! chunk by chunk, take one frame lock at a time and feed every edited page
//! into a [`TlbAccumulator`].
//!
//! ## Locking
//!
//! Locks are taken in this order and never the other way round:
//!
//! 1. existence locks of the two spaces of a map call, lower address first
//! 2. one frame lock (a top-level mapdb frame or a kernel object)
//! 3. backing-store locks, taken and released inside each store call
//!
//! Objects whose last capability goes away are put on a [`ReapList`] and
//! destroyed by the caller after every lock is released.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::module_name_repetitions)]

extern crate alloc;

mod arena;
pub mod config;
mod io_space;
mod kobject;
pub mod map_space;
pub mod map_util;
mod mapdb;
mod mapper;
mod mapping;
pub mod mapping_tree;
mod mem_space;
mod obj_space;
mod page_table;
mod quota;
mod reap;
mod space;
mod tlb;
pub mod treemap;

pub use arena::Handle;
pub use config::{ConfigError, MapperConfig};
pub use io_space::IoSpace;
pub use kobject::{Kobject, KobjectKind, KobjectMapdb, Lifecycle, ObjFrame};
pub use map_space::{InsertStatus, MapDb, MapSpace, MapTraits, Page, PageAttr, PageLookup};
pub use map_util::{MapError, MapRange, map, unmap};
pub use mapdb::{Mapdb, MapdbFrame};
pub use mapper::Mapper;
pub use mapping::{Mapping, MappingInfo};
pub use mapping_tree::{MappingTree, TreeCorruption};
pub use mem_space::{CacheMode, MemAttr, MemSpace};
pub use obj_space::{Capability, ObjAttr, ObjExtra, ObjSpacePhys};
pub use quota::{QuotaExceeded, RamQuota};
pub use reap::ReapList;
pub use space::{Caps, Space};
pub use tlb::{AutoTlbFlush, CpuSet, NoTlbFlush, TlbAccumulator, TlbHardware};
pub use treemap::{BaseMappable, Treemap};
