use crate::config::{IO_BITMAP_BYTES, IO_PAGE_ORDERS, IO_PORT_BITS};
use crate::map_space::{InsertStatus, MapSpace, MapTraits, Page, PageLookup};
use crate::page_table::{PageTable, TableGeometry};
use crate::quota::RamQuota;
use crate::space::Space;
use alloc::sync::Arc;
use kernel_l4_types::{AccessFlags, Fpage, MapItem, Rights};
use kernel_sync::HelpingLock;

/// One permission bitmap covers all ports.
const GEOMETRY: TableGeometry = TableGeometry {
    orders: &IO_PAGE_ORDERS,
    address_bits: IO_PORT_BITS,
    table_span: IO_PORT_BITS,
    table_bytes: IO_BITMAP_BYTES,
};

/// The I/O port store of a space. Ports are identity mapped, so the
/// "physical" side of an entry is the port number itself.
pub struct IoSpace {
    table: HelpingLock<PageTable<u64, Rights>>,
    owns_all_ports: bool,
}

impl IoSpace {
    pub(crate) fn new(quota: Arc<RamQuota>) -> Self {
        Self {
            table: HelpingLock::new(PageTable::new(GEOMETRY, quota)),
            owns_all_ports: false,
        }
    }

    pub(crate) fn sigma0(quota: Arc<RamQuota>) -> Self {
        Self {
            owns_all_ports: true,
            ..Self::new(quota)
        }
    }

    /// Whether `port` is accessible.
    #[must_use]
    pub fn has_port(&self, port: u64) -> bool {
        matches!(self.v_fabricate(port), PageLookup::Mapped(_))
    }

    /// Quota held by the port bitmap.
    #[must_use]
    pub fn table_bytes(&self) -> usize {
        self.table.lock().table_bytes()
    }
}

impl MapSpace for IoSpace {
    type Phys = u64;
    type Attr = Rights;

    const NAME: &'static str = "io";

    fn of(space: &Space) -> &Self {
        space.io()
    }

    fn v_lookup(&self, port: u64) -> PageLookup<u64, Rights> {
        self.table.lock().lookup(port)
    }

    fn v_fabricate(&self, port: u64) -> PageLookup<u64, Rights> {
        let found = self.v_lookup(port);
        if self.owns_all_ports && port < self.map_max_address() && matches!(found, PageLookup::Hole { .. }) {
            return PageLookup::Mapped(Page {
                phys: 0,
                order: IO_PORT_BITS,
                attr: Rights::RWX,
            });
        }
        found
    }

    fn v_insert(&self, phys: u64, port: u64, order: u32, attr: Rights) -> InsertStatus {
        debug_assert_eq!(phys, port, "I/O ports are identity mapped");
        self.table.lock().insert(phys, port, order, attr)
    }

    fn v_delete(&self, port: u64, _order: u32, rights: Rights) -> AccessFlags {
        // Port access is not tracked.
        self.table.lock().delete(port, rights);
        AccessFlags::empty()
    }

    fn map_max_address(&self) -> u64 {
        1 << IO_PORT_BITS
    }

    fn fitting_order(&self, order: u32) -> u32 {
        self.table.lock().fitting_order(order)
    }

    fn min_order(&self) -> u32 {
        0
    }

    fn subpage(phys: &u64, offset: u64) -> u64 {
        phys + offset
    }

    fn same_page(phys: &u64, other: &u64, order: u32) -> bool {
        phys & !((1 << order) - 1) == *other
    }
}

impl MapTraits for IoSpace {
    fn matches(from: Fpage, to: Fpage) -> bool {
        from.is_iopage() && (to.is_iopage() || to.is_all_spaces())
    }

    fn attribs(fp: Fpage, _control: MapItem) -> Rights {
        fp.rights() & Rights::RWX
    }
}
