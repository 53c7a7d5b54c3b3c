//! # Address Spaces and Their Backing Tables
//!
//! An [`AddressSpace`] couples a range manager with the table that holds
//! its translation entries and the scratch page that fills every unmapped
//! slot. The global space is shared by all contexts and lives for the
//! device's lifetime; a private space is owned by exactly one execution
//! context and torn down with it.

use crate::{CacheLevel, DmaAddress, DmaSegment, GttEntry, PAGE_SHIFT, PAGE_SIZE};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use igfx_mm::{AllocError, Color, Range, RangeManager, ReserveError};

/// The host-provided fixed-function translation table.
///
/// Binding through this port degenerates to programming an external table
/// one entry at a time; the port owns no table memory on the driver side.
pub trait AperturePort {
    /// Program one entry of the external table.
    fn write_entry(&mut self, index: usize, entry: GttEntry);

    /// Drain all in-flight GPU accesses.
    ///
    /// On platforms with the idle-drain requirement this must complete
    /// before any mapping change takes effect; it is the one point in the
    /// binder that may block the calling thread.
    fn wait_idle(&mut self);
}

/// Driver-owned entry array in device-addressable memory.
///
/// Supports one private table per execution context, which is what makes
/// isolated per-context address spaces possible.
pub struct SoftTable {
    entries: Vec<GttEntry>,
}

impl SoftTable {
    /// A table with `pages` entries, all zero until the owner scrubs it.
    #[must_use]
    pub fn new(pages: usize) -> Self {
        Self {
            entries: vec![GttEntry::new(); pages],
        }
    }

    /// Read back the entry at `index`.
    #[inline]
    #[must_use]
    pub fn entry(&self, index: usize) -> GttEntry {
        self.entries[index]
    }

    /// Number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where an address space's translation entries live.
///
/// The set of backends is closed and known at detection time, so a tagged
/// union is all the dispatch this needs. The choice is made once per
/// address space and never changes.
pub enum TableBacking {
    /// Fixed-function: entries live in a host-controlled aperture table.
    Aperture(Box<dyn AperturePort>),
    /// Software: entries live in driver-owned device-addressable memory.
    Table(SoftTable),
}

/// A mapping could not be installed. The range stays unbound (all scratch).
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum BindError {
    /// The target range is not page aligned.
    #[error("range [{start:#x}, +{size:#x}) is not page aligned")]
    Unaligned {
        /// Range start.
        start: u64,
        /// Range size.
        size: u64,
    },
    /// The object's backing does not cover the whole range.
    #[error("backing covers {have} pages, range needs {need}")]
    ShortBacking {
        /// Pages available in the backing segments.
        have: u64,
        /// Pages the range requires.
        need: u64,
    },
    /// The target range lies outside the address space.
    #[error("range [{start:#x}, +{size:#x}) outside the address space")]
    OutOfBounds {
        /// Range start.
        start: u64,
        /// Range size.
        size: u64,
    },
}

/// A GPU virtual address space: identifier extent, range bookkeeping, the
/// backing translation table and the scratch encoding.
pub struct AddressSpace {
    mm: RangeManager,
    backing: TableBacking,
    /// First address covered by entry 0.
    base: u64,
    /// Full extent in pages, including any trailing guard page.
    total_pages: u64,
    scratch: GttEntry,
    needs_idle_drain: bool,
}

impl AddressSpace {
    /// Build the global (shared) address space over `[start, start+size)`.
    ///
    /// The trailing page is kept out of the allocator as a guard against
    /// hardware prefetch past the last object, and the entire extent is
    /// scrubbed to the scratch encoding before first use.
    #[must_use]
    pub fn global(
        start: u64,
        size: u64,
        backing: TableBacking,
        scratch_page: DmaAddress,
        color_guard: bool,
        needs_idle_drain: bool,
    ) -> Self {
        debug_assert_eq!(start % PAGE_SIZE, 0);
        debug_assert_eq!(size % PAGE_SIZE, 0);
        debug_assert!(size > PAGE_SIZE);
        // Subtract the guard page from what the allocator may hand out.
        let mut mm = RangeManager::new(start, size - PAGE_SIZE);
        if color_guard {
            mm.enable_color_guard(PAGE_SIZE);
        }
        let mut vm = Self {
            mm,
            backing,
            base: start,
            total_pages: size >> PAGE_SHIFT,
            scratch: GttEntry::scratch(scratch_page),
            needs_idle_drain,
        };
        vm.scrub();
        log::debug!(
            "gtt: global space [{start:#x}, +{size:#x}), guard page at {:#x}",
            start + size - PAGE_SIZE
        );
        vm
    }

    /// Build a private per-context address space of `size` bytes.
    ///
    /// Always software-backed; the fixed-function table is a single shared
    /// resource and cannot isolate contexts.
    #[must_use]
    pub fn private(size: u64, scratch_page: DmaAddress) -> Self {
        debug_assert_eq!(size % PAGE_SIZE, 0);
        let pages = size >> PAGE_SHIFT;
        #[allow(clippy::cast_possible_truncation)]
        let table = SoftTable::new(pages as usize);
        let mut vm = Self {
            mm: RangeManager::new(0, size),
            backing: TableBacking::Table(table),
            base: 0,
            total_pages: pages,
            scratch: GttEntry::scratch(scratch_page),
            needs_idle_drain: false,
        };
        vm.scrub();
        vm
    }

    /// Allocate a range for an object of `size` bytes.
    ///
    /// # Errors
    /// Propagates [`AllocError::NoSpace`]; the caller owns eviction.
    pub fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
        color: Color,
    ) -> Result<Range, AllocError> {
        self.mm.insert(size, alignment.max(PAGE_SIZE), color)
    }

    /// Reserve a fixed range (preallocated/firmware objects).
    ///
    /// # Errors
    /// Propagates [`ReserveError`] when the range overlaps or is out of
    /// bounds.
    pub fn reserve(&mut self, start: u64, size: u64, color: Color) -> Result<(), ReserveError> {
        self.mm.reserve(start, size, color)
    }

    /// Return a range to the allocator. Entries must already have been
    /// rewritten via [`unbind`](Self::unbind).
    pub fn release(&mut self, range: Range) {
        let freed = self.mm.remove(range.start);
        debug_assert_eq!(freed, range);
    }

    /// Install one translation entry per page unit of `range`, walking the
    /// object's backing segments in order.
    ///
    /// Nothing is written unless the whole range can be covered, so a
    /// failed bind leaves every entry at its previous (scratch) encoding.
    ///
    /// # Errors
    /// [`BindError`] when the range is misaligned, out of bounds, or the
    /// segments run short.
    pub fn bind(
        &mut self,
        segments: &[DmaSegment],
        range: Range,
        level: CacheLevel,
    ) -> Result<(), BindError> {
        if range.start % PAGE_SIZE != 0 || range.size % PAGE_SIZE != 0 {
            return Err(BindError::Unaligned {
                start: range.start,
                size: range.size,
            });
        }
        let need = range.size >> PAGE_SHIFT;
        let first = self.index_of(range.start, need)?;
        let have: u64 = segments.iter().map(|s| s.pages()).sum();
        if have < need {
            return Err(BindError::ShortBacking { have, need });
        }

        self.prepare_mutation();
        let mut index = first;
        let mut remaining = need;
        'segments: for segment in segments {
            for page in 0..segment.pages() {
                if remaining == 0 {
                    break 'segments;
                }
                let entry = GttEntry::encode(segment.addr.add_pages(page), level, true);
                self.write_entry(index, entry);
                index += 1;
                remaining -= 1;
            }
        }
        log::trace!(
            "gtt: bound [{:#x}, +{:#x}) as {level:?}",
            range.start,
            range.size
        );
        Ok(())
    }

    /// Rewrite every entry of `range` to the scratch encoding.
    ///
    /// Never leaves a dangling entry: speculative reads of the vacated
    /// range hit the scratch page instead of stale translations.
    pub fn unbind(&mut self, range: Range) {
        debug_assert_eq!(range.start % PAGE_SIZE, 0);
        debug_assert_eq!(range.size % PAGE_SIZE, 0);
        let pages = range.size >> PAGE_SHIFT;
        let first = self
            .index_of(range.start, pages)
            .expect("unbind of a range outside the address space");
        self.prepare_mutation();
        for i in 0..pages {
            #[allow(clippy::cast_possible_truncation)]
            self.write_entry(first + i as usize, self.scratch);
        }
        log::trace!("gtt: unbound [{:#x}, +{:#x})", range.start, range.size);
    }

    /// Read back the entry covering `addr`. Only the software backend can
    /// be inspected; the aperture table is outside driver memory.
    #[must_use]
    pub fn entry_at(&self, addr: u64) -> Option<GttEntry> {
        debug_assert!(addr >= self.base);
        let index = (addr - self.base) >> PAGE_SHIFT;
        match &self.backing {
            TableBacking::Table(t) => {
                #[allow(clippy::cast_possible_truncation)]
                let index = index as usize;
                Some(t.entry(index))
            }
            TableBacking::Aperture(_) => None,
        }
    }

    /// The scratch encoding this space fills unmapped ranges with.
    #[inline]
    #[must_use]
    pub const fn scratch_entry(&self) -> GttEntry {
        self.scratch
    }

    /// Allocatable capacity currently free.
    #[must_use]
    pub fn free_capacity(&self) -> u64 {
        self.mm.free_capacity()
    }

    /// Extent the allocator manages (excludes any guard page).
    #[must_use]
    pub const fn managed_size(&self) -> u64 {
        self.mm.total()
    }

    /// Fill the whole extent, guard page included, with scratch.
    fn scrub(&mut self) {
        self.prepare_mutation();
        for i in 0..self.total_pages {
            #[allow(clippy::cast_possible_truncation)]
            self.write_entry(i as usize, self.scratch);
        }
    }

    /// Map `start` to a table index, checking `pages` fit in the extent.
    fn index_of(&self, start: u64, pages: u64) -> Result<usize, BindError> {
        let err = BindError::OutOfBounds {
            start,
            size: pages << PAGE_SHIFT,
        };
        if start < self.base {
            return Err(err);
        }
        let first = (start - self.base) >> PAGE_SHIFT;
        if first + pages > self.total_pages {
            return Err(err);
        }
        #[allow(clippy::cast_possible_truncation)]
        let first = first as usize;
        Ok(first)
    }

    /// Drain in-flight GPU access where the platform demands it before the
    /// external table may change.
    fn prepare_mutation(&mut self) {
        if self.needs_idle_drain
            && let TableBacking::Aperture(port) = &mut self.backing
        {
            port.wait_idle();
        }
    }

    fn write_entry(&mut self, index: usize, entry: GttEntry) {
        match &mut self.backing {
            TableBacking::Aperture(port) => port.write_entry(index, entry),
            TableBacking::Table(t) => t.entries[index] = entry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRATCH: DmaAddress = DmaAddress::new(0xdead_0000);

    fn soft_global(pages: u64) -> AddressSpace {
        #[allow(clippy::cast_possible_truncation)]
        let backing = TableBacking::Table(SoftTable::new(pages as usize));
        AddressSpace::global(0, pages * PAGE_SIZE, backing, SCRATCH, false, false)
    }

    fn one_segment(addr: u64, pages: u64) -> [DmaSegment; 1] {
        [DmaSegment {
            addr: DmaAddress::new(addr),
            len: pages * PAGE_SIZE,
        }]
    }

    #[test]
    fn setup_scrubs_everything_and_keeps_a_guard_page() {
        let vm = soft_global(16);
        assert_eq!(vm.managed_size(), 15 * PAGE_SIZE);
        assert_eq!(vm.free_capacity(), 15 * PAGE_SIZE);
        for page in 0..16 {
            let e = vm.entry_at(page * PAGE_SIZE).expect("soft entry");
            assert_eq!(e, vm.scratch_entry());
        }
    }

    #[test]
    fn bind_then_unbind_restores_capacity_and_scratch() {
        let mut vm = soft_global(16);
        let before = vm.free_capacity();

        let range = vm.allocate(4 * PAGE_SIZE, PAGE_SIZE, 0).expect("allocate");
        vm.bind(&one_segment(0x10_0000, 4), range, CacheLevel::Llc)
            .expect("bind");

        // Entries map the backing in order.
        for page in 0..4 {
            let e = vm.entry_at(range.start + page * PAGE_SIZE).expect("entry");
            assert!(e.valid());
            assert_eq!(e.address(), DmaAddress::new(0x10_0000 + page * PAGE_SIZE));
        }

        vm.unbind(range);
        vm.release(range);
        assert!(vm.free_capacity() >= before);
        for page in 0..4 {
            let e = vm.entry_at(range.start + page * PAGE_SIZE).expect("entry");
            assert_eq!(e, vm.scratch_entry());
        }
    }

    #[test]
    fn bind_spans_multiple_segments() {
        let mut vm = soft_global(16);
        let range = vm.allocate(3 * PAGE_SIZE, PAGE_SIZE, 0).expect("allocate");
        let segments = [
            DmaSegment {
                addr: DmaAddress::new(0x20_0000),
                len: 2 * PAGE_SIZE,
            },
            DmaSegment {
                addr: DmaAddress::new(0x80_0000),
                len: PAGE_SIZE,
            },
        ];
        vm.bind(&segments, range, CacheLevel::None).expect("bind");
        let last = vm
            .entry_at(range.start + 2 * PAGE_SIZE)
            .expect("third entry");
        assert_eq!(last.address(), DmaAddress::new(0x80_0000));
    }

    #[test]
    fn short_backing_writes_nothing() {
        let mut vm = soft_global(16);
        let range = vm.allocate(4 * PAGE_SIZE, PAGE_SIZE, 0).expect("allocate");
        let err = vm
            .bind(&one_segment(0x10_0000, 2), range, CacheLevel::Llc)
            .expect_err("short backing");
        assert_eq!(err, BindError::ShortBacking { have: 2, need: 4 });
        for page in 0..4 {
            let e = vm.entry_at(range.start + page * PAGE_SIZE).expect("entry");
            assert_eq!(e, vm.scratch_entry());
        }
    }

    #[test]
    fn private_space_is_software_backed_from_zero() {
        let mut vm = AddressSpace::private(8 * PAGE_SIZE, SCRATCH);
        let range = vm.allocate(PAGE_SIZE, PAGE_SIZE, 0).expect("allocate");
        assert_eq!(range.start, 0);
        vm.bind(&one_segment(0x30_0000, 1), range, CacheLevel::Llc)
            .expect("bind");
        assert_eq!(
            vm.entry_at(0).expect("entry").address(),
            DmaAddress::new(0x30_0000)
        );
    }

    /// Records the order of idle drains and entry writes.
    struct RecordingPort {
        ops: std::rc::Rc<std::cell::RefCell<Vec<&'static str>>>,
    }

    impl AperturePort for RecordingPort {
        fn write_entry(&mut self, _index: usize, _entry: GttEntry) {
            self.ops.borrow_mut().push("write");
        }

        fn wait_idle(&mut self) {
            self.ops.borrow_mut().push("idle");
        }
    }

    #[test]
    fn fixed_function_drains_before_each_mutation() {
        let ops = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let port = RecordingPort {
            ops: std::rc::Rc::clone(&ops),
        };
        let mut vm = AddressSpace::global(
            0,
            8 * PAGE_SIZE,
            TableBacking::Aperture(Box::new(port)),
            SCRATCH,
            false,
            true,
        );
        ops.borrow_mut().clear();

        let range = vm.allocate(2 * PAGE_SIZE, PAGE_SIZE, 0).expect("allocate");
        vm.bind(&one_segment(0x40_0000, 2), range, CacheLevel::None)
            .expect("bind");

        let recorded = ops.borrow();
        assert_eq!(recorded.first(), Some(&"idle"));
        assert_eq!(recorded.iter().filter(|op| **op == "write").count(), 2);
    }
}
