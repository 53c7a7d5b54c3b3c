//! # GPU Virtual Range Manager
//!
//! Range allocator over a fixed GPU-virtual extent `[start, end)`.
//!
//! ## What you get
//! - [`RangeManager`]: address-ordered bookkeeping of allocated nodes; holes
//!   are derived from the gaps between neighbors, so coalescing on free is
//!   implicit and cannot be forgotten.
//! - Best-fit [`insert`](RangeManager::insert) with power-of-two alignment.
//! - [`reserve`](RangeManager::reserve) for ranges that were placed by an
//!   earlier agent (firmware framebuffers, pre-bound objects) and must be
//!   kept out of the allocator's hands.
//! - An optional **color guard**: when a proposed allocation would sit next
//!   to a node of a different color (cache/tiling class), the usable hole is
//!   shrunk by one guard unit on that side so differently colored regions
//!   are never contiguous. This models a hardware prefetch restriction on
//!   parts without a coherent last-level cache.
//!
//! ## Invariants
//! - Allocated nodes are non-overlapping and lie within `[start, end)`.
//! - With the color guard enabled, no two adjacent nodes have different
//!   colors.
//! - The manager never blocks and never evicts; a caller that receives
//!   [`AllocError::NoSpace`] is expected to free other ranges and retry.
//!
//! Double-freeing a range or freeing an address that was never allocated is
//! a driver bug and asserts instead of returning an error: continuing would
//! risk handing the same virtual range to two objects.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::collections::BTreeMap;
use core::ops::Bound;

/// A contiguous virtual range `[start, start + size)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Range {
    /// First address covered by the range.
    pub start: u64,
    /// Length in address units; never zero for a live range.
    pub size: u64,
}

impl Range {
    /// One-past-the-end address.
    #[inline]
    #[must_use]
    pub const fn end(self) -> u64 {
        self.start + self.size
    }

    /// Whether `addr` lies inside the range.
    #[inline]
    #[must_use]
    pub const fn contains(self, addr: u64) -> bool {
        self.start <= addr && addr < self.end()
    }
}

/// Cache/tiling classification used for the adjacency guard.
pub type Color = u32;

/// No hole of the requested size, alignment and color padding exists.
///
/// Recoverable: the caller owns eviction policy and may free ranges and
/// retry. The manager itself never evicts.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum AllocError {
    /// Every hole was too small once alignment and color guards applied.
    #[error("no free range of {size} units (alignment {alignment})")]
    NoSpace {
        /// Requested size.
        size: u64,
        /// Requested alignment.
        alignment: u64,
    },
}

/// A fixed-placement reservation could not be honored.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ReserveError {
    /// The requested range overlaps an existing node.
    #[error("reservation [{start:#x}, +{size:#x}) overlaps an existing node")]
    Overlap {
        /// Requested start.
        start: u64,
        /// Requested size.
        size: u64,
    },
    /// The requested range falls outside the managed extent.
    #[error("reservation [{start:#x}, +{size:#x}) outside the managed extent")]
    OutOfBounds {
        /// Requested start.
        start: u64,
        /// Requested size.
        size: u64,
    },
}

/// An allocated node. Stored keyed by its start address.
#[derive(Copy, Clone, Debug)]
struct Node {
    size: u64,
    color: Color,
}

/// Range allocator over `[start, end)` with optional color-adjacency guard.
pub struct RangeManager {
    start: u64,
    end: u64,
    /// Guard units inserted between differently colored neighbors;
    /// `None` disables the color rule entirely.
    guard: Option<u64>,
    nodes: BTreeMap<u64, Node>,
}

impl RangeManager {
    /// Create a manager over `[start, start + size)` with no color rule.
    #[must_use]
    pub const fn new(start: u64, size: u64) -> Self {
        Self {
            start,
            end: start + size,
            guard: None,
            nodes: BTreeMap::new(),
        }
    }

    /// Enable the color-adjacency guard with the given unit (e.g. one page).
    ///
    /// Installed once at setup on hardware that prefetches across mapping
    /// boundaries; a no-op rule otherwise.
    pub fn enable_color_guard(&mut self, unit: u64) {
        debug_assert!(unit > 0);
        self.guard = Some(unit);
    }

    /// Total extent under management.
    #[inline]
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.end - self.start
    }

    /// Sum of all hole sizes (before any color adjustment).
    #[must_use]
    pub fn free_capacity(&self) -> u64 {
        self.holes().map(|h| h.size).sum()
    }

    /// Whether nothing is allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The allocated node starting at `start`, if any.
    #[must_use]
    pub fn get(&self, start: u64) -> Option<Range> {
        self.nodes.get(&start).map(|n| Range {
            start,
            size: n.size,
        })
    }

    /// Iterate the unallocated gaps in address order.
    pub fn holes(&self) -> impl Iterator<Item = Range> + '_ {
        let mut cursor = self.start;
        let mut nodes = self.nodes.iter();
        let end = self.end;
        core::iter::from_fn(move || {
            loop {
                match nodes.next() {
                    Some((&at, node)) => {
                        let hole_start = cursor;
                        cursor = at + node.size;
                        if at > hole_start {
                            return Some(Range {
                                start: hole_start,
                                size: at - hole_start,
                            });
                        }
                    }
                    None => {
                        if cursor < end {
                            let hole = Range {
                                start: cursor,
                                size: end - cursor,
                            };
                            cursor = end;
                            return Some(hole);
                        }
                        return None;
                    }
                }
            }
        })
    }

    /// Best-fit allocation of `size` units at the given power-of-two
    /// `alignment` (0 and 1 mean unaligned) and `color`.
    ///
    /// # Errors
    /// [`AllocError::NoSpace`] when no hole fits after alignment and the
    /// color guard are applied.
    pub fn insert(
        &mut self,
        size: u64,
        alignment: u64,
        color: Color,
    ) -> Result<Range, AllocError> {
        debug_assert!(size > 0);
        let alignment = alignment.max(1);
        debug_assert!(alignment.is_power_of_two());

        let mut best: Option<(u64 /* hole size */, u64 /* place at */)> = None;
        for hole in self.holes() {
            let (usable_start, usable_end) = self.color_adjust(hole, color);
            let place = align_up(usable_start, alignment);
            if place.checked_add(size).is_none_or(|end| end > usable_end) {
                continue;
            }
            // Best fit: prefer the smallest hole that still works.
            if best.is_none_or(|(best_size, _)| hole.size < best_size) {
                best = Some((hole.size, place));
            }
        }

        let (_, start) = best.ok_or(AllocError::NoSpace { size, alignment })?;
        self.nodes.insert(start, Node { size, color });
        log::trace!("mm: insert [{start:#x}, +{size:#x}) color {color}");
        Ok(Range { start, size })
    }

    /// Reserve a fixed range that must not be handed out by the allocator.
    ///
    /// # Errors
    /// [`ReserveError`] if the range overlaps an existing node or falls
    /// outside the managed extent. The caller decides whether that is fatal.
    pub fn reserve(
        &mut self,
        start: u64,
        size: u64,
        color: Color,
    ) -> Result<(), ReserveError> {
        debug_assert!(size > 0);
        if start < self.start || start + size > self.end {
            return Err(ReserveError::OutOfBounds { start, size });
        }
        if self.overlaps(start, size) {
            return Err(ReserveError::Overlap { start, size });
        }
        self.nodes.insert(start, Node { size, color });
        log::trace!("mm: reserve [{start:#x}, +{size:#x}) color {color}");
        Ok(())
    }

    /// Free the node starting at `start`, returning the vacated range.
    ///
    /// The space is immediately reusable; neighbors coalesce by
    /// construction since holes are derived from the node map.
    ///
    /// # Panics
    /// Freeing an address that is not the start of a live node is a driver
    /// bug (double free or stale address) and asserts.
    pub fn remove(&mut self, start: u64) -> Range {
        let node = self.nodes.remove(&start);
        assert!(node.is_some(), "mm: free of unallocated range {start:#x}");
        let node = node.unwrap();
        log::trace!("mm: remove [{start:#x}, +{:#x})", node.size);
        Range {
            start,
            size: node.size,
        }
    }

    /// Shrink `hole` by one guard unit on each side whose neighbor carries
    /// a different color. Returns the usable `[start, end)`.
    fn color_adjust(&self, hole: Range, color: Color) -> (u64, u64) {
        let Some(guard) = self.guard else {
            return (hole.start, hole.end());
        };
        let mut usable_start = hole.start;
        let mut usable_end = hole.end();
        // Node ending exactly at the hole start.
        if let Some((&at, prev)) = self
            .nodes
            .range((Bound::Unbounded, Bound::Excluded(hole.start)))
            .next_back()
            && at + prev.size == hole.start
            && prev.color != color
        {
            usable_start += guard;
        }
        // Node starting exactly at the hole end.
        if let Some((&at, next)) = self
            .nodes
            .range((Bound::Included(hole.end()), Bound::Unbounded))
            .next()
            && at == hole.end()
            && next.color != color
        {
            usable_end = usable_end.saturating_sub(guard);
        }
        (usable_start, usable_end)
    }

    fn overlaps(&self, start: u64, size: u64) -> bool {
        let end = start + size;
        // The closest node at or below `start`, plus anything starting
        // inside the candidate range.
        if let Some((&at, node)) = self
            .nodes
            .range((Bound::Unbounded, Bound::Included(start)))
            .next_back()
            && at + node.size > start
        {
            return true;
        }
        self.nodes
            .range((Bound::Excluded(start), Bound::Excluded(end)))
            .next()
            .is_some()
    }
}

/// Align `x` up to the nearest multiple of power-of-two `a`.
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}
