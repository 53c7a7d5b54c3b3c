//! # GPU Translation Tables
//!
//! Installs and removes the translation entries that map a buffer object's
//! physical backing pages into a GPU address space.
//!
//! ## What you get
//! - [`GttEntry`]: the 64-bit translation entry (valid bit, cache attribute
//!   bits in the low word, page-frame address above).
//! - [`CacheLevel`]: the cache/tiling classification carried by every
//!   mapping; it selects the entry attribute bits and doubles as the
//!   allocator color.
//! - Two interchangeable backends behind [`TableBacking`]:
//!   - [`AperturePort`]: a host-controlled fixed-function table programmed
//!     through a legacy bus-level bind primitive. Needs no table memory of
//!     its own, but on some platforms every mutation must first drain
//!     in-flight GPU accesses.
//!   - [`SoftTable`]: entries in device-addressable memory under driver
//!     control; supports one private table per execution context.
//! - [`AddressSpace`]: a range manager plus a backing table plus a scratch
//!   page. Vacated ranges are rewritten to the scratch encoding at unbind
//!   time, so speculative GPU reads of unmapped space can never fault or
//!   observe stale translations.
//!
//! ## Invariants
//! - Every entry in the managed extent is either a live mapping or the
//!   scratch encoding; never garbage.
//! - `bind` writes nothing unless the whole range can be covered by the
//!   object's backing segments.
//! - The trailing page of a global extent stays outside the allocator:
//!   the hardware prefetches past the end of objects, and one always-valid
//!   guard page keeps that prefetch inside the aperture.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod aspace;
mod entry;

pub use crate::aspace::{AddressSpace, AperturePort, BindError, SoftTable, TableBacking};
pub use crate::entry::GttEntry;

/// Size of one translation unit (one page).
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// A bus/DMA address as seen by the GPU's memory interface.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct DmaAddress(u64);

impl DmaAddress {
    /// Wrap a raw bus address.
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// The raw address value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The address `pages` translation units further on.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, pages: u64) -> Self {
        Self(self.0 + (pages << PAGE_SHIFT))
    }
}

/// One physically contiguous run of backing pages.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DmaSegment {
    /// Bus address of the first page. Page aligned.
    pub addr: DmaAddress,
    /// Length in bytes; a multiple of [`PAGE_SIZE`].
    pub len: u64,
}

impl DmaSegment {
    /// Number of translation units covered.
    #[inline]
    #[must_use]
    pub const fn pages(self) -> u64 {
        self.len >> PAGE_SHIFT
    }
}

/// Cache coherency classification of a mapping.
///
/// Decides the attribute bits of every translation entry written for the
/// mapping, and acts as the allocator color: on parts without a coherent
/// last-level cache, uncached and cached neighbors must be separated by a
/// guard page.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CacheLevel {
    /// Not cached; required for scanout and similar streaming consumers.
    #[default]
    None,
    /// Snooped by the last-level cache.
    Llc,
    /// Snooped by L3 and the last-level cache.
    L3Llc,
    /// Write-through.
    WriteThrough,
}

impl CacheLevel {
    /// The allocator color for this level.
    #[inline]
    #[must_use]
    pub const fn color(self) -> igfx_mm::Color {
        match self {
            Self::None => 0,
            Self::Llc | Self::L3Llc | Self::WriteThrough => 1,
        }
    }
}
