//! # Translation Entry Encoding
//!
//! One 64-bit entry per mapped page. The layout follows the fixed-function
//! generations: a valid bit at bit 0, cache attribute bits in the low word,
//! and the page-frame address from bit 12 upward. The low attribute bits
//! are what the Page-Table Binder encodes the [`CacheLevel`] into.

use crate::{CacheLevel, DmaAddress, PAGE_SHIFT};
use bitfield_struct::bitfield;

/// Attribute encoding for an uncached page.
const ATTR_UNCACHED: u8 = 0b001;
/// Attribute encoding for an LLC-snooped page.
const ATTR_LLC: u8 = 0b010;
/// Attribute encoding for an L3+LLC-snooped page.
const ATTR_L3_LLC: u8 = 0b011;
/// Attribute encoding for a write-through page.
const ATTR_WT: u8 = 0b100;

/// A single translation entry.
///
/// ### Bit layout
///
/// | Bits  | Name    | Meaning                              |
/// |-------|---------|--------------------------------------|
/// | 0     | `valid` | Entry maps a real page if set        |
/// | 1–3   | `attrs` | Cache attribute encoding             |
/// | 4–11  | —       | Reserved                             |
/// | 12–63 | `frame` | Page-frame address bits `[63:12]`    |
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct GttEntry {
    /// Valid (bit 0). Clear entries are ignored by the translation walker,
    /// but the binder never leaves entries clear; vacated ranges point at
    /// the scratch page instead.
    pub valid: bool,

    /// Cache attribute bits (bits 1–3).
    #[bits(3)]
    pub attrs: u8,

    /// Reserved (bits 4–11).
    #[bits(8)]
    __: u8,

    /// Page-frame address bits `[63:12]`.
    #[bits(52)]
    pub frame: u64,
}

impl GttEntry {
    /// Encode a mapping of the page at `addr` with the given cache level.
    ///
    /// With `valid == false` the attribute bits are still written so that a
    /// readback can tell a deliberately invalidated entry from garbage.
    #[must_use]
    pub const fn encode(addr: DmaAddress, level: CacheLevel, valid: bool) -> Self {
        let attrs = match level {
            CacheLevel::None => ATTR_UNCACHED,
            CacheLevel::Llc => ATTR_LLC,
            CacheLevel::L3Llc => ATTR_L3_LLC,
            CacheLevel::WriteThrough => ATTR_WT,
        };
        Self::new()
            .with_valid(valid)
            .with_attrs(attrs)
            .with_frame(addr.as_u64() >> PAGE_SHIFT)
    }

    /// The scratch encoding: a valid, uncached mapping of the scratch page.
    #[must_use]
    pub const fn scratch(scratch: DmaAddress) -> Self {
        Self::encode(scratch, CacheLevel::None, true)
    }

    /// The bus address this entry maps.
    #[inline]
    #[must_use]
    pub const fn address(self) -> DmaAddress {
        DmaAddress::new(self.frame() << PAGE_SHIFT)
    }
}
