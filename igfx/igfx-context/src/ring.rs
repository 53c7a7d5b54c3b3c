//! # Rings
//!
//! A ring is the in-order command queue of one GPU engine. The queue
//! itself is an external collaborator behind [`CommandStream`]; this
//! module adds the bookkeeping the resource layer needs on top: which
//! context is currently executing on the ring (a strong reference) and
//! the default context the ring falls back to.

use crate::context::CtxId;

/// A command emission failed; nothing was queued.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum EmitError {
    /// The ring has no room for the reservation.
    #[error("command ring full")]
    RingFull,
}

/// One in-order command queue of a GPU engine.
///
/// `begin` reserves space for an uninterrupted run of `n_words` words; a
/// successful `begin` guarantees the following `emit`s cannot fail, and
/// `advance` publishes them to the hardware as one contiguous sequence.
pub trait CommandStream {
    /// Reserve room for `n_words` words.
    ///
    /// # Errors
    /// [`EmitError::RingFull`] when the reservation does not fit; no words
    /// are queued in that case.
    fn begin(&mut self, n_words: usize) -> Result<(), EmitError>;

    /// Queue one word. Only valid inside a `begin`/`advance` pair.
    fn emit(&mut self, word: u32);

    /// Publish the reserved words to the hardware.
    fn advance(&mut self);

    /// Block until the engine has consumed everything queued so far.
    fn idle_wait(&mut self);
}

/// Index of a ring on the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RingId(pub usize);

/// Register block offsets, relative to a ring's mmio base.
const PP_DIR_DCLV_OFFSET: u32 = 0x220;
const PP_DIR_BASE_OFFSET: u32 = 0x228;

/// A ring plus the resource-layer state attached to it.
pub(crate) struct Ring<S: CommandStream> {
    pub stream: S,
    /// Base of the ring's register block.
    pub mmio_base: u32,
    /// The context currently executing on this ring. Holds one strong
    /// reference; transitions only inside the switch sequencer (or the
    /// reset path) under the device lock.
    pub current: Option<CtxId>,
    /// Fallback context, created at device init and permanently pinned.
    pub default_ctx: CtxId,
}

impl<S: CommandStream> Ring<S> {
    /// Register holding the page-directory control value.
    #[inline]
    pub const fn pp_dir_dclv(&self) -> u32 {
        self.mmio_base + PP_DIR_DCLV_OFFSET
    }

    /// Register holding the page-directory base address.
    #[inline]
    pub const fn pp_dir_base(&self) -> u32 {
        self.mmio_base + PP_DIR_BASE_OFFSET
    }
}

/// Register block base for ring `index`.
pub(crate) const fn ring_mmio_base(index: usize) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let index = index as u32;
    0x2000 + index * 0x2000
}
