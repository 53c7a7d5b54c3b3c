//! # GPU Execution Contexts
//!
//! Lifecycle and hardware hand-over for GPU execution contexts: the saved
//! and restored hardware state a rendering client runs as, together with
//! the address space that state executes against.
//!
//! ## What you get
//! - [`Device`]: the resource layer itself — context creation, explicit
//!   reference/release with inline teardown, pinning of context state into
//!   the global address space, and the multi-step switch protocol that
//!   changes what a ring is currently executing as.
//! - [`Gpu`]: the same device behind the single device-wide lock. Every
//!   entry point is serialized, which is why reference and pin counts are
//!   plain integers rather than atomics.
//! - [`CommandStream`] and [`BufferService`]: the external collaborators
//!   (per-engine command queue, buffer-object backing facts), specified
//!   only at their interface boundary.
//! - [`HandleTable`]: a sparse table mapping user-visible integer ids to
//!   contexts, kept separate from the lifecycle object so the id policy
//!   can change independently.
//!
//! ## The hard rule
//!
//! The GPU executes asynchronously. Pinning a context's state object can
//! force eviction, which can idle the GPU and — as a side effect — switch
//! the very ring being operated on to its default context. Any code that
//! runs after a potentially evicting call must therefore re-read the
//! ring's `current` pointer instead of trusting a value captured earlier.
//! The switch sequencer in this crate encodes that discipline; keep it
//! when changing the protocol.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod buffer;
mod context;
mod device;
mod handle;
mod ring;
mod switch;

pub use crate::buffer::{BufferHandle, BufferService};
pub use crate::context::CtxId;
pub use crate::device::{
    CreateError, Device, Gpu, GttConfig, InitError, PinError, SwitchError,
};
pub use crate::handle::{Handle, HandleTable};
pub use crate::ring::{CommandStream, EmitError, RingId};
pub use crate::switch::{L3LOG_ROWS, SetContextFlags};

/// A user-visible context id.
pub type ContextHandle = Handle;

/// Capabilities detected once at device initialization.
///
/// These decide backend selection and the platform workarounds the switch
/// sequencer must apply; nothing here changes at runtime.
#[derive(Copy, Clone, Debug)]
#[allow(clippy::struct_excessive_bools)] // independent hardware quirk flags
pub struct DeviceCaps {
    /// Hardware generation.
    pub generation: u8,
    /// Whether the part has a coherent last-level cache. Without one, the
    /// address-space allocator must keep differently cached neighbors a
    /// guard page apart.
    pub has_llc: bool,
    /// Whether private per-context address spaces are supported.
    pub has_private_vm: bool,
    /// Whether fixed-function table updates must drain in-flight GPU
    /// accesses first.
    pub needs_idle_drain: bool,
    /// Whether the set-context command must be fenced by disabling and
    /// re-enabling pipeline arbitration (a documented hazard on some
    /// generations).
    pub needs_arbitration_gate: bool,
    /// Size of a context's saved-state object in bytes; zero on parts
    /// whose contexts carry no saved state.
    pub context_state_size: u64,
}
