//! # Device Lock
//!
//! One coarse-grained spin lock serializing every entry point of the
//! resource layer. Switches and lifecycle operations are rare next to
//! per-command submission, and the hardware exposes a single current-context
//! register per ring, so a single lock removes a whole class of races at
//! negligible cost. Code running under the lock may use plain integers for
//! reference and pin counts.

#![cfg_attr(not(test), no_std)]

mod spin_lock;

pub use crate::spin_lock::{SpinLock, SpinLockGuard};
