//! # Context Records
//!
//! The per-context state and the arena that owns it. A context's states
//! are deliberately independent flags, not one enum: `initialized` flips
//! once at the first successful switch-in, while the reference and pin
//! counts track liveness and GPU residency on their own. Teardown runs
//! inline, exactly once, the instant the reference count reaches zero —
//! all mutation happens under the device lock, so no finalizer queue is
//! needed.

use crate::buffer::BufferHandle;
use crate::handle::Handle;
use alloc::vec::Vec;
use igfx_gtt::AddressSpace;
use igfx_mm::Range;

/// Arena id of a context record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CtxId(u32);

impl CtxId {
    #[inline]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// The address space a context executes against.
pub(crate) enum Vm {
    /// A share of the device-lifetime global space.
    Global,
    /// A privately owned space, isolated from every other context.
    Private {
        /// The space itself (always software-backed). The submission path
        /// binds execution objects into it through the device's
        /// private-space accessor; this layer creates it, loads its page
        /// directory at switch time and tears it down with the context.
        space: AddressSpace,
        /// Global-space range reserved for the space's page directory;
        /// its start is what the switch command loads.
        pd: Range,
    },
}

/// One execution context.
pub(crate) struct Context {
    /// Strong references: the creator's handle plus one per ring whose
    /// `current` pointer names this context. Plain integer; mutated only
    /// under the device lock.
    pub ref_count: u32,
    /// GPU residency. Non-zero while the context is current on a ring or
    /// being prepared to become current; default contexts carry one
    /// permanent pin from device init.
    pub pin_count: u32,
    /// False until the first switch-in completes. While false, switches
    /// carry the restore-inhibit flag: prior saved state is not trusted.
    pub initialized: bool,
    /// Slices whose remap commands still need to be emitted; retried on
    /// every switch until emission succeeds.
    pub remap_pending: u32,
    /// Saved hardware state, borrowed from the buffer service. Absent on
    /// parts whose contexts carry no state.
    pub state: Option<BufferHandle>,
    /// Global share or private space.
    pub vm: Vm,
    /// The user-visible id, once issued.
    pub handle: Option<Handle>,
    /// Created at device init as a ring's fallback; never user-released.
    pub is_default: bool,
}

/// Dense arena of context records with a free list.
pub(crate) struct ContextTable {
    slots: Vec<Option<Context>>,
    free: Vec<u32>,
}

impl ContextTable {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn alloc(&mut self, ctx: Context) -> CtxId {
        if let Some(id) = self.free.pop() {
            self.slots[id as usize] = Some(ctx);
            CtxId(id)
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let id = self.slots.len() as u32;
            self.slots.push(Some(ctx));
            CtxId(id)
        }
    }

    /// Borrow a live record. A stale id is a driver bug.
    pub fn get(&self, id: CtxId) -> &Context {
        self.slots[id.index()]
            .as_ref()
            .expect("stale context id")
    }

    pub fn get_mut(&mut self, id: CtxId) -> &mut Context {
        self.slots[id.index()]
            .as_mut()
            .expect("stale context id")
    }

    /// Take a record out for teardown.
    pub fn free(&mut self, id: CtxId) -> Context {
        let ctx = self.slots[id.index()]
            .take()
            .expect("stale context id");
        #[allow(clippy::cast_possible_truncation)]
        self.free.push(id.index() as u32);
        ctx
    }

    /// Iterate all live records.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Context> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Context {
        Context {
            ref_count: 1,
            pin_count: 0,
            initialized: false,
            remap_pending: 0,
            state: None,
            vm: Vm::Global,
            handle: None,
            is_default: false,
        }
    }

    #[test]
    fn arena_reuses_freed_slots() {
        let mut table = ContextTable::new();
        let a = table.alloc(minimal());
        let b = table.alloc(minimal());
        assert_ne!(a, b);
        table.free(a);
        let c = table.alloc(minimal());
        assert_eq!(c, a);
        assert_eq!(table.iter_mut().count(), 2);
    }

    #[test]
    #[should_panic(expected = "stale context id")]
    fn stale_id_asserts() {
        let mut table = ContextTable::new();
        let a = table.alloc(minimal());
        table.free(a);
        let _ = table.get(a);
    }
}
