//! # Device Facade and Switch Sequencer
//!
//! Owns the global address space, the context arena, the handle table and
//! the rings, and implements every entry point of the resource layer.
//! [`Gpu`] wraps the whole device in the single device-wide lock; inside,
//! reference and pin counts are plain integers.
//!
//! The switch protocol lives in [`Device::do_switch`]. Its one subtle rule:
//! pinning the target's state can evict, eviction idles the GPU, and
//! idling parks every ring on its default context first — so the ring
//! being switched may change `current` *during* the pin step. The value
//! captured before pinning is stale and must be re-read.

use crate::DeviceCaps;
use crate::buffer::{BufferHandle, BufferService};
use crate::context::{Context, ContextTable, CtxId, Vm};
use crate::handle::HandleTable;
use crate::ring::{CommandStream, EmitError, Ring, RingId, ring_mmio_base};
use crate::switch::{self, L3LOG_ROWS, SetContextFlags};
use crate::ContextHandle;
use alloc::boxed::Box;
use alloc::vec::Vec;
use igfx_gtt::{
    AddressSpace, AperturePort, BindError, DmaAddress, GttEntry, PAGE_SHIFT, PAGE_SIZE,
    SoftTable, TableBacking,
};
use igfx_mm::{align_up, AllocError, Range};
use igfx_sync::SpinLock;

/// Extent of a private per-context address space.
const PRIVATE_VM_SIZE: u64 = 16 << 20;

/// Bytes per translation entry in a software table.
const GTT_ENTRY_BYTES: u64 = 8;

/// A context's state object could not be made resident.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PinError {
    /// No address-space range was free, and nothing could be evicted.
    #[error(transparent)]
    NoSpace(#[from] AllocError),
    /// The translation entries could not be installed.
    #[error(transparent)]
    Bind(#[from] BindError),
    /// The eviction path could not park a ring on its default context.
    #[error("eviction fallback switch failed: {0}")]
    Fallback(#[from] EmitError),
}

/// A switch was aborted. `current` is unchanged and, for a rejection in
/// the pin step with nothing evictable, no commands were emitted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum SwitchError {
    /// Preconditions failed (most commonly a pin failure cascading from
    /// allocation or bind).
    #[error("switch rejected: {0}")]
    Rejected(#[source] PinError),
    /// The switch sequence itself could not be reserved on the ring.
    #[error("switch rejected: {0}")]
    Emit(#[source] EmitError),
}

/// Context creation failed; nothing was allocated.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CreateError {
    /// No backing memory for the saved-state object.
    #[error("no memory for the context state object")]
    StateObject,
    /// The device cannot isolate per-context address spaces.
    #[error("private address spaces are not supported on this device")]
    PrivateVmUnsupported,
    /// No room in the global space for the private page directory.
    #[error("no room for the private page directory: {0}")]
    PageDirectory(#[source] AllocError),
}

/// Device bring-up failed while creating the per-ring default contexts.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum InitError {
    /// A default context could not be created.
    #[error("default context: {0}")]
    Create(#[from] CreateError),
    /// A default context's state could not be made permanently resident.
    #[error("default context pin: {0}")]
    Pin(#[from] PinError),
}

/// Global-address-space layout handed to [`Device::new`].
pub struct GttConfig {
    /// First address of the extent.
    pub start: u64,
    /// Extent size in bytes, including the trailing guard page.
    pub size: u64,
    /// The always-valid scratch page.
    pub scratch: DmaAddress,
    /// The host's fixed-function table, when the device has one. Without
    /// it the global space is software-backed.
    pub aperture: Option<Box<dyn AperturePort>>,
}

/// An object's residency in the global space.
struct Binding {
    /// The bound object; `None` for a private page-directory reservation.
    object: Option<BufferHandle>,
    /// The context whose state this is, for eviction accounting.
    owner: Option<CtxId>,
    range: Range,
    /// Pinned bindings are never evicted.
    pinned: bool,
}

/// The resource layer. All methods expect to run under the device lock;
/// use [`Gpu`] unless you already hold one.
pub struct Device<S: CommandStream, B: BufferService> {
    caps: DeviceCaps,
    buffers: B,
    ggtt: AddressSpace,
    scratch: DmaAddress,
    bindings: Vec<Binding>,
    contexts: ContextTable,
    handles: HandleTable<CtxId>,
    rings: Vec<Ring<S>>,
    l3_rows: [u32; L3LOG_ROWS],
}

impl<S: CommandStream, B: BufferService> Device<S, B> {
    /// Bring up the resource layer: build the global address space over
    /// `gtt`, then create and permanently pin one default context per
    /// command stream.
    ///
    /// # Errors
    /// [`InitError`] when a default context cannot be created or pinned.
    pub fn new(
        caps: DeviceCaps,
        buffers: B,
        gtt: GttConfig,
        streams: Vec<S>,
    ) -> Result<Self, InitError> {
        let backing = match gtt.aperture {
            Some(port) => TableBacking::Aperture(port),
            None => {
                #[allow(clippy::cast_possible_truncation)]
                let pages = (gtt.size >> PAGE_SHIFT) as usize;
                TableBacking::Table(SoftTable::new(pages))
            }
        };
        let ggtt = AddressSpace::global(
            gtt.start,
            gtt.size,
            backing,
            gtt.scratch,
            !caps.has_llc,
            caps.needs_idle_drain,
        );
        let mut device = Self {
            caps,
            buffers,
            ggtt,
            scratch: gtt.scratch,
            bindings: Vec::new(),
            contexts: ContextTable::new(),
            handles: HandleTable::new(),
            rings: Vec::new(),
            l3_rows: [0; L3LOG_ROWS],
        };
        for (index, stream) in streams.into_iter().enumerate() {
            let (default_ctx, _) = device.create_record(false, true)?;
            device.pin_state(default_ctx)?;
            device.rings.push(Ring {
                stream,
                mmio_base: ring_mmio_base(index),
                current: None,
                default_ctx,
            });
        }
        log::info!(
            "context layer up: {} ring(s), gen {}",
            device.rings.len(),
            device.caps.generation
        );
        Ok(device)
    }

    /// Create a context with one reference held by the caller.
    ///
    /// # Errors
    /// [`CreateError`]; nothing is left allocated on failure.
    pub fn create_context(&mut self, private: bool) -> Result<ContextHandle, CreateError> {
        let (_, handle) = self.create_record(private, false)?;
        Ok(handle)
    }

    /// Take an additional reference.
    pub fn add_reference(&mut self, ctx: ContextHandle) {
        let id = self.resolve(ctx);
        self.contexts.get_mut(id).ref_count += 1;
    }

    /// Drop one reference; teardown runs inline when the count hits zero.
    pub fn release(&mut self, ctx: ContextHandle) {
        let id = self.resolve(ctx);
        self.release_id(id);
    }

    /// Change what `ring` is currently executing as.
    ///
    /// # Errors
    /// [`SwitchError`]; on failure `current` is unchanged and no partial
    /// switch sequence has reached the hardware.
    ///
    /// # Panics
    /// On an unknown ring or a stale context handle; both are driver bugs.
    pub fn switch_to(&mut self, ring: RingId, ctx: ContextHandle) -> Result<(), SwitchError> {
        assert!(ring.0 < self.rings.len(), "unknown ring {ring:?}");
        let target = self.resolve(ctx);
        self.do_switch(ring.0, target)
    }

    /// Forcibly clear every ring's current context without waiting for
    /// hardware acknowledgment. Used after a detected GPU hang; the next
    /// switch on any affected ring takes the full restore-inhibited path.
    pub fn reset_all_rings(&mut self) {
        log::warn!("resetting all rings");
        for index in 0..self.rings.len() {
            if let Some(current) = self.rings[index].current.take() {
                // The saved state of a wedged context cannot be trusted.
                self.contexts.get_mut(current).initialized = false;
                self.unpin_state(current);
                self.release_id(current);
            }
        }
    }

    /// Install the row values later switches program for every remapped
    /// slice. Typically followed by [`request_remap`](Self::request_remap)
    /// so live contexts pick the new values up.
    pub fn set_remap_rows(&mut self, rows: [u32; L3LOG_ROWS]) {
        self.l3_rows = rows;
    }

    /// Queue a remap of the given slices for every live context. The
    /// commands are emitted on each context's next switch-in.
    pub fn request_remap(&mut self, slice_mask: u32) {
        log::debug!("queueing remap for slices {slice_mask:#x}");
        for ctx in self.contexts.iter_mut() {
            ctx.remap_pending |= slice_mask;
        }
    }

    /// The context currently executing on `ring`, as a user handle.
    #[must_use]
    pub fn current_context(&self, ring: RingId) -> Option<ContextHandle> {
        let id = self.rings[ring.0].current?;
        self.contexts.get(id).handle
    }

    /// The default context of `ring`.
    ///
    /// # Panics
    /// On an unknown ring.
    #[must_use]
    pub fn default_context(&self, ring: RingId) -> ContextHandle {
        let id = self.rings[ring.0].default_ctx;
        self.contexts.get(id).handle.expect("default has a handle")
    }

    /// Borrow the command stream of `ring` (inspection).
    #[must_use]
    pub fn stream(&self, ring: RingId) -> &S {
        &self.rings[ring.0].stream
    }

    /// Borrow the command stream of `ring` mutably, for submission paths
    /// layered on top of this crate.
    pub fn stream_mut(&mut self, ring: RingId) -> &mut S {
        &mut self.rings[ring.0].stream
    }

    /// Run `f` against the buffer service.
    pub fn with_buffers<R>(&mut self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.buffers)
    }

    /// Borrow a context's private address space, for the submission path
    /// that binds execution objects into it. `None` for contexts sharing
    /// the global space.
    pub fn private_space_mut(&mut self, ctx: ContextHandle) -> Option<&mut AddressSpace> {
        let id = self.resolve(ctx);
        match &mut self.contexts.get_mut(id).vm {
            Vm::Private { space, .. } => Some(space),
            Vm::Global => None,
        }
    }

    /// Where a context's state object is bound in the global space.
    #[must_use]
    pub fn state_binding(&self, ctx: ContextHandle) -> Option<Range> {
        let id = self.resolve(ctx);
        let state = self.contexts.get(id).state?;
        self.binding_of(state)
    }

    /// Free capacity of the global space.
    #[must_use]
    pub fn global_free_capacity(&self) -> u64 {
        self.ggtt.free_capacity()
    }

    /// Read back a global translation entry (software backing only).
    #[must_use]
    pub fn global_entry_at(&self, addr: u64) -> Option<GttEntry> {
        self.ggtt.entry_at(addr)
    }

    fn resolve(&self, handle: ContextHandle) -> CtxId {
        *self.handles.get(handle).expect("unknown context handle")
    }

    fn create_record(
        &mut self,
        private: bool,
        is_default: bool,
    ) -> Result<(CtxId, ContextHandle), CreateError> {
        if private && !self.caps.has_private_vm {
            return Err(CreateError::PrivateVmUnsupported);
        }
        let state = if self.caps.context_state_size > 0 {
            Some(
                self.buffers
                    .alloc_state_object(self.caps.context_state_size)
                    .ok_or(CreateError::StateObject)?,
            )
        } else {
            None
        };
        let vm = if private {
            let table_bytes = (PRIVATE_VM_SIZE >> PAGE_SHIFT) * GTT_ENTRY_BYTES;
            let pd_bytes = align_up(table_bytes, PAGE_SIZE);
            match self.ggtt.allocate(pd_bytes, PAGE_SIZE, 0) {
                Ok(pd) => {
                    self.bindings.push(Binding {
                        object: None,
                        owner: None,
                        range: pd,
                        pinned: true,
                    });
                    Vm::Private {
                        space: AddressSpace::private(PRIVATE_VM_SIZE, self.scratch),
                        pd,
                    }
                }
                Err(e) => {
                    if let Some(state) = state {
                        self.buffers.free_state_object(state);
                    }
                    return Err(CreateError::PageDirectory(e));
                }
            }
        } else {
            Vm::Global
        };
        let id = self.contexts.alloc(Context {
            ref_count: 1,
            pin_count: 0,
            initialized: false,
            remap_pending: 0,
            state,
            vm,
            handle: None,
            is_default,
        });
        let handle = self.handles.insert(id);
        self.contexts.get_mut(id).handle = Some(handle);
        log::info!("created context {id:?} (private={private})");
        Ok((id, handle))
    }

    fn release_id(&mut self, id: CtxId) {
        let ctx = self.contexts.get_mut(id);
        assert!(ctx.ref_count > 0, "context reference count underflow");
        ctx.ref_count -= 1;
        if ctx.ref_count == 0 {
            self.teardown(id);
        }
    }

    /// Runs exactly once, the instant the last reference is dropped.
    fn teardown(&mut self, id: CtxId) {
        debug_assert!(
            self.rings.iter().all(|r| r.current != Some(id)),
            "teardown of a context still current on a ring"
        );
        let ctx = self.contexts.free(id);
        assert_eq!(ctx.pin_count, 0, "context destroyed while pinned");
        if let Some(state) = ctx.state {
            if let Some(pos) = self
                .bindings
                .iter()
                .position(|b| b.object == Some(state))
            {
                let binding = self.bindings.swap_remove(pos);
                self.ggtt.unbind(binding.range);
                self.ggtt.release(binding.range);
            }
            self.buffers.free_state_object(state);
        }
        if let Vm::Private { pd, .. } = ctx.vm {
            if let Some(pos) = self
                .bindings
                .iter()
                .position(|b| b.object.is_none() && b.range == pd)
            {
                self.bindings.swap_remove(pos);
            }
            self.ggtt.release(pd);
        }
        if let Some(handle) = ctx.handle {
            self.handles.remove(handle);
        }
        log::info!("destroyed context {id:?}");
    }

    /// The switch protocol. Caller holds the device lock.
    fn do_switch(&mut self, r: usize, target: CtxId) -> Result<(), SwitchError> {
        // Step 1: idempotent fast path, zero commands.
        if self.rings[r].current == Some(target)
            && self.contexts.get(target).remap_pending == 0
        {
            log::trace!("ring {r}: context already current");
            return Ok(());
        }

        // Step 2: make the target's state resident. This may evict, and
        // eviction parks every ring — including this one — on its default
        // context first.
        self.pin_state(target).map_err(SwitchError::Rejected)?;

        // The pre-pin `current` is stale now; re-read it.
        let from = self.rings[r].current;

        // Steps 3-5: one contiguous reservation on the ring.
        let target_ctx = self.contexts.get(target);
        let vm_pd_base = match &target_ctx.vm {
            Vm::Private { pd, .. } => Some(pd.start),
            Vm::Global => None,
        };
        let set_context = target_ctx.state.map(|state| {
            let bound = self
                .binding_of(state)
                .expect("pinned state object must be bound");
            let mut flags = SetContextFlags::RESTORE_EXT_STATE | SetContextFlags::SAVE_EXT_STATE;
            if !target_ctx.initialized {
                flags |= SetContextFlags::RESTORE_INHIBIT;
            }
            if from == Some(target) {
                // The hardware skips the restore when the context address
                // is unchanged; a remap retry must reload regardless.
                flags |= SetContextFlags::FORCE_RESTORE;
            }
            (bound.start, flags)
        });
        if let Err(e) = switch::emit_switch(
            &mut self.rings[r],
            vm_pd_base,
            set_context,
            self.caps.needs_arbitration_gate,
        ) {
            self.unpin_state(target);
            return Err(SwitchError::Emit(e));
        }

        // Step 6: retry pending per-slice remaps. Deferral is non-fatal;
        // bits that fail to emit stay set for the next switch.
        let mut pending = self.contexts.get(target).remap_pending;
        let rows = self.l3_rows;
        for slice in 0..u32::BITS {
            let bit = 1_u32 << slice;
            if pending & bit != 0 {
                match switch::emit_l3_remap(&mut self.rings[r], slice, &rows) {
                    Ok(()) => pending &= !bit,
                    Err(e) => log::warn!("ring {r}: slice {slice} remap deferred: {e}"),
                }
            }
        }
        self.contexts.get_mut(target).remap_pending = pending;

        // Step 7: bookkeeping and reference hand-over.
        self.contexts.get_mut(target).initialized = true;
        if from == Some(target) {
            // The eviction path already made the target current; drop the
            // transient pin taken in step 2.
            self.unpin_state(target);
            return Ok(());
        }
        // Hand the ring over before dropping the outgoing reference: the
        // ring must no longer name `prev` when a last-reference release
        // tears it down.
        self.contexts.get_mut(target).ref_count += 1;
        self.rings[r].current = Some(target);
        if let Some(prev) = from {
            if let Some(state) = self.contexts.get(prev).state {
                // The outgoing image now contains GPU-written state; CPU
                // reads must sync through the buffer service first.
                self.buffers.mark_gpu_written(state);
            }
            self.unpin_state(prev);
            self.release_id(prev);
        }
        log::debug!("ring {r}: switched to context {target:?}");
        Ok(())
    }

    /// Make a context's state object resident in the global space and pin
    /// it. Contexts without saved state have nothing to pin.
    fn pin_state(&mut self, id: CtxId) -> Result<(), PinError> {
        let Some(state) = self.contexts.get(id).state else {
            return Ok(());
        };
        if let Some(binding) = self
            .bindings
            .iter_mut()
            .find(|b| b.object == Some(state))
        {
            binding.pinned = true;
            self.contexts.get_mut(id).pin_count += 1;
            return Ok(());
        }

        let size = self.buffers.size(state);
        let level = self.buffers.cache_level(state);
        let range = match self.ggtt.allocate(size, PAGE_SIZE, level.color()) {
            Ok(range) => range,
            Err(no_space) => {
                if !self.any_evictable() {
                    return Err(PinError::NoSpace(no_space));
                }
                self.idle_and_evict()?;
                self.ggtt.allocate(size, PAGE_SIZE, level.color())?
            }
        };
        // Fresh image written by the CPU: make it visible before first use.
        self.buffers.flush_cpu_cache(state);
        if let Err(e) = self.ggtt.bind(self.buffers.backing_segments(state), range, level) {
            self.ggtt.release(range);
            return Err(PinError::Bind(e));
        }
        self.bindings.push(Binding {
            object: Some(state),
            owner: Some(id),
            range,
            pinned: true,
        });
        self.contexts.get_mut(id).pin_count += 1;
        Ok(())
    }

    fn unpin_state(&mut self, id: CtxId) {
        let Some(state) = self.contexts.get(id).state else {
            return;
        };
        let ctx = self.contexts.get_mut(id);
        assert!(ctx.pin_count > 0, "context pin count underflow");
        ctx.pin_count -= 1;
        if ctx.pin_count == 0
            && let Some(binding) = self
                .bindings
                .iter_mut()
                .find(|b| b.object == Some(state))
        {
            binding.pinned = false;
        }
    }

    fn binding_of(&self, object: BufferHandle) -> Option<Range> {
        self.bindings
            .iter()
            .find(|b| b.object == Some(object))
            .map(|b| b.range)
    }

    /// Whether eviction could free anything: an already unpinned binding,
    /// or one pinned only because its owner is current on a ring (parking
    /// that ring on its default context releases it).
    fn any_evictable(&self) -> bool {
        self.bindings.iter().any(|binding| {
            if !binding.pinned {
                return true;
            }
            let Some(owner) = binding.owner else {
                return false;
            };
            let ctx = self.contexts.get(owner);
            if ctx.is_default || ctx.pin_count == 0 {
                return false;
            }
            #[allow(clippy::cast_possible_truncation)]
            let current_on = self
                .rings
                .iter()
                .filter(|ring| ring.current == Some(owner))
                .count() as u32;
            ctx.pin_count == current_on
        })
    }

    /// Park every ring on its default context, drain the GPU, then drop
    /// every unpinned binding back to scratch. The fallback switches are
    /// the reason callers of the pin path must re-read `current`.
    fn idle_and_evict(&mut self) -> Result<(), EmitError> {
        log::debug!("global space full: idling and evicting");
        for index in 0..self.rings.len() {
            let default_ctx = self.rings[index].default_ctx;
            if self.rings[index].current != Some(default_ctx) {
                match self.do_switch(index, default_ctx) {
                    Ok(()) => {}
                    Err(SwitchError::Emit(e)) => return Err(e),
                    Err(SwitchError::Rejected(_)) => {
                        unreachable!("default context state is permanently resident")
                    }
                }
            }
        }
        for ring in &mut self.rings {
            ring.stream.idle_wait();
        }
        let drained = core::mem::take(&mut self.bindings);
        for binding in drained {
            if binding.pinned {
                self.bindings.push(binding);
            } else {
                self.ggtt.unbind(binding.range);
                self.ggtt.release(binding.range);
            }
        }
        Ok(())
    }
}

/// The device behind the single device-wide lock of the resource layer.
///
/// Every entry point acquires the lock for the whole operation, so the
/// hardware commands of one switch reach the ring as one uninterrupted
/// sequence and no lifecycle operation observes a half-finished switch.
pub struct Gpu<S: CommandStream, B: BufferService> {
    inner: SpinLock<Device<S, B>>,
}

impl<S: CommandStream, B: BufferService> Gpu<S, B> {
    /// Wrap an initialized device.
    #[must_use]
    pub const fn new(device: Device<S, B>) -> Self {
        Self {
            inner: SpinLock::new(device),
        }
    }

    /// Run `f` under the device lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut Device<S, B>) -> R) -> R {
        self.inner.with_lock(f)
    }

    /// See [`Device::create_context`].
    ///
    /// # Errors
    /// [`CreateError`].
    pub fn create_context(&self, private: bool) -> Result<ContextHandle, CreateError> {
        self.with(|d| d.create_context(private))
    }

    /// See [`Device::add_reference`].
    pub fn add_reference(&self, ctx: ContextHandle) {
        self.with(|d| d.add_reference(ctx));
    }

    /// See [`Device::release`].
    pub fn release(&self, ctx: ContextHandle) {
        self.with(|d| d.release(ctx));
    }

    /// See [`Device::switch_to`].
    ///
    /// # Errors
    /// [`SwitchError`].
    pub fn switch_to(&self, ring: RingId, ctx: ContextHandle) -> Result<(), SwitchError> {
        self.with(|d| d.switch_to(ring, ctx))
    }

    /// See [`Device::reset_all_rings`].
    pub fn reset_all_rings(&self) {
        self.with(Device::reset_all_rings);
    }

    /// See [`Device::set_remap_rows`].
    pub fn set_remap_rows(&self, rows: [u32; L3LOG_ROWS]) {
        self.with(|d| d.set_remap_rows(rows));
    }

    /// See [`Device::request_remap`].
    pub fn request_remap(&self, slice_mask: u32) {
        self.with(|d| d.request_remap(slice_mask));
    }
}
