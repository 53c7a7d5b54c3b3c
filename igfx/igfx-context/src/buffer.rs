//! # Buffer Object Service Boundary
//!
//! The buffer-object subsystem is an external collaborator: it owns every
//! object's backing pages and CPU-side coherency. This layer only needs
//! the facts required to bind an object and to order CPU reads of
//! GPU-written state. Pin policy deliberately does *not* live here — the
//! device drives pinning so that eviction and the implicit fallback switch
//! stay under the device lock.

use igfx_gtt::{CacheLevel, DmaSegment};

/// Opaque id of a buffer object, issued by the buffer service.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BufferHandle(pub u32);

/// Backing facts and coherency hooks for buffer objects.
pub trait BufferService {
    /// Allocate backing pages for a context saved-state object.
    /// `None` on out-of-memory.
    fn alloc_state_object(&mut self, size: u64) -> Option<BufferHandle>;

    /// Free a state object previously allocated here.
    fn free_state_object(&mut self, object: BufferHandle);

    /// Object size in bytes; a multiple of the page size.
    fn size(&self, object: BufferHandle) -> u64;

    /// The object's physically contiguous backing runs, in mapping order.
    fn backing_segments(&self, object: BufferHandle) -> &[DmaSegment];

    /// The object's cache classification.
    fn cache_level(&self, object: BufferHandle) -> CacheLevel;

    /// Record that the GPU has written the object. Any later CPU read must
    /// go through [`flush_cpu_cache`](Self::flush_cpu_cache), which this
    /// mark orders against.
    fn mark_gpu_written(&mut self, object: BufferHandle);

    /// Make CPU-side writes of the object visible to the GPU (and GPU
    /// writes visible to the CPU).
    fn flush_cpu_cache(&mut self, object: BufferHandle);
}
