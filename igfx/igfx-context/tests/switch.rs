//! End-to-end tests of the switch sequencer against fake collaborators:
//! a recording command stream and an in-memory buffer service.

use igfx_context::{
    BufferHandle, BufferService, CommandStream, Device, DeviceCaps, EmitError, Gpu, GttConfig,
    RingId, SetContextFlags, SwitchError,
};
use igfx_gtt::{CacheLevel, DmaAddress, DmaSegment, GttEntry, PAGE_SIZE};

const RING: RingId = RingId(0);
const STATE_SIZE: u64 = 4 * PAGE_SIZE;
const SCRATCH: DmaAddress = DmaAddress::new(0x00de_a000);

// Command encodings, as the hardware defines them.
const MI_NOOP: u32 = 0;
const MI_SET_CONTEXT: u32 = 0x18 << 23;
const MI_ARB_ON_OFF: u32 = 0x08 << 23;
const fn mi_lri(count: u32) -> u32 {
    (0x22 << 23) | (2 * count - 1)
}

/// Records every word; optionally capacity-limited to provoke
/// reservation failures.
struct FakeStream {
    words: Vec<u32>,
    reserved: Option<usize>,
    capacity: usize,
    idle_waits: usize,
}

impl FakeStream {
    fn new() -> Self {
        Self {
            words: Vec::new(),
            reserved: None,
            capacity: usize::MAX,
            idle_waits: 0,
        }
    }
}

impl CommandStream for FakeStream {
    fn begin(&mut self, n_words: usize) -> Result<(), EmitError> {
        assert!(self.reserved.is_none(), "nested begin");
        if n_words > self.capacity {
            return Err(EmitError::RingFull);
        }
        self.capacity -= n_words;
        self.reserved = Some(n_words);
        Ok(())
    }

    fn emit(&mut self, word: u32) {
        let left = self.reserved.as_mut().expect("emit outside begin");
        assert!(*left > 0, "emit past reservation");
        *left -= 1;
        self.words.push(word);
    }

    fn advance(&mut self) {
        assert_eq!(self.reserved.take(), Some(0), "reservation not fully used");
    }

    fn idle_wait(&mut self) {
        self.idle_waits += 1;
    }
}

struct FakeObject {
    segments: Vec<DmaSegment>,
    gpu_written: bool,
    flushes: usize,
}

/// In-memory buffer service with an allocation budget.
struct FakeBuffers {
    objects: Vec<Option<FakeObject>>,
    next_page: u64,
    budget: usize,
}

impl FakeBuffers {
    fn new() -> Self {
        Self {
            objects: Vec::new(),
            next_page: 0x0100_0000,
            budget: usize::MAX,
        }
    }

    fn object(&self, handle: BufferHandle) -> &FakeObject {
        self.objects[handle.0 as usize].as_ref().expect("freed object")
    }
}

impl BufferService for FakeBuffers {
    fn alloc_state_object(&mut self, size: u64) -> Option<BufferHandle> {
        if self.budget == 0 {
            return None;
        }
        self.budget -= 1;
        let addr = DmaAddress::new(self.next_page);
        self.next_page += size;
        let id = u32::try_from(self.objects.len()).unwrap();
        self.objects.push(Some(FakeObject {
            segments: vec![DmaSegment { addr, len: size }],
            gpu_written: false,
            flushes: 0,
        }));
        Some(BufferHandle(id))
    }

    fn free_state_object(&mut self, object: BufferHandle) {
        self.objects[object.0 as usize]
            .take()
            .expect("double free of state object");
    }

    fn size(&self, object: BufferHandle) -> u64 {
        self.object(object).segments.iter().map(|s| s.len).sum()
    }

    fn backing_segments(&self, object: BufferHandle) -> &[DmaSegment] {
        &self.object(object).segments
    }

    fn cache_level(&self, _object: BufferHandle) -> CacheLevel {
        CacheLevel::Llc
    }

    fn mark_gpu_written(&mut self, object: BufferHandle) {
        self.objects[object.0 as usize]
            .as_mut()
            .expect("freed object")
            .gpu_written = true;
    }

    fn flush_cpu_cache(&mut self, object: BufferHandle) {
        self.objects[object.0 as usize]
            .as_mut()
            .expect("freed object")
            .flushes += 1;
    }
}

fn caps() -> DeviceCaps {
    DeviceCaps {
        generation: 7,
        has_llc: true,
        has_private_vm: true,
        needs_idle_drain: false,
        needs_arbitration_gate: true,
        context_state_size: STATE_SIZE,
    }
}

/// A one-ring device over a software-backed global space of
/// `pages` pages (including the trailing guard page).
fn device_with(caps: DeviceCaps, pages: u64) -> Device<FakeStream, FakeBuffers> {
    Device::new(
        caps,
        FakeBuffers::new(),
        GttConfig {
            start: 0,
            size: pages * PAGE_SIZE,
            scratch: SCRATCH,
            aperture: None,
        },
        vec![FakeStream::new()],
    )
    .expect("device init")
}

fn device(pages: u64) -> Device<FakeStream, FakeBuffers> {
    device_with(caps(), pages)
}

/// The operand words of every set-context command on the stream, in order.
fn set_context_operands(words: &[u32]) -> Vec<u32> {
    words
        .iter()
        .zip(words.iter().skip(1))
        .filter(|(cmd, _)| **cmd == MI_SET_CONTEXT)
        .map(|(_, operand)| *operand)
        .collect()
}

#[test]
fn first_switch_emits_restore_inhibited_sequence() {
    let mut dev = device(64);
    let ctx = dev.create_context(false).unwrap();
    dev.switch_to(RING, ctx).unwrap();

    assert_eq!(dev.current_context(RING), Some(ctx));
    let addr = dev.state_binding(ctx).expect("state bound").start;
    let flags = SetContextFlags::RESTORE_INHIBIT
        | SetContextFlags::RESTORE_EXT_STATE
        | SetContextFlags::SAVE_EXT_STATE;
    #[allow(clippy::cast_possible_truncation)]
    let operand = addr as u32 | flags.bits();
    assert_eq!(
        dev.stream(RING).words,
        vec![
            MI_ARB_ON_OFF, // arbitration off
            MI_SET_CONTEXT,
            operand,
            MI_NOOP,
            MI_ARB_ON_OFF | 1, // arbitration back on
        ]
    );
}

#[test]
fn switch_without_arbitration_gate_is_three_words() {
    let mut gen6 = caps();
    gen6.generation = 6;
    gen6.needs_arbitration_gate = false;
    let mut dev = device_with(gen6, 64);
    let ctx = dev.create_context(false).unwrap();
    dev.switch_to(RING, ctx).unwrap();

    let words = &dev.stream(RING).words;
    assert_eq!(words.len(), 3);
    assert_eq!(words[0], MI_SET_CONTEXT);
    assert_eq!(words[2], MI_NOOP);
}

#[test]
fn repeat_switch_is_a_no_op() {
    let mut dev = device(64);
    let ctx = dev.create_context(false).unwrap();
    dev.switch_to(RING, ctx).unwrap();
    let emitted = dev.stream(RING).words.len();

    dev.switch_to(RING, ctx).unwrap();
    assert_eq!(dev.stream(RING).words.len(), emitted);
    assert_eq!(dev.current_context(RING), Some(ctx));
}

#[test]
fn restore_inhibit_is_dropped_after_first_switch_in() {
    let mut dev = device(64);
    let a = dev.create_context(false).unwrap();
    let b = dev.create_context(false).unwrap();
    dev.switch_to(RING, a).unwrap();
    dev.switch_to(RING, b).unwrap();
    dev.switch_to(RING, a).unwrap();

    let operands = set_context_operands(&dev.stream(RING).words);
    assert_eq!(operands.len(), 3);
    let inhibit = SetContextFlags::RESTORE_INHIBIT.bits();
    assert_eq!(operands[0] & inhibit, inhibit, "first switch of a");
    assert_eq!(operands[1] & inhibit, inhibit, "first switch of b");
    assert_eq!(operands[2] & inhibit, 0, "a has trusted saved state now");
}

#[test]
fn rejected_switch_leaves_everything_untouched() {
    // Managed space: 5 pages. The default context's state pins 4, so a
    // second 4-page state cannot fit and nothing is evictable.
    let mut dev = device(6);
    let free_before = dev.global_free_capacity();
    let ctx = dev.create_context(false).unwrap();

    let err = dev.switch_to(RING, ctx).unwrap_err();
    assert!(matches!(err, SwitchError::Rejected(_)));
    assert_eq!(dev.current_context(RING), None);
    assert!(dev.stream(RING).words.is_empty(), "no partial sequence");
    assert_eq!(dev.global_free_capacity(), free_before);

    // The context itself is intact and can be released cleanly.
    dev.release(ctx);
    assert_eq!(dev.global_free_capacity(), free_before);
}

#[test]
fn full_space_parks_ring_on_default_and_evicts() {
    // Managed space: 9 pages = default (4, pinned) + one context (4) + 1.
    let mut dev = device(10);
    let a = dev.create_context(false).unwrap();
    let b = dev.create_context(false).unwrap();

    dev.switch_to(RING, a).unwrap();
    let range_a = dev.state_binding(a).expect("a bound");
    let default_addr = dev
        .state_binding(dev.default_context(RING))
        .expect("default bound")
        .start;

    // No room for b; a is only pinned by virtue of being current, so the
    // sequencer parks the ring on the default context, idles, evicts a,
    // and then completes the switch.
    dev.switch_to(RING, b).unwrap();

    assert_eq!(dev.current_context(RING), Some(b));
    assert_eq!(dev.stream(RING).idle_waits, 1);
    assert_eq!(dev.state_binding(a), None, "a was evicted");
    // Best fit hands b the vacated hole, so the entries that held a's
    // image now carry b's backing.
    assert_eq!(dev.state_binding(b), Some(range_a));
    let b_backing = dev.with_buffers(|bufs| bufs.object(BufferHandle(2)).segments[0].addr);
    let reused = dev.global_entry_at(range_a.start).expect("soft entry");
    assert!(reused.valid());
    assert_eq!(reused.address(), b_backing);

    let operands = set_context_operands(&dev.stream(RING).words);
    assert_eq!(operands.len(), 3);
    let page = |operand: u32| u64::from(operand) & !(PAGE_SIZE - 1);
    assert_eq!(page(operands[0]), range_a.start);
    assert_eq!(page(operands[1]), default_addr, "fallback before target");
    assert_eq!(page(operands[2]), dev.state_binding(b).unwrap().start);

    // a is still alive and can come back, evicting b the same way.
    dev.switch_to(RING, a).unwrap();
    assert_eq!(dev.current_context(RING), Some(a));
    assert_eq!(dev.state_binding(b), None);
}

#[test]
fn release_defers_teardown_until_ring_drops_its_reference() {
    let mut dev = device(64);
    let baseline = dev.global_free_capacity();
    let ctx = dev.create_context(false).unwrap();
    dev.switch_to(RING, ctx).unwrap();
    let range = dev.state_binding(ctx).expect("state bound");

    // The ring still holds a reference: releasing the user handle must
    // not tear the context down under the hardware.
    dev.release(ctx);
    assert_eq!(dev.current_context(RING), Some(ctx));
    assert!(dev.global_free_capacity() < baseline);

    // Switching away hands the ring over and only then drops the last
    // reference; teardown returns the state binding to the allocator and
    // the vacated entries read back as scratch.
    dev.switch_to(RING, dev.default_context(RING)).unwrap();
    assert_eq!(dev.global_free_capacity(), baseline);
    for page in 0..range.size / PAGE_SIZE {
        assert_eq!(
            dev.global_entry_at(range.start + page * PAGE_SIZE),
            Some(GttEntry::scratch(SCRATCH))
        );
    }
}

#[test]
#[should_panic(expected = "unknown context handle")]
fn switching_to_a_destroyed_context_asserts() {
    let mut dev = device(64);
    let ctx = dev.create_context(false).unwrap();
    dev.release(ctx);
    let _ = dev.switch_to(RING, ctx);
}

#[test]
fn reset_affects_only_contexts_that_were_current() {
    let mut dev = device(64);
    let a = dev.create_context(false).unwrap();
    let b = dev.create_context(false).unwrap();
    dev.switch_to(RING, a).unwrap();
    dev.switch_to(RING, b).unwrap();

    // b is current and gets wedged; a was switched away earlier and its
    // saved image is still trustworthy.
    dev.reset_all_rings();
    assert_eq!(dev.current_context(RING), None);

    dev.switch_to(RING, a).unwrap();
    dev.switch_to(RING, b).unwrap();
    let operands = set_context_operands(&dev.stream(RING).words);
    assert_eq!(operands.len(), 4);
    let inhibit = SetContextFlags::RESTORE_INHIBIT.bits();
    assert_eq!(operands[2] & inhibit, 0, "a's image survives the reset");
    assert_eq!(operands[3] & inhibit, inhibit, "b must not be restored from");
}

#[test]
fn remap_is_emitted_on_the_next_switch_in() {
    let mut dev = device(64);
    let ctx = dev.create_context(false).unwrap();
    dev.set_remap_rows([0x1101, 0x2202, 0x3303, 0x4404]);
    dev.request_remap(0b1);
    dev.switch_to(RING, ctx).unwrap();

    let words = &dev.stream(RING).words;
    let lri4 = words
        .iter()
        .position(|&w| w == mi_lri(4))
        .expect("remap register load emitted");
    // Four register/value pairs for slice 0, then the trailing no-op.
    assert_eq!(words[lri4 + 1..=lri4 + 8], [
        0xb070, 0x1101, 0xb074, 0x2202, 0xb078, 0x3303, 0xb07c, 0x4404,
    ]);
    assert_eq!(words[lri4 + 9], MI_NOOP);

    // Queued once, emitted once.
    let emitted = words.len();
    dev.switch_to(RING, ctx).unwrap();
    assert_eq!(dev.stream(RING).words.len(), emitted);
}

#[test]
fn deferred_remap_is_retried_on_a_later_switch() {
    let mut dev = device(64);
    let ctx = dev.create_context(false).unwrap();
    dev.request_remap(0b1);

    // Room for the 5-word switch sequence but not the 10-word remap.
    dev.stream_mut(RING).capacity = 5;
    dev.switch_to(RING, ctx).unwrap();
    assert_eq!(dev.current_context(RING), Some(ctx));
    assert!(!dev.stream(RING).words.contains(&mi_lri(4)));

    // The slice stays pending, so switching to the same context again is
    // not a no-op: it retries the remap, and the repeated set-context must
    // force a reload the hardware would otherwise skip.
    dev.stream_mut(RING).capacity = usize::MAX;
    dev.switch_to(RING, ctx).unwrap();
    assert!(dev.stream(RING).words.contains(&mi_lri(4)));
    let operands = set_context_operands(&dev.stream(RING).words);
    let force = SetContextFlags::FORCE_RESTORE.bits();
    assert_eq!(operands[0] & force, 0);
    assert_eq!(operands[1] & force, force, "switch-to-self reloads");

    let emitted = dev.stream(RING).words.len();
    dev.switch_to(RING, ctx).unwrap();
    assert_eq!(dev.stream(RING).words.len(), emitted, "pending bit cleared");
}

#[test]
fn private_context_loads_its_page_directory() {
    let mut dev = device(8192);
    let ctx = dev.create_context(true).unwrap();
    dev.switch_to(RING, ctx).unwrap();

    let words = &dev.stream(RING).words;
    // Ring 0's page-directory registers, then the set-context run.
    assert_eq!(words[0], mi_lri(2));
    assert_eq!(words[1], 0x2220, "directory control register");
    assert_eq!(words[2], 0xffff_ffff, "full 2 GiB directory valid");
    assert_eq!(words[3], 0x2228, "directory base register");
    assert_eq!(words[5], MI_NOOP);
    assert_eq!(words[6], MI_ARB_ON_OFF);
    assert_eq!(words[7], MI_SET_CONTEXT);
}

#[test]
fn private_space_binds_objects_in_isolation() {
    let mut dev = device(8192);
    let p = dev.create_context(true).unwrap();
    let q = dev.create_context(true).unwrap();

    let segments = [DmaSegment {
        addr: DmaAddress::new(0x0200_0000),
        len: 2 * PAGE_SIZE,
    }];
    let space = dev.private_space_mut(p).expect("private space");
    let range = space.allocate(2 * PAGE_SIZE, PAGE_SIZE, 0).unwrap();
    space.bind(&segments, range, CacheLevel::Llc).unwrap();
    let bound = space.entry_at(range.start).expect("soft entry");
    assert!(bound.valid());
    assert_eq!(bound.address(), DmaAddress::new(0x0200_0000));

    // The same offset in the other context's space still reads scratch.
    let other = dev.private_space_mut(q).expect("private space");
    assert_eq!(
        other.entry_at(range.start).expect("soft entry"),
        other.scratch_entry()
    );

    // Contexts on the shared space carry no private table.
    let shared = dev.create_context(false).unwrap();
    assert!(dev.private_space_mut(shared).is_none());
}

#[test]
fn private_context_requires_hardware_support() {
    let mut no_vm = caps();
    no_vm.has_private_vm = false;
    let mut dev = device_with(no_vm, 64);
    assert!(dev.create_context(true).is_err());
}

#[test]
fn stateless_parts_switch_with_bookkeeping_only() {
    let mut minimal = caps();
    minimal.context_state_size = 0;
    let mut dev = device_with(minimal, 16);
    let baseline = dev.global_free_capacity();

    let ctx = dev.create_context(false).unwrap();
    dev.switch_to(RING, ctx).unwrap();
    assert_eq!(dev.current_context(RING), Some(ctx));
    assert!(dev.stream(RING).words.is_empty(), "nothing to tell the GPU");
    assert_eq!(dev.global_free_capacity(), baseline);
}

#[test]
fn create_fails_cleanly_when_state_memory_runs_out() {
    let mut dev = device(64);
    dev.with_buffers(|b| b.budget = 0);
    assert!(dev.create_context(false).is_err());
    // The device keeps working afterwards.
    dev.with_buffers(|b| b.budget = usize::MAX);
    let ctx = dev.create_context(false).unwrap();
    dev.switch_to(RING, ctx).unwrap();
}

#[test]
fn coherency_hooks_fire_around_the_image_lifecycle() {
    let mut dev = device(64);
    let a = dev.create_context(false).unwrap();
    let b = dev.create_context(false).unwrap();
    dev.switch_to(RING, a).unwrap();
    dev.switch_to(RING, b).unwrap();

    // a's image was flushed before its first bind and marked GPU-written
    // when a was switched out.
    dev.with_buffers(|buffers| {
        let state_a = BufferHandle(1); // 0 is the default context's
        assert_eq!(buffers.object(state_a).flushes, 1);
        assert!(buffers.object(state_a).gpu_written);
    });
}

#[test]
fn locked_facade_serializes_the_same_operations() {
    let dev = device(64);
    let gpu = Gpu::new(dev);
    let ctx = gpu.create_context(false).unwrap();
    gpu.add_reference(ctx);
    gpu.switch_to(RING, ctx).unwrap();
    gpu.release(ctx);
    gpu.with(|d| {
        assert_eq!(d.current_context(RING), Some(ctx));
    });
    gpu.reset_all_rings();
    gpu.with(|d| assert_eq!(d.current_context(RING), None));
}
