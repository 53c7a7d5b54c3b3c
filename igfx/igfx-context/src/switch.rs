//! # Switch Command Encoding
//!
//! The command words the sequencer emits to change what a ring executes
//! as. Everything for one switch is reserved with a single `begin` so the
//! sequence reaches the hardware contiguous or not at all; the device
//! lock keeps other callers from interleaving.

use crate::ring::{CommandStream, EmitError, Ring};

/// Command opcode in bits 28:23, flags below.
const fn mi_instr(opcode: u32, flags: u32) -> u32 {
    (opcode << 23) | flags
}

/// Padding/barrier no-op.
pub const MI_NOOP: u32 = 0;
/// Load the following state-object address and flags as the new context.
pub const MI_SET_CONTEXT: u32 = mi_instr(0x18, 0);
/// Gate command arbitration on or off.
pub const MI_ARB_ON_OFF: u32 = mi_instr(0x08, 0);
/// Arbitration-on operand for [`MI_ARB_ON_OFF`].
pub const MI_ARB_ENABLE: u32 = 1;
/// Arbitration-off operand for [`MI_ARB_ON_OFF`].
pub const MI_ARB_DISABLE: u32 = 0;
/// Page-directory control value: the full 2 GiB directory is valid.
pub const PP_DIR_DCLV_2G: u32 = 0xffff_ffff;

/// Immediate register-write command for `count` register/value pairs.
#[must_use]
pub const fn mi_load_register_imm(count: u32) -> u32 {
    mi_instr(0x22, 2 * count - 1)
}

bitflags::bitflags! {
    /// Flag bits carried in the low bits of the set-context operand (the
    /// state-object address is page aligned, so the low bits are free).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct SetContextFlags: u32 {
        /// Do not restore from the saved state: it has never been written.
        /// Set exactly until the first switch-in completes.
        const RESTORE_INHIBIT = 1 << 0;
        /// Restore even if the hardware believes the context unchanged.
        const FORCE_RESTORE = 1 << 1;
        /// Restore the extended state image.
        const RESTORE_EXT_STATE = 1 << 2;
        /// Save the extended state image on switch-out.
        const SAVE_EXT_STATE = 1 << 3;
    }
}

/// Remap rows emitted per slice.
pub const L3LOG_ROWS: usize = 4;

/// Base of the per-slice remap register blocks.
const L3LOG_BASE: u32 = 0xb070;

/// Remap register for `row` of `slice`.
#[must_use]
pub const fn l3log_reg(slice: u32, row: u32) -> u32 {
    L3LOG_BASE + slice * 0x200 + row * 4
}

/// Emit the hardware part of one switch as a single contiguous sequence:
/// the address-space load (for contexts owning a private space), then the
/// set-context run with its mandatory trailing no-op — the set-context
/// command has a one-instruction-deep hazard window — bracketed by the
/// arbitration gate where the generation demands it.
///
/// Either everything is queued or, on a failed reservation, nothing is.
///
/// # Errors
/// [`EmitError::RingFull`] with no words queued.
pub(crate) fn emit_switch<S: CommandStream>(
    ring: &mut Ring<S>,
    vm_pd_base: Option<u64>,
    set_context: Option<(u64, SetContextFlags)>,
    arbitration_gate: bool,
) -> Result<(), EmitError> {
    let mut words = 0;
    if vm_pd_base.is_some() {
        words += 6;
    }
    if set_context.is_some() {
        words += 3 + if arbitration_gate { 2 } else { 0 };
    }
    if words == 0 {
        // Minimal context on the shared space: nothing to tell the
        // hardware, bookkeeping only.
        return Ok(());
    }
    ring.stream.begin(words)?;

    if let Some(pd_base) = vm_pd_base {
        ring.stream.emit(mi_load_register_imm(2));
        ring.stream.emit(ring.pp_dir_dclv());
        ring.stream.emit(PP_DIR_DCLV_2G);
        ring.stream.emit(ring.pp_dir_base());
        #[allow(clippy::cast_possible_truncation)]
        ring.stream.emit(pd_base as u32);
        ring.stream.emit(MI_NOOP);
    }

    if let Some((state_addr, flags)) = set_context {
        if arbitration_gate {
            ring.stream.emit(MI_ARB_ON_OFF | MI_ARB_DISABLE);
        }
        ring.stream.emit(MI_SET_CONTEXT);
        #[allow(clippy::cast_possible_truncation)]
        ring.stream.emit(state_addr as u32 | flags.bits());
        ring.stream.emit(MI_NOOP);
        if arbitration_gate {
            ring.stream.emit(MI_ARB_ON_OFF | MI_ARB_ENABLE);
        }
    }

    ring.stream.advance();
    Ok(())
}

/// Emit the remap rows for one slice. A failed reservation queues nothing
/// and the caller keeps the slice pending.
///
/// # Errors
/// [`EmitError::RingFull`] with no words queued.
pub(crate) fn emit_l3_remap<S: CommandStream>(
    ring: &mut Ring<S>,
    slice: u32,
    rows: &[u32; L3LOG_ROWS],
) -> Result<(), EmitError> {
    ring.stream.begin(2 + 2 * L3LOG_ROWS)?;
    #[allow(clippy::cast_possible_truncation)]
    ring.stream.emit(mi_load_register_imm(L3LOG_ROWS as u32));
    for (row, value) in rows.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        ring.stream.emit(l3log_reg(slice, row as u32));
        ring.stream.emit(*value);
    }
    ring.stream.emit(MI_NOOP);
    ring.stream.advance();
    Ok(())
}
