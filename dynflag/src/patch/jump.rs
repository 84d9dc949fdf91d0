//! The jump/test-swap patch strategy.
//!
//! A hook site is five bytes: `test eax, imm32` (0xa9) when inactive, or
//! `jmp rel32` (0xe9) when active. The trailing four bytes are the rel32
//! displacement to the record's cold block, assembled at build time and
//! identical in both encodings, so the `test` harmlessly consumes them as its
//! immediate and the `jmp` lands on the destination. Flipping a flag is a
//! single store to the opcode byte.

use crate::record::FlagRecord;

pub(crate) const AVAILABLE: bool = true;
pub(crate) const HOOK_SIZE: usize = 5;

/// `jmp rel32`.
const OPCODE_ACTIVE: u8 = 0xe9;
/// `test eax, imm32`.
const OPCODE_INACTIVE: u8 = 0xa9;

/// Switch the hook to the taken encoding: execution enters the cold block.
///
/// # Safety
///
/// The hook's page(s) must be writable and the caller must hold the registry
/// lock.
pub(crate) unsafe fn patch(record: &FlagRecord) {
    set_opcode(record, OPCODE_ACTIVE);
}

/// Switch the hook to the fall-through encoding.
///
/// # Safety
///
/// As [patch].
pub(crate) unsafe fn unpatch(record: &FlagRecord) {
    set_opcode(record, OPCODE_INACTIVE);
}

unsafe fn set_opcode(record: &FlagRecord, opcode: u8) {
    let hook = record.hook();
    let cur = hook.read();
    if cur != OPCODE_ACTIVE && cur != OPCODE_INACTIVE {
        super::hook_corrupt(record, &format!("opcode {cur:#04x} is neither jmp nor test"));
    }

    // The displacement must still point at the cold block the record was
    // assembled with.
    let rel = i64::from(hook.add(1).cast::<i32>().read_unaligned());
    let expected =
        record.destination_addr() as i64 - (record.hook_addr() as i64 + HOOK_SIZE as i64);
    if rel != expected {
        super::hook_corrupt(
            record,
            &format!("rel32 {rel:#x} does not reach the destination (expected {expected:#x})"),
        );
    }

    // A single aligned byte store is atomic on x86_64: other cores see the
    // old or the new instruction in full.
    hook.write_volatile(opcode);
}
