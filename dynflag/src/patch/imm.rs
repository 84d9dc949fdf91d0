//! The move-immediate patch strategy.
//!
//! For toolchains that cannot emit an inline destination address, the hook
//! site is a `mov` of an 8-bit immediate into a register; the guarded code
//! tests the moved value. The immediate is one byte after the opcode, or two
//! when the instruction carries a prefix byte, so the patcher probes which
//! encoding is present before writing.
//!
//! 0xf4 is `hlt`, a privileged instruction that should essentially never
//! appear as data in well-formed hooks, which makes a wrong patch location
//! easy to spot.

use crate::record::FlagRecord;

pub(crate) const AVAILABLE: bool = true;
/// Worst case: prefix byte, opcode, immediate.
pub(crate) const HOOK_SIZE: usize = 3;

const VALUE_ACTIVE: u8 = 0xf4;
const VALUE_INACTIVE: u8 = 0x00;

/// Set the hook's immediate to the active sentinel.
///
/// # Safety
///
/// The hook's page(s) must be writable and the caller must hold the registry
/// lock.
pub(crate) unsafe fn patch(record: &FlagRecord) {
    imm_field(record).write_volatile(VALUE_ACTIVE);
}

/// Zero the hook's immediate.
///
/// # Safety
///
/// As [patch].
pub(crate) unsafe fn unpatch(record: &FlagRecord) {
    imm_field(record).write_volatile(VALUE_INACTIVE);
}

/// Locate the immediate operand. If the byte straight after the hook address
/// is not one of the two flag values, the instruction must start with a
/// prefix byte and the immediate is one byte further on.
unsafe fn imm_field(record: &FlagRecord) -> *mut u8 {
    let mut field = record.hook().add(1);
    if field.read() != VALUE_ACTIVE && field.read() != VALUE_INACTIVE {
        field = field.add(1);
    }

    let cur = field.read();
    if cur != VALUE_ACTIVE && cur != VALUE_INACTIVE {
        super::hook_corrupt(record, &format!("immediate {cur:#04x} is not a flag value"));
    }
    field
}
