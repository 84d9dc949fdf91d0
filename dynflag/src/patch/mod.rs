//! Architecture-specific hook patching.
//!
//! Exactly one strategy is compiled in as `active`:
//!
//!  * [jump]: the preferred x86_64 encoding. A hook is a fixed 5-byte
//!    instruction whose trailing 4 bytes are a rel32 displacement to the cold
//!    block; flipping rewrites only the leading opcode byte.
//!  * [imm]: the fallback x86_64 encoding (`imm-hooks` feature). A hook is a
//!    move-immediate whose 8-bit operand holds the flag value.
//!  * [noop]: no dynamic patching. Selected on other targets or with the
//!    `static-flags` feature; every flag keeps its compile-time default.
//!
//! Patching happens while other threads may be executing the hook, so a
//! strategy must keep both encodings the same length, differing only in a
//! single byte that can be written atomically. A concurrently executing core
//! then observes either the old or the new instruction, never a torn hybrid.
//!
//! # Warning
//!
//! These modules write to executable memory. The caller is responsible for
//! making the hook's page(s) writable first (see [crate::commit]) and for
//! holding the registry lock so that writes are serialised.

use crate::record::FlagRecord;

#[cfg(any(not(target_arch = "x86_64"), feature = "static-flags"))]
pub(crate) mod noop;
#[cfg(any(not(target_arch = "x86_64"), feature = "static-flags"))]
pub(crate) use noop as active;

#[cfg(all(target_arch = "x86_64", not(feature = "static-flags")))]
#[cfg_attr(not(any(test, feature = "imm-hooks")), allow(dead_code))]
pub(crate) mod imm;
#[cfg(all(target_arch = "x86_64", not(feature = "static-flags"), feature = "imm-hooks"))]
pub(crate) use imm as active;

#[cfg(all(target_arch = "x86_64", not(feature = "static-flags")))]
#[cfg_attr(all(feature = "imm-hooks", not(test)), allow(dead_code))]
pub(crate) mod jump;
#[cfg(all(
    target_arch = "x86_64",
    not(feature = "static-flags"),
    not(feature = "imm-hooks")
))]
pub(crate) use jump as active;

/// Make sure other cores observe a freshly written hook.
///
/// x86_64 keeps instruction caches coherent with data writes, so there is
/// nothing to flush; there remains a short window in which another core may
/// still execute the previous encoding, which callers must treat as eventual
/// consistency. A port to an architecture with incoherent instruction caches
/// must flush the hook's byte range here.
#[inline]
pub(crate) fn invalidate(_record: &FlagRecord) {}

/// The bytes at a hook did not match either expected encoding. That means
/// memory corruption, a mismatched build, or a compiler transformation the
/// codegen step did not anticipate. Executing unknown bytes as code is worse
/// than dying, so abort.
#[cfg(all(target_arch = "x86_64", not(feature = "static-flags")))]
fn hook_corrupt(record: &FlagRecord, detail: &str) -> ! {
    eprintln!(
        "dynflag: fatal: hook for {} at {:#x} is corrupt: {detail}",
        record.name_str(),
        record.hook_addr()
    );
    std::process::abort();
}
