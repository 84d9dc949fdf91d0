//! The no-patching fallback: every flag is frozen at its compile-time
//! default. The registry short-circuits before allocating state or touching
//! any hook, so `patch`/`unpatch` are never reached.

use crate::record::FlagRecord;

pub(crate) const AVAILABLE: bool = false;
/// Unused: no hook is ever batched for patching.
pub(crate) const HOOK_SIZE: usize = 1;

pub(crate) unsafe fn patch(_record: &FlagRecord) {}

pub(crate) unsafe fn unpatch(_record: &FlagRecord) {}
