//! Runtime-toggled feature flags backed by live machine-code patching.
//!
//! Every guarded call site in the binary carries a [FlagRecord] in a static
//! table emitted by an external codegen step. Evaluating a flag on the hot
//! path costs nothing beyond executing whichever of the hook's two encodings
//! is currently installed; flipping a flag rewrites the hook instruction in
//! place, batching memory-protection changes over adjacent pages so that a
//! pattern matching many flags stays cheap.
//!
//! Control operations select flags by name with regular expressions anchored
//! at the start of the full name `kind:name@file:line`:
//!
//! * [FlagRegistry::activate] / [FlagRegistry::deactivate] move a saturating
//!   per-record activation count; the hook's encoding only changes when the
//!   count crosses zero.
//! * [FlagRegistry::unhook] / [FlagRegistry::rehook] move a saturating
//!   override count; while it is non-zero, activations are suppressed.
//! * [FlagRegistry::list] visits point-in-time snapshots.
//!
//! Flag state re-derives from the compiled-in defaults on every process
//! start; nothing is persisted.

mod commit;
mod log;
mod patch;
pub mod record;
mod registry;
mod select;
#[cfg(test)]
pub(crate) mod testutil;

pub use record::{DefaultEncoding, FlagKind, FlagRecord, FlagTable};
pub use registry::{FlagError, FlagRegistry, FlagSnapshot};

use std::error::Error;
use std::ops::ControlFlow;
use std::sync::OnceLock;

static GLOBAL: OnceLock<FlagRegistry> = OnceLock::new();

/// Bind the process-global registry to `table` and initialise it, writing
/// every record's default encoding. Idempotent: later calls (with any table)
/// return the registry created by the first.
pub fn init_global(table: &'static FlagTable) -> Result<&'static FlagRegistry, Box<dyn Error>> {
    let registry = match GLOBAL.get() {
        Some(registry) => registry,
        None => {
            // On a race the loser's registry is dropped before it has any
            // state; only the winner ever patches.
            let registry = FlagRegistry::new(table)?;
            GLOBAL.get_or_init(move || registry)
        }
    };
    registry.init();
    Ok(registry)
}

/// The process-global registry, or `None` before [init_global].
pub fn global() -> Option<&'static FlagRegistry> {
    GLOBAL.get()
}

fn global_or_err() -> Result<&'static FlagRegistry, FlagError> {
    global().ok_or(FlagError::Uninitialised)
}

/// [FlagRegistry::activate] on the process-global registry.
pub fn activate(pattern: &str) -> Result<usize, FlagError> {
    global_or_err()?.activate(pattern)
}

/// [FlagRegistry::deactivate] on the process-global registry.
pub fn deactivate(pattern: &str) -> Result<usize, FlagError> {
    global_or_err()?.deactivate(pattern)
}

/// [FlagRegistry::unhook] on the process-global registry.
pub fn unhook(pattern: &str) -> Result<usize, FlagError> {
    global_or_err()?.unhook(pattern)
}

/// [FlagRegistry::rehook] on the process-global registry.
pub fn rehook(pattern: &str) -> Result<usize, FlagError> {
    global_or_err()?.rehook(pattern)
}

/// [FlagRegistry::list] on the process-global registry.
pub fn list(
    pattern: &str,
    visitor: impl FnMut(&FlagSnapshot) -> ControlFlow<()>,
) -> Result<usize, FlagError> {
    global_or_err()?.list(pattern, visitor)
}
