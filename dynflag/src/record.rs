//! The flag record table: immutable, compiled-in metadata describing every
//! guarded call site ("hook") in the binary.
//!
//! Records are emitted by an external codegen step, one per call site, into a
//! single static table. When a guarded function is inlined, each instantiation
//! gets its own record, so duplicate names are expected and are never
//! coalesced.

use static_assertions::const_assert_eq;
use std::ffi::{c_char, CStr};
use std::ops::Range;

/// Which of a hook's two physical encodings the codegen step baked into the
/// instruction stream, and which the registry installs when it initialises.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DefaultEncoding {
    /// The fall-through encoding: execution skips the cold block.
    Inactive = 0,
    /// The taken encoding: execution enters the cold block.
    Active = 1,
}

/// One guarded call site.
///
/// The layout is fixed so that the codegen step can assemble records directly
/// into a data section. All fields are immutable for the life of the process;
/// the mutable per-record counters live in the registry's state table,
/// addressed by the record's position in the [FlagTable].
#[repr(C)]
pub struct FlagRecord {
    /// Address of the instruction to patch. For the jump/test strategy this
    /// is the opcode byte itself; for the move-immediate strategy the
    /// immediate field sits one or two bytes further on and the patcher scans
    /// for it.
    hook: *mut u8,
    /// Address of the cold block the hook jumps to when active, or null for
    /// strategies that encode the flag value inline.
    destination: *mut u8,
    /// The flag name `kind:name@file:line` as a NUL-terminated string,
    /// followed immediately by a second NUL-terminated string holding the
    /// docstring. A missing docstring is an empty string, so there are always
    /// two terminators.
    name_doc: *const c_char,
    /// The encoding the registry writes at initialisation.
    default_encoding: DefaultEncoding,
    /// Flipped records run their cold block while *inactive* (activation
    /// count of zero) and fall through once activated.
    flipped: bool,
    _pad: [u8; 6],
}

#[cfg(target_pointer_width = "64")]
const_assert_eq!(std::mem::size_of::<FlagRecord>(), 32);

// Records only carry addresses and immutable metadata. The hook bytes they
// point at are only ever written under the registry lock.
unsafe impl Send for FlagRecord {}
unsafe impl Sync for FlagRecord {}

impl FlagRecord {
    /// Create a record for the static table.
    ///
    /// # Safety
    ///
    /// `hook` (and `destination`, where the patch strategy uses one) must
    /// address a genuine patchable call site emitted by the codegen step, and
    /// `name_doc` must point to a name string followed by an adjacent
    /// docstring, both NUL-terminated, with `'static` lifetime.
    pub const unsafe fn new(
        hook: *mut u8,
        destination: *mut u8,
        name_doc: *const c_char,
        default_encoding: DefaultEncoding,
        flipped: bool,
    ) -> Self {
        Self {
            hook,
            destination,
            name_doc,
            default_encoding,
            flipped,
            _pad: [0; 6],
        }
    }

    pub(crate) fn hook(&self) -> *mut u8 {
        self.hook
    }

    pub fn hook_addr(&self) -> usize {
        self.hook as usize
    }

    pub fn destination_addr(&self) -> usize {
        self.destination as usize
    }

    pub fn default_encoding(&self) -> DefaultEncoding {
        self.default_encoding
    }

    pub fn flipped(&self) -> bool {
        self.flipped
    }

    /// The full flag name `kind:name@file:line`.
    pub fn name(&self) -> &'static CStr {
        unsafe { CStr::from_ptr(self.name_doc) }
    }

    pub fn name_str(&self) -> &'static str {
        self.name().to_str().unwrap()
    }

    /// The docstring stored immediately after the name. Empty when the flag
    /// was declared without one.
    pub fn doc(&self) -> &'static CStr {
        unsafe { CStr::from_ptr(self.name_doc.add(self.name().to_bytes().len() + 1)) }
    }

    pub fn doc_str(&self) -> &'static str {
        self.doc().to_str().unwrap()
    }
}

impl std::fmt::Debug for FlagRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlagRecord")
            .field("name", &self.name_str())
            .field("hook", &self.hook)
            .field("destination", &self.destination)
            .field("default_encoding", &self.default_encoding)
            .field("flipped", &self.flipped)
            .finish()
    }
}

/// A compile-time partition of the record table: a contiguous sub-range of
/// records sharing a kind tag.
///
/// The codegen step guarantees that every declared kind has at least one
/// record; requesting operations on a kind that no call site uses is a build
/// failure, not a runtime condition.
#[derive(Debug)]
pub struct FlagKind {
    name: &'static str,
    first: usize,
    len: usize,
}

impl FlagKind {
    pub const fn new(name: &'static str, first: usize, len: usize) -> Self {
        Self { name, first, len }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn range(&self) -> Range<usize> {
        self.first..self.first + self.len
    }
}

/// The static table of every flag record in the binary, with its kind
/// partitions. Built once by the codegen step; never resized.
#[derive(Debug)]
pub struct FlagTable {
    records: &'static [FlagRecord],
    kinds: &'static [FlagKind],
}

impl FlagTable {
    pub const fn new(records: &'static [FlagRecord], kinds: &'static [FlagKind]) -> Self {
        Self { records, kinds }
    }

    pub fn records(&self) -> &'static [FlagRecord] {
        self.records
    }

    pub fn kinds(&self) -> &'static [FlagKind] {
        self.kinds
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil;

    #[test]
    fn name_and_doc_adjacency() {
        let r = testutil::record(
            0x1000 as *mut u8,
            std::ptr::null_mut(),
            "feature:shiny@src/lib.rs:42",
            "An example flag.",
            super::DefaultEncoding::Inactive,
            false,
        );
        assert_eq!(r.name_str(), "feature:shiny@src/lib.rs:42");
        assert_eq!(r.doc_str(), "An example flag.");
    }

    #[test]
    fn empty_doc() {
        let r = testutil::record(
            0x1000 as *mut u8,
            std::ptr::null_mut(),
            "feature:plain@src/lib.rs:7",
            "",
            super::DefaultEncoding::Inactive,
            false,
        );
        assert_eq!(r.doc_str(), "");
    }
}
