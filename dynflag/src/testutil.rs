//! Helpers for building synthetic flag tables over mmap-backed hook sites in
//! tests. Everything is leaked: record tables are process-lifetime objects in
//! production and the tests mirror that.

use crate::record::{DefaultEncoding, FlagKind, FlagRecord, FlagTable};
use memmap2::MmapMut;
use std::ffi::c_char;

pub(crate) fn page_size() -> usize {
    usize::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) }).unwrap()
}

/// A writable, page-aligned slab for synthetic hook sites. Page-aligned so
/// the committer's `mprotect` calls only ever touch the slab itself.
pub(crate) fn hook_slab(pages: usize) -> &'static mut [u8] {
    let mmap = MmapMut::map_anon(pages * page_size()).unwrap();
    &mut Box::leak(Box::new(mmap))[..]
}

/// Assemble a 5-byte jump/test hook at `off` whose rel32 reaches a
/// destination 16 bytes into the slot, and return the (hook, destination)
/// addresses.
pub(crate) fn write_jump_site(
    slab: &mut [u8],
    off: usize,
    baked: DefaultEncoding,
) -> (*mut u8, *mut u8) {
    let opcode = match baked {
        DefaultEncoding::Active => 0xe9,
        DefaultEncoding::Inactive => 0xa9,
    };
    slab[off] = opcode;
    // Destination is at off + 16; rel32 is measured from the end of the
    // 5-byte hook.
    slab[off + 1..off + 5].copy_from_slice(&11i32.to_le_bytes());
    let base = slab.as_mut_ptr();
    (unsafe { base.add(off) }, unsafe { base.add(off + 16) })
}

/// Build a record over a leaked `name\0doc\0` buffer.
pub(crate) fn record(
    hook: *mut u8,
    dest: *mut u8,
    name: &str,
    doc: &str,
    default_encoding: DefaultEncoding,
    flipped: bool,
) -> FlagRecord {
    let mut buf = Vec::with_capacity(name.len() + doc.len() + 2);
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    buf.extend_from_slice(doc.as_bytes());
    buf.push(0);
    let name_doc = Box::leak(buf.into_boxed_slice()).as_ptr() as *const c_char;
    unsafe { FlagRecord::new(hook, dest, name_doc, default_encoding, flipped) }
}

pub(crate) fn leak_table(records: Vec<FlagRecord>, kinds: Vec<FlagKind>) -> &'static FlagTable {
    let records: &'static [FlagRecord] = Box::leak(records.into_boxed_slice());
    let kinds: &'static [FlagKind] = Box::leak(kinds.into_boxed_slice());
    Box::leak(Box::new(FlagTable::new(records, kinds)))
}

/// One jump-strategy flag per entry, in 32-byte slots from the start of
/// `slab`: `(name, doc, default encoding, flipped)`.
pub(crate) fn jump_flag_table(
    slab: &mut [u8],
    specs: &[(&str, &str, DefaultEncoding, bool)],
) -> &'static FlagTable {
    let records = specs
        .iter()
        .enumerate()
        .map(|(i, &(name, doc, def, flipped))| {
            let (hook, dest) = write_jump_site(slab, 32 * i, def);
            record(hook, dest, name, doc, def, flipped)
        })
        .collect();
    leak_table(records, vec![])
}
