//! End-to-end checks over real, executable hook sites.
//!
//! Each flag gets a 32-byte slot of genuine x86_64 machine code in an
//! anonymous executable mapping: a 5-byte jump/test hook, a fall-through
//! block returning 0, and a cold block returning 1 as the hook's
//! destination. Calling the slot then reports, from the CPU's point of view,
//! whether the guarded (cold) block ran.

#![cfg(all(
    target_arch = "x86_64",
    target_os = "linux",
    not(feature = "static-flags"),
    not(feature = "imm-hooks")
))]

use dynflag::{DefaultEncoding, FlagRecord, FlagRegistry, FlagTable};
use memmap2::MmapMut;
use std::ffi::c_char;
use std::ops::ControlFlow;

const SLOT: usize = 32;

/// Assemble one guarded site at `off`:
///
/// ```text
/// off+0:  a9/e9 rel32     hook; rel32 reaches off+16
/// off+5:  b8 00 00 00 00  mov eax, 0
/// off+10: c3              ret
/// off+16: b8 01 00 00 00  mov eax, 1   (the guarded cold block)
/// off+21: c3              ret
/// ```
fn write_slot(buf: &mut [u8], off: usize, baked: DefaultEncoding) {
    let opcode = match baked {
        DefaultEncoding::Active => 0xe9,
        DefaultEncoding::Inactive => 0xa9,
    };
    buf[off] = opcode;
    buf[off + 1..off + 5].copy_from_slice(&11i32.to_le_bytes());
    buf[off + 5..off + 10].copy_from_slice(&[0xb8, 0x00, 0x00, 0x00, 0x00]);
    buf[off + 10] = 0xc3;
    buf[off + 16..off + 21].copy_from_slice(&[0xb8, 0x01, 0x00, 0x00, 0x00]);
    buf[off + 21] = 0xc3;
}

fn leak_name_doc(name: &str, doc: &str) -> *const c_char {
    let mut buf = Vec::with_capacity(name.len() + doc.len() + 2);
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    buf.extend_from_slice(doc.as_bytes());
    buf.push(0);
    Box::leak(buf.into_boxed_slice()).as_ptr() as *const c_char
}

struct Harness {
    base: *mut u8,
    table: &'static FlagTable,
}

impl Harness {
    /// Materialise one slot per flag in a fresh executable mapping.
    fn new(specs: &[(&str, DefaultEncoding, bool)]) -> Self {
        let mut mmap = MmapMut::map_anon(4096).unwrap();
        for (i, &(_, baked, _)) in specs.iter().enumerate() {
            write_slot(&mut mmap, SLOT * i, baked);
        }
        let mmap = mmap.make_exec().unwrap();
        let base = mmap.as_ptr() as *mut u8;
        std::mem::forget(mmap);

        let records: Vec<FlagRecord> = specs
            .iter()
            .enumerate()
            .map(|(i, &(name, baked, flipped))| unsafe {
                FlagRecord::new(
                    base.add(SLOT * i),
                    base.add(SLOT * i + 16),
                    leak_name_doc(name, ""),
                    baked,
                    flipped,
                )
            })
            .collect();
        let table: &'static FlagTable = Box::leak(Box::new(FlagTable::new(
            Box::leak(records.into_boxed_slice()),
            Box::leak(Vec::new().into_boxed_slice()),
        )));
        Self { base, table }
    }

    /// Execute slot `i`; true when the guarded block ran.
    fn guarded_ran(&self, i: usize) -> bool {
        let f: extern "C" fn() -> i32 =
            unsafe { std::mem::transmute(self.base.add(SLOT * i)) };
        f() == 1
    }
}

fn counters(registry: &FlagRegistry, pattern: &str) -> (u64, u64) {
    let mut out = (0, 0);
    registry
        .list(pattern, |snapshot| {
            out = (snapshot.activation, snapshot.unhook);
            ControlFlow::Break(())
        })
        .unwrap();
    out
}

/// The full activation lifecycle through the process-global registry: a
/// default-off flag, a default-on flag and a flipped flag whose guarded
/// block runs while it is inactive.
#[test]
fn end_to_end_toggle() {
    let harness = Harness::new(&[
        ("off:x@demo.rs:1", DefaultEncoding::Inactive, false),
        ("on:y@demo.rs:2", DefaultEncoding::Active, false),
        ("feat:z@demo.rs:3", DefaultEncoding::Active, true),
    ]);

    // Before initialisation the baked defaults hold.
    assert!(!harness.guarded_ran(0));
    assert!(harness.guarded_ran(1));
    assert!(harness.guarded_ran(2));

    let registry = dynflag::init_global(harness.table).unwrap();
    assert!(!harness.guarded_ran(0));
    assert!(harness.guarded_ran(1));
    assert!(harness.guarded_ran(2));
    assert_eq!(counters(registry, "off:x"), (0, 0));
    assert_eq!(counters(registry, "on:y"), (1, 0));
    assert_eq!(counters(registry, "feat:z"), (0, 0));

    assert_eq!(dynflag::activate("off:x").unwrap(), 1);
    assert!(harness.guarded_ran(0));

    assert_eq!(dynflag::deactivate("on:.*").unwrap(), 1);
    assert!(!harness.guarded_ran(1));

    // Unhooked flags ignore activation entirely.
    assert_eq!(dynflag::unhook("feat:.*").unwrap(), 1);
    assert_eq!(dynflag::activate("feat:.*").unwrap(), 1);
    assert!(harness.guarded_ran(2));
    assert_eq!(counters(registry, "feat:z"), (0, 1));

    // Once rehooked, activating the flipped flag swaps it to the
    // fall-through encoding and the guarded block stops running.
    assert_eq!(dynflag::rehook("feat:.*").unwrap(), 1);
    assert_eq!(dynflag::activate("feat:.*").unwrap(), 1);
    assert!(!harness.guarded_ran(2));
    assert_eq!(counters(registry, "feat:z"), (1, 0));

    // And deactivating brings the guarded block back.
    assert_eq!(dynflag::deactivate("feat:.*").unwrap(), 1);
    assert!(harness.guarded_ran(2));
}

/// Patterns anchor at the start of the name only; `$` is up to the caller.
#[test]
fn anchoring_is_left_only() {
    let harness = Harness::new(&[
        ("on:printf3@demo.rs:10", DefaultEncoding::Inactive, false),
        ("test:on:printf3@demo.rs:11", DefaultEncoding::Inactive, false),
    ]);
    let registry = FlagRegistry::new(harness.table).unwrap();

    assert_eq!(registry.activate("on:printf3").unwrap(), 1);
    assert!(harness.guarded_ran(0));
    assert!(!harness.guarded_ran(1));

    assert_eq!(registry.activate(".*on:.*").unwrap(), 2);
    assert!(harness.guarded_ran(0));
    assert!(harness.guarded_ran(1));
    assert_eq!(counters(&registry, "on:printf3").0, 2);
    assert_eq!(counters(&registry, "test:on:printf3").0, 1);
}
