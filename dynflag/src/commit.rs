//! Batched protection changes for hook patching.
//!
//! Hook instructions live on pages mapped read/execute. Toggling one means
//! making its page(s) writable, storing the new byte, and restoring the
//! protection, and each `mprotect` is a syscall whose effect is visible to
//! every thread in the process. [with_hooks_writable] therefore walks a batch
//! of records sorted by hook address and maintains a running page window,
//! flushing one `mprotect` pair per *disjoint region* rather than per record.
//!
//! The window may grow by at most one page beyond the pages a record strictly
//! occupies. That captures the common case of flags declared close together
//! in one routine while guaranteeing we never weaken protection on pages we
//! would not have touched anyway.

use crate::patch;
use crate::record::FlagRecord;
use libc::{mprotect, sysconf, PROT_EXEC, PROT_READ, PROT_WRITE, _SC_PAGESIZE};
use std::{ffi::c_void, io};

/// A closed range of page numbers, `[first, last]`. The initial state has
/// `first > last` and is empty; an empty window can always be extended.
#[derive(Debug)]
struct PageWindow {
    first: usize,
    last: usize,
}

impl PageWindow {
    fn empty() -> Self {
        Self {
            first: usize::MAX,
            last: 0,
        }
    }

    fn span(begin: usize, end: usize) -> Self {
        Self {
            first: begin,
            last: end,
        }
    }

    fn is_empty(&self) -> bool {
        self.first > self.last
    }

    /// Grow the window to cover `[begin, end]` if that range lies within one
    /// page of it. Returns false when the range is disjoint and the caller
    /// must flush first.
    fn try_extend(&mut self, begin: usize, end: usize) -> bool {
        if self.is_empty() || (self.first.saturating_sub(1) <= begin && end <= self.last + 1) {
            self.first = self.first.min(begin);
            self.last = self.last.max(end);
            true
        } else {
            false
        }
    }
}

/// Run `apply` on every record with its hook bytes writable, batching
/// protection changes over adjacent pages.
///
/// `records` must be sorted by ascending hook address; the callback runs in
/// that order.
///
/// # Safety
///
/// Every record must reference a real hook site in this process's image, and
/// the caller must hold the registry lock so that no two protection batches
/// overlap.
pub(crate) unsafe fn with_hooks_writable(
    records: &[&FlagRecord],
    mut apply: impl FnMut(&FlagRecord),
) {
    let page_size = usize::try_from(sysconf(_SC_PAGESIZE)).unwrap();

    let mut window = PageWindow::empty();
    let mut section_begin = 0;
    for (i, record) in records.iter().enumerate() {
        let begin = record.hook_addr() / page_size;
        let end = (record.hook_addr() + patch::active::HOOK_SIZE - 1) / page_size;
        if !window.try_extend(begin, end) {
            flush(&window, page_size, &records[section_begin..i], &mut apply);
            section_begin = i;
            window = PageWindow::span(begin, end);
        }
    }
    flush(&window, page_size, &records[section_begin..], &mut apply);
}

unsafe fn flush(
    window: &PageWindow,
    page_size: usize,
    records: &[&FlagRecord],
    apply: &mut impl FnMut(&FlagRecord),
) {
    if records.is_empty() {
        return;
    }

    set_protection(window, page_size, PROT_READ | PROT_WRITE | PROT_EXEC);
    for record in records {
        apply(record);
    }
    set_protection(window, page_size, PROT_READ | PROT_EXEC);
}

unsafe fn set_protection(window: &PageWindow, page_size: usize, prot: i32) {
    let addr = (window.first * page_size) as *mut c_void;
    let len = (window.last + 1 - window.first) * page_size;
    if mprotect(addr, len, prot) != 0 {
        panic!(
            "mprotect({addr:?}, {len:#x}, {prot:#x}) failed: {}",
            io::Error::last_os_error()
        );
    }
}
