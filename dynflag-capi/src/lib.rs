//! This crate exports the dynflag control API via the C ABI.
//!
//! A dedicated crate keeps the workspace to a single `cdylib`, which avoids
//! duplicate copies of dependencies when mixed-language binaries link both C
//! and Rust components.
//!
//! The embedding binary's Rust side is expected to have registered the flag
//! table with [dynflag::init_global]; every entry point here reports failure
//! (-1) until that has happened. Entry points take a pattern as a
//! NUL-terminated string and return the number of matched flags, mirroring
//! the Rust API.

use dynflag::FlagSnapshot;
use libc::ssize_t;
use std::ffi::{c_char, CStr};
use std::ops::ControlFlow;

unsafe fn pattern_arg(pattern: *const c_char) -> Option<&'static str> {
    if pattern.is_null() {
        return None;
    }
    CStr::from_ptr(pattern).to_str().ok()
}

fn run(
    pattern: *const c_char,
    op: impl Fn(&'static dynflag::FlagRegistry, &str) -> Result<usize, dynflag::FlagError>,
) -> ssize_t {
    let Some(registry) = dynflag::global() else {
        return -1;
    };
    let Some(pattern) = (unsafe { pattern_arg(pattern) }) else {
        return -1;
    };
    match op(registry, pattern) {
        Ok(matched) => ssize_t::try_from(matched).unwrap_or(ssize_t::MAX),
        Err(_) => -1,
    }
}

/// Initialise the flag registry, installing every flag's default encoding.
/// Safe, if useless, to call more than once.
#[no_mangle]
pub extern "C" fn dynflag_init() {
    if let Some(registry) = dynflag::global() {
        registry.init();
    }
}

#[no_mangle]
pub unsafe extern "C" fn dynflag_activate(pattern: *const c_char) -> ssize_t {
    run(pattern, |registry, pattern| registry.activate(pattern))
}

#[no_mangle]
pub unsafe extern "C" fn dynflag_deactivate(pattern: *const c_char) -> ssize_t {
    run(pattern, |registry, pattern| registry.deactivate(pattern))
}

#[no_mangle]
pub unsafe extern "C" fn dynflag_unhook(pattern: *const c_char) -> ssize_t {
    run(pattern, |registry, pattern| registry.unhook(pattern))
}

#[no_mangle]
pub unsafe extern "C" fn dynflag_rehook(pattern: *const c_char) -> ssize_t {
    run(pattern, |registry, pattern| registry.rehook(pattern))
}

/// Print every matching flag's state to stderr, one line per unique name,
/// skipping duplicate records of inlined call sites.
#[no_mangle]
pub unsafe extern "C" fn dynflag_list_stderr(pattern: *const c_char) -> ssize_t {
    run(pattern, |registry, pattern| {
        registry.list(pattern, |snapshot| {
            if !snapshot.duplicate {
                eprintln!("{}", render_state(snapshot));
            }
            ControlFlow::Continue(())
        })
    })
}

fn render_state(snapshot: &FlagSnapshot) -> String {
    let activation = if snapshot.activation > 0 {
        snapshot.activation.to_string()
    } else {
        "off".to_owned()
    };
    let unhook = if snapshot.unhook > 0 {
        format!(", unhook={}", snapshot.unhook)
    } else {
        String::new()
    };
    let doc = if snapshot.doc.is_empty() {
        String::new()
    } else {
        format!(": {}", snapshot.doc)
    };
    format!("{} ({activation}{unhook}){doc}", snapshot.name)
}
