//! The flag registry: per-record activation state and the control API.
//!
//! A single global mutex serialises lazy state-table initialisation and every
//! mutating control operation, including the machine-code writes they batch.
//! The hot path at a guarded call site never takes this lock; it simply
//! executes whichever encoding is currently installed. Counter reads for
//! [FlagRegistry::list] are relaxed atomic loads outside the lock: snapshots
//! may be slightly stale under concurrent mutation but are always safe.

use crate::commit;
use crate::log::{Log, Verbosity};
use crate::patch;
use crate::record::{DefaultEncoding, FlagKind, FlagRecord, FlagTable};
use crate::select;
use parking_lot::{Mutex, MutexGuard};
use std::cmp::Ordering;
use std::error::Error;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering as MemOrdering};
use std::sync::OnceLock;
use thiserror::Error;

/// A failure of a control operation. Every variant is reported before any
/// counter or hook byte has been touched, so a failing call mutates nothing.
#[derive(Debug, Error)]
pub enum FlagError {
    /// The caller's pattern did not compile.
    #[error("invalid flag pattern: {0}")]
    Pattern(#[from] regex::Error),
    /// A free function or C entry point ran before [crate::init_global].
    #[error("flag registry not initialised")]
    Uninitialised,
}

/// Mutable per-record state, index-aligned with the record table.
///
/// Stores are only made under the registry lock; loads may happen anywhere,
/// relaxed.
#[derive(Debug)]
pub(crate) struct FlagState {
    /// Saturating count of activations. The hook's encoding is "active"
    /// exactly when this is non-zero, inverted for flipped records.
    activation: AtomicU64,
    /// Saturating override count. While non-zero, activation increments are
    /// suppressed.
    unhook: AtomicU64,
}

impl FlagState {
    /// The starting activation for a record follows from the encoding the
    /// registry installs at initialisation: an active encoding means
    /// activation 1, inverted for flipped records.
    fn initial(record: &FlagRecord) -> Self {
        let active = record.default_encoding() == DefaultEncoding::Active;
        Self {
            activation: AtomicU64::new(u64::from(active != record.flipped())),
            unhook: AtomicU64::new(0),
        }
    }
}

/// A point-in-time view of one matching record, handed to [FlagRegistry::list]
/// visitors. Counter values are best-effort under concurrent mutation.
#[derive(Clone, Debug)]
pub struct FlagSnapshot {
    /// The full name, `kind:name@file:line`.
    pub name: &'static str,
    /// The docstring; empty when the flag was declared without one.
    pub doc: &'static str,
    pub activation: u64,
    pub unhook: u64,
    pub hook: usize,
    pub destination: usize,
    /// Set on the second and later of a run of identical full names.
    pub duplicate: bool,
}

/// The registry over one static [FlagTable].
///
/// Most processes use the process-global instance (see [crate::init_global]);
/// tests construct private registries over private tables to control
/// lifecycle precisely.
pub struct FlagRegistry {
    table: &'static FlagTable,
    log: Log,
    /// Serialises state-table initialisation and all mutation, counters and
    /// machine code alike.
    mutate: Mutex<()>,
    /// Allocated lazily, exactly once, under [Self::mutate]. Never resized.
    states: OnceLock<Box<[FlagState]>>,
}

impl FlagRegistry {
    pub fn new(table: &'static FlagTable) -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            table,
            log: Log::new()?,
            mutate: Mutex::new(()),
            states: OnceLock::new(),
        })
    }

    /// Initialise the state table and write every record's default encoding.
    /// Idempotent; later calls are cheap no-ops.
    pub fn init(&self) {
        if !patch::active::AVAILABLE {
            return;
        }
        drop(self.lock());
    }

    /// Acquire the mutation lock, initialising the state table and the
    /// initial hook encodings on first use.
    fn lock(&self) -> MutexGuard<'_, ()> {
        let guard = self.mutate.lock();
        if self.states.get().is_none() {
            let states: Box<[FlagState]> = self
                .table
                .records()
                .iter()
                .map(FlagState::initial)
                .collect();

            let mut records: Vec<&FlagRecord> = self.table.records().iter().collect();
            records.sort_unstable_by_key(|r| r.hook_addr());
            unsafe {
                commit::with_hooks_writable(&records, |record| {
                    match record.default_encoding() {
                        DefaultEncoding::Active => patch::active::patch(record),
                        DefaultEncoding::Inactive => patch::active::unpatch(record),
                    }
                    patch::invalidate(record);
                });
            }

            self.states
                .set(states)
                .expect("flag state table initialised twice");
            self.log.log(
                Verbosity::FlagEvent,
                &format!(
                    "initialised {} flag records ({} kinds)",
                    self.table.records().len(),
                    self.table.kinds().len()
                ),
            );
        }
        guard
    }

    /// Increment the activation count of every record whose name matches
    /// `pattern`, patching the hooks that transition from inactive.
    /// Returns the number of matching records.
    pub fn activate(&self, pattern: &str) -> Result<usize, FlagError> {
        if !patch::active::AVAILABLE {
            return Ok(0);
        }
        let re = select::compile(pattern)?;
        let ids = select::find(self.table, 0..self.table.records().len(), Some(&re));
        let (matched, patched) = self.activate_records(ids);
        self.log.log(
            Verbosity::FlagEvent,
            &format!("activate {pattern:?}: {matched} matched, {patched} patched"),
        );
        Ok(matched)
    }

    /// Decrement the activation count of every matching record, restoring the
    /// inactive encoding on those that reach zero. Returns the number of
    /// matching records.
    pub fn deactivate(&self, pattern: &str) -> Result<usize, FlagError> {
        if !patch::active::AVAILABLE {
            return Ok(0);
        }
        let re = select::compile(pattern)?;
        let ids = select::find(self.table, 0..self.table.records().len(), Some(&re));
        let (matched, patched) = self.deactivate_records(ids);
        self.log.log(
            Verbosity::FlagEvent,
            &format!("deactivate {pattern:?}: {matched} matched, {patched} unpatched"),
        );
        Ok(matched)
    }

    /// Increment the unhook count of every matching record. While a record's
    /// unhook count is non-zero its activation count cannot be incremented.
    pub fn unhook(&self, pattern: &str) -> Result<usize, FlagError> {
        if !patch::active::AVAILABLE {
            return Ok(0);
        }
        let re = select::compile(pattern)?;
        let ids = select::find(self.table, 0..self.table.records().len(), Some(&re));
        let matched = self.unhook_records(ids);
        self.log.log(
            Verbosity::FlagEvent,
            &format!("unhook {pattern:?}: {matched} matched"),
        );
        Ok(matched)
    }

    /// Decrement the unhook count of every matching record.
    pub fn rehook(&self, pattern: &str) -> Result<usize, FlagError> {
        if !patch::active::AVAILABLE {
            return Ok(0);
        }
        let re = select::compile(pattern)?;
        let ids = select::find(self.table, 0..self.table.records().len(), Some(&re));
        let matched = self.rehook_records(ids);
        self.log.log(
            Verbosity::FlagEvent,
            &format!("rehook {pattern:?}: {matched} matched"),
        );
        Ok(matched)
    }

    /// [Self::activate], restricted to one kind. A `None` pattern matches
    /// every record of the kind.
    pub fn activate_kind(
        &self,
        kind: &FlagKind,
        pattern: Option<&str>,
    ) -> Result<usize, FlagError> {
        if !patch::active::AVAILABLE {
            return Ok(0);
        }
        let ids = self.find_kind(kind, pattern)?;
        let (matched, patched) = self.activate_records(ids);
        self.log.log(
            Verbosity::FlagEvent,
            &format!(
                "activate kind {} {pattern:?}: {matched} matched, {patched} patched",
                kind.name()
            ),
        );
        Ok(matched)
    }

    /// [Self::deactivate], restricted to one kind.
    pub fn deactivate_kind(
        &self,
        kind: &FlagKind,
        pattern: Option<&str>,
    ) -> Result<usize, FlagError> {
        if !patch::active::AVAILABLE {
            return Ok(0);
        }
        let ids = self.find_kind(kind, pattern)?;
        let (matched, patched) = self.deactivate_records(ids);
        self.log.log(
            Verbosity::FlagEvent,
            &format!(
                "deactivate kind {} {pattern:?}: {matched} matched, {patched} unpatched",
                kind.name()
            ),
        );
        Ok(matched)
    }

    /// [Self::unhook], restricted to one kind.
    pub fn unhook_kind(&self, kind: &FlagKind, pattern: Option<&str>) -> Result<usize, FlagError> {
        if !patch::active::AVAILABLE {
            return Ok(0);
        }
        let ids = self.find_kind(kind, pattern)?;
        Ok(self.unhook_records(ids))
    }

    /// [Self::rehook], restricted to one kind.
    pub fn rehook_kind(&self, kind: &FlagKind, pattern: Option<&str>) -> Result<usize, FlagError> {
        if !patch::active::AVAILABLE {
            return Ok(0);
        }
        let ids = self.find_kind(kind, pattern)?;
        Ok(self.rehook_records(ids))
    }

    fn find_kind(&self, kind: &FlagKind, pattern: Option<&str>) -> Result<Vec<usize>, FlagError> {
        // An empty kind means the codegen step emitted a partition with no
        // records, which it guarantees not to do.
        debug_assert!(!kind.range().is_empty());
        debug_assert!(kind.range().end <= self.table.records().len());
        let re = pattern.map(select::compile).transpose()?;
        Ok(select::find(self.table, kind.range(), re.as_ref()))
    }

    fn activate_records(&self, mut ids: Vec<usize>) -> (usize, usize) {
        let records = self.table.records();
        ids.sort_unstable_by_key(|&i| records[i].hook_addr());
        let matched = ids.len();

        let _guard = self.lock();
        let states = self.states.get().unwrap();
        let mut to_patch: Vec<&FlagRecord> = Vec::with_capacity(ids.len());
        for &i in &ids {
            let state = &states[i];
            if state.unhook.load(MemOrdering::Relaxed) > 0 {
                continue;
            }
            let cur = state.activation.load(MemOrdering::Relaxed);
            state
                .activation
                .store(cur.saturating_add(1), MemOrdering::Relaxed);
            if cur == 0 {
                to_patch.push(&records[i]);
            }
        }
        let patched = to_patch.len();
        unsafe {
            commit::with_hooks_writable(&to_patch, |record| {
                if record.flipped() {
                    patch::active::unpatch(record);
                } else {
                    patch::active::patch(record);
                }
                patch::invalidate(record);
            });
        }
        (matched, patched)
    }

    fn deactivate_records(&self, mut ids: Vec<usize>) -> (usize, usize) {
        let records = self.table.records();
        ids.sort_unstable_by_key(|&i| records[i].hook_addr());
        let matched = ids.len();

        let _guard = self.lock();
        let states = self.states.get().unwrap();
        let mut to_patch: Vec<&FlagRecord> = Vec::with_capacity(ids.len());
        for &i in &ids {
            let state = &states[i];
            let cur = state.activation.load(MemOrdering::Relaxed);
            if cur > 0 {
                state.activation.store(cur - 1, MemOrdering::Relaxed);
                if cur == 1 {
                    to_patch.push(&records[i]);
                }
            }
        }
        let patched = to_patch.len();
        unsafe {
            commit::with_hooks_writable(&to_patch, |record| {
                if record.flipped() {
                    patch::active::patch(record);
                } else {
                    patch::active::unpatch(record);
                }
                patch::invalidate(record);
            });
        }
        (matched, patched)
    }

    fn unhook_records(&self, ids: Vec<usize>) -> usize {
        let _guard = self.lock();
        let states = self.states.get().unwrap();
        for &i in &ids {
            let state = &states[i];
            let cur = state.unhook.load(MemOrdering::Relaxed);
            state
                .unhook
                .store(cur.saturating_add(1), MemOrdering::Relaxed);
        }
        ids.len()
    }

    fn rehook_records(&self, ids: Vec<usize>) -> usize {
        let _guard = self.lock();
        let states = self.states.get().unwrap();
        for &i in &ids {
            let state = &states[i];
            let cur = state.unhook.load(MemOrdering::Relaxed);
            if cur > 0 {
                state.unhook.store(cur - 1, MemOrdering::Relaxed);
            }
        }
        ids.len()
    }

    /// Visit a snapshot of every record whose name matches `pattern`, sorted
    /// by `kind:name@file`, preferring records with longer docstrings, then
    /// by ascending line number. The second and later of identical full
    /// names are flagged as duplicates. Iteration stops early when the
    /// visitor breaks. Returns the number of matching records.
    ///
    /// Counter values are read without the registry lock: a concurrent
    /// control operation may make them slightly stale, never unsafe.
    pub fn list(
        &self,
        pattern: &str,
        mut visitor: impl FnMut(&FlagSnapshot) -> ControlFlow<()>,
    ) -> Result<usize, FlagError> {
        if !patch::active::AVAILABLE {
            return Ok(0);
        }
        let re = select::compile(pattern)?;
        let mut ids = select::find(self.table, 0..self.table.records().len(), Some(&re));

        // Make sure the state table exists, then read outside the lock.
        drop(self.lock());
        let states = self.states.get().unwrap();

        let records = self.table.records();
        ids.sort_unstable_by(|&a, &b| cmp_listing(&records[a], &records[b]));

        let mut prev: Option<&str> = None;
        for &i in &ids {
            let record = &records[i];
            let snapshot = FlagSnapshot {
                name: record.name_str(),
                doc: record.doc_str(),
                activation: states[i].activation.load(MemOrdering::Relaxed),
                unhook: states[i].unhook.load(MemOrdering::Relaxed),
                hook: record.hook_addr(),
                destination: record.destination_addr(),
                duplicate: prev == Some(record.name_str()),
            };
            prev = Some(record.name_str());
            if let ControlFlow::Break(()) = visitor(&snapshot) {
                break;
            }
        }
        Ok(ids.len())
    }
}

/// Listing order: roughly alphabetical. Everything up to the line number
/// (kind, name, file) compares as a string; for otherwise identical names the
/// record with the longer docstring comes first, then the lesser line number.
fn cmp_listing(a: &FlagRecord, b: &FlagRecord) -> Ordering {
    let an = a.name_str();
    let bn = b.name_str();
    let (Some((a_prefix, a_line)), Some((b_prefix, b_line))) =
        (an.rsplit_once(':'), bn.rsplit_once(':'))
    else {
        return an.cmp(bn);
    };
    if a_prefix.len() != b_prefix.len() {
        return an.cmp(bn);
    }
    match a_prefix.cmp(b_prefix) {
        Ordering::Equal => (),
        unequal => return unequal,
    }

    let (a_doc, b_doc) = (a.doc_str(), b.doc_str());
    if !a_doc.is_empty() || !b_doc.is_empty() {
        if a_doc.is_empty() {
            return Ordering::Greater;
        }
        if b_doc.is_empty() {
            return Ordering::Less;
        }
        match b_doc.len().cmp(&a_doc.len()) {
            Ordering::Equal => (),
            unequal => return unequal,
        }
    }

    let a_line = a_line.parse::<u64>().unwrap_or(0);
    let b_line = b_line.parse::<u64>().unwrap_or(0);
    a_line.cmp(&b_line)
}
