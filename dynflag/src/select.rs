//! Pattern matching over flag names.
//!
//! Patterns are regular expressions implicitly anchored at the first
//! character of the full flag name: a leading `^` is prepended unless the
//! caller already wrote one. There is no implicit right anchor, so `on:x`
//! also matches `on:xylophone`; append `$` for an exact match.

use crate::record::FlagTable;
use regex::Regex;
use std::ops::Range;

/// Compile `pattern`, anchoring it at the start of the name.
pub(crate) fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    if pattern.starts_with('^') {
        Regex::new(pattern)
    } else {
        Regex::new(&format!("^{pattern}"))
    }
}

/// Indices of the records in `range` whose name matches `re`. A `None`
/// pattern matches the whole range. The result is in table order; callers
/// sort by hook address before patching.
pub(crate) fn find(table: &FlagTable, range: Range<usize>, re: Option<&Regex>) -> Vec<usize> {
    let records = table.records();
    range
        .filter(|&i| re.map_or(true, |re| re.is_match(records[i].name_str())))
        .collect()
}
