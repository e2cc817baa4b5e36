//! Hang statistics.
//!
//! This module provides the code-location key used to aggregate hang sites,
//! the immutable [`HangStats`] snapshot handed out to callers, and the
//! single-writer registry the hang handler updates.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;

/// Where the monitored loop was stuck when a hang was detected.
///
/// Equal keys aggregate into the same counter in [`HangStats::bad_functions`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeLocation {
    /// Function or routine name.
    pub function: String,
    /// Source file (or other source unit identifier).
    pub file: String,
    /// Starting line number, 0 when unknown.
    pub line: u32,
}

impl CodeLocation {
    /// Placeholder used for the routine and file of an unknown location.
    pub const UNKNOWN: &'static str = "<unknown>";

    /// Create a new code location.
    #[must_use]
    pub fn new(function: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            function: function.into(),
            file: file.into(),
            line,
        }
    }

    /// Sentinel key used when no stack could be captured.
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN, Self::UNKNOWN, 0)
    }

    /// Whether this is the sentinel key.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.function == Self::UNKNOWN && self.file == Self::UNKNOWN && self.line == 0
    }
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.function, self.file, self.line)
    }
}

/// Immutable snapshot of the hang counters.
///
/// `hang_count` always equals the sum of the `bad_functions` counts: both are
/// updated together and a snapshot never observes one without the other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HangStats {
    /// Total number of detected hangs.
    pub hang_count: u64,
    /// Occurrences per stuck code location.
    #[serde(with = "location_counts")]
    pub bad_functions: HashMap<CodeLocation, u64>,
}

impl HangStats {
    /// Number of hangs recorded at `location`.
    #[must_use]
    pub fn count_for(&self, location: &CodeLocation) -> u64 {
        self.bad_functions.get(location).copied().unwrap_or(0)
    }

    /// Offending locations, most frequent first.
    ///
    /// Ties are ordered by location so the output is stable.
    #[must_use]
    pub fn worst_offenders(&self) -> Vec<(&CodeLocation, u64)> {
        let mut offenders: Vec<_> = self
            .bad_functions
            .iter()
            .map(|(location, count)| (location, *count))
            .collect();
        offenders.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        offenders
    }

    /// Write a human-readable report to `out`.
    ///
    /// # Errors
    ///
    /// Returns any error raised by the underlying writer.
    pub fn print_stats<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        write!(out, "{self}")
    }
}

impl fmt::Display for HangStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Reactor was hung {} times", self.hang_count)?;
        writeln!(f, "Worst offending functions:")?;
        for (location, count) in self.worst_offenders() {
            writeln!(f, "Function {location} count {count}")?;
        }
        Ok(())
    }
}

/// Serializes the location map as a list, since JSON keys must be strings.
mod location_counts {
    use super::CodeLocation;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        location: CodeLocation,
        count: u64,
    }

    pub(super) fn serialize<S: Serializer>(
        map: &HashMap<CodeLocation, u64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut entries: Vec<Entry> = map
            .iter()
            .map(|(location, count)| Entry {
                location: location.clone(),
                count: *count,
            })
            .collect();
        entries.sort_by(|a, b| a.location.cmp(&b.location));
        entries.serialize(serializer)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<CodeLocation, u64>, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries
            .into_iter()
            .map(|entry| (entry.location, entry.count))
            .collect())
    }
}

/// Single-writer store behind [`HangStats`].
///
/// Only the hang handler records; any thread may take a snapshot. The lock is
/// never taken by the monitored loop, so the handler cannot deadlock against
/// the hang it is reporting.
#[derive(Debug, Default)]
pub(crate) struct HangRegistry {
    inner: Mutex<HangStats>,
}

impl HangRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Count one hang at `location`, returning the new total.
    pub(crate) fn record(&self, location: CodeLocation) -> u64 {
        let mut stats = self.inner.lock();
        stats.hang_count = stats.hang_count.saturating_add(1);
        let count = stats.bad_functions.entry(location).or_insert(0);
        *count = count.saturating_add(1);
        stats.hang_count
    }

    pub(crate) fn snapshot(&self) -> HangStats {
        self.inner.lock().clone()
    }

    pub(crate) fn hang_count(&self) -> u64 {
        self.inner.lock().hang_count
    }
}
