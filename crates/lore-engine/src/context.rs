//! Named record store with change tracking.
//!
//! All mutations go through a single mutex so each write is atomic per
//! name, and a condition variable lets waiters wake on change.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lore_core::{is_local_name, Clock, Quality, Record, Value};
use tracing::trace;

use crate::error::KbError;
use crate::settings::EvalSettings;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Most records a single `to_list` call returns.
pub const MAX_LIST_LEN: usize = 1 << 16;

/// Result of applying one write or merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The write replaced (or created) the record.
    Applied,
    /// The write did not exceed the existing clock/quality and was dropped.
    Stale,
}

impl UpdateOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, UpdateOutcome::Applied)
    }
}

/// Context-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Local writes that were committed.
    pub applied: u64,
    /// Remote updates that were committed.
    pub merged: u64,
    /// Writes and merges dropped as stale.
    pub stale: u64,
}

#[derive(Debug, Default)]
struct ContextInner {
    records: HashMap<String, Record>,
    modified: BTreeSet<String>,
    write_quality: HashMap<String, Quality>,
    clock: Clock,
    generation: u64,
    stats: ContextStats,
}

impl ContextInner {
    fn touch(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    fn commit(&mut self, name: &str, record: Record, mark_modified: bool) {
        self.clock = self.clock.max(record.clock);
        self.records.insert(name.to_string(), record);
        if mark_modified && !is_local_name(name) {
            self.modified.insert(name.to_string());
        }
        self.touch();
    }

    fn write_local(&mut self, name: &str, value: Value, settings: &EvalSettings) -> UpdateOutcome {
        let quality = self.write_quality.get(name).copied().unwrap_or(0);
        let existing = self
            .records
            .get(name)
            .map(|record| (record.clock, record.quality));
        let existing_clock = match existing {
            Some((_, existing_quality))
                if !settings.always_overwrite && quality < existing_quality =>
            {
                self.stats.stale += 1;
                trace!("context: stale local write to {name}");
                return UpdateOutcome::Stale;
            }
            Some((clock, _)) => clock,
            None => 0,
        };
        let clock = existing_clock
            .max(self.clock)
            .saturating_add(settings.default_clock_increment);
        let record = Record::new(value).with_clock(clock).with_quality(quality);
        self.commit(name, record, !settings.treat_globals_as_locals);
        self.stats.applied += 1;
        UpdateOutcome::Applied
    }
}

/// The name to record mapping for one knowledge base.
#[derive(Debug)]
pub struct Context {
    id: u64,
    inner: Mutex<ContextInner>,
    changed: Condvar,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(ContextInner::default()),
            changed: Condvar::new(),
        }
    }

    /// Process-unique identity, used to key the reentrancy marker.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, ContextInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changed.notify_all();
    }

    /// Returns a copy of the record, or an empty record for unknown names.
    pub fn get(&self, name: &str) -> Record {
        self.lock().records.get(name).cloned().unwrap_or_default()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lock()
            .records
            .get(name)
            .is_some_and(|record| record.exists())
    }

    /// Local write: stamps the record with the next clock and the name's
    /// write quality, then commits it unless a higher-quality value is
    /// already present.
    ///
    /// With `treat_globals_as_locals` the write still advances clocks but
    /// is not queued for dissemination.
    pub fn set(&self, name: &str, value: impl Into<Value>, settings: &EvalSettings) -> UpdateOutcome {
        let value = value.into();
        let outcome = self.lock().write_local(name, value, settings);
        if outcome.is_applied() {
            self.notify();
        }
        outcome
    }

    /// Read-modify-write of one name under a single lock acquisition.
    ///
    /// `next` sees the current record and returns the value to store plus
    /// a result for the caller. The write follows the same rules as
    /// [`Context::set`]. `next` must not call back into this context.
    pub fn update<T, E, F>(&self, name: &str, settings: &EvalSettings, next: F) -> Result<T, E>
    where
        F: FnOnce(&Record) -> Result<(Value, T), E>,
    {
        let (outcome, result) = {
            let mut inner = self.lock();
            let current = inner.records.get(name).cloned().unwrap_or_default();
            let (value, result) = next(&current)?;
            (inner.write_local(name, value, settings), result)
        };
        if outcome.is_applied() {
            self.notify();
        }
        Ok(result)
    }

    /// Writes a record with caller-supplied clock and quality. Accepted only
    /// when `(clock, quality)` strictly exceeds the existing record's, unless
    /// `always_overwrite` is set.
    pub fn apply_update(&self, name: &str, record: Record, settings: &EvalSettings) -> UpdateOutcome {
        let outcome = {
            let mut inner = self.lock();
            if !settings.always_overwrite && is_stale(inner.records.get(name), &record) {
                inner.stats.stale += 1;
                return UpdateOutcome::Stale;
            }
            inner.commit(name, record, !settings.treat_globals_as_locals);
            inner.stats.applied += 1;
            UpdateOutcome::Applied
        };
        self.notify();
        outcome
    }

    /// Merges a batch received from a peer. Merged records are never
    /// re-queued for dissemination. Returns `(applied, stale)` counts.
    pub fn merge_updates<I>(&self, updates: I) -> (usize, usize)
    where
        I: IntoIterator<Item = (String, Record)>,
    {
        let mut applied = 0;
        let mut stale = 0;
        {
            let mut inner = self.lock();
            for (name, record) in updates {
                if is_stale(inner.records.get(&name), &record) {
                    inner.stats.stale += 1;
                    stale += 1;
                    continue;
                }
                inner.commit(&name, record, false);
                inner.stats.merged += 1;
                applied += 1;
            }
        }
        if applied > 0 {
            self.notify();
        }
        (applied, stale)
    }

    /// Removes one name. Returns whether it was present.
    pub fn delete(&self, name: &str) -> bool {
        let removed = {
            let mut inner = self.lock();
            inner.modified.remove(name);
            let removed = inner.records.remove(name).is_some();
            if removed {
                inner.touch();
            }
            removed
        };
        if removed {
            self.notify();
        }
        removed
    }

    /// Drops every name and pending modification. The clock is kept so
    /// later writes still order after earlier ones.
    pub fn clear(&self) {
        {
            let mut inner = self.lock();
            inner.records.clear();
            inner.modified.clear();
            inner.touch();
        }
        self.notify();
    }

    /// Records for `prefix{start}` through `prefix{end}` inclusive, in index
    /// order. Missing names yield empty records. Ranges longer than
    /// [`MAX_LIST_LEN`] are rejected.
    pub fn to_list(&self, prefix: &str, start: i64, end: i64) -> Result<Vec<Record>, KbError> {
        if start > end {
            return Ok(Vec::new());
        }
        let within = end
            .checked_sub(start)
            .and_then(|span| usize::try_from(span).ok())
            .is_some_and(|span| span < MAX_LIST_LEN);
        if !within {
            return Err(KbError::RangeTooLarge {
                start,
                end,
                limit: MAX_LIST_LEN,
            });
        }
        let inner = self.lock();
        Ok((start..=end)
            .map(|index| {
                inner
                    .records
                    .get(&format!("{prefix}{index}"))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect())
    }

    /// Every record whose name matches `pattern`. A trailing `*` matches any
    /// suffix; without one the pattern is an exact name.
    pub fn to_map(&self, pattern: &str) -> Result<BTreeMap<String, Record>, KbError> {
        let matcher = NamePattern::parse(pattern)?;
        let inner = self.lock();
        Ok(inner
            .records
            .iter()
            .filter(|(name, _)| matcher.matches(name))
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect())
    }

    /// Point-in-time copy of the whole store.
    pub fn snapshot(&self) -> BTreeMap<String, Record> {
        self.lock()
            .records
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect()
    }

    pub fn modified_names(&self) -> Vec<String> {
        self.lock().modified.iter().cloned().collect()
    }

    /// Atomically snapshots and clears the modified set.
    pub fn take_modifieds(&self) -> BTreeMap<String, Record> {
        let mut inner = self.lock();
        let names = std::mem::take(&mut inner.modified);
        names
            .into_iter()
            .filter_map(|name| {
                let record = inner.records.get(&name)?.clone();
                Some((name, record))
            })
            .collect()
    }

    /// Current global clock.
    pub fn clock(&self) -> Clock {
        self.lock().clock
    }

    /// Raises the global clock. Never moves it backwards.
    pub fn set_clock(&self, clock: Clock) -> Clock {
        let mut inner = self.lock();
        inner.clock = inner.clock.max(clock);
        inner.clock
    }

    /// Sets the quality stamped onto future local writes of `name`.
    pub fn set_write_quality(&self, name: &str, quality: Quality) {
        self.lock().write_quality.insert(name.to_string(), quality);
    }

    pub fn write_quality(&self, name: &str) -> Quality {
        self.lock().write_quality.get(name).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> ContextStats {
        self.lock().stats
    }

    /// Change counter, bumped on every committed mutation.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Blocks until the generation moves past `seen` or `timeout` elapses.
    /// Returns whether a change was observed.
    pub fn wait_changed(&self, seen: u64, timeout: Duration) -> bool {
        let inner = self.lock();
        if inner.generation != seen {
            return true;
        }
        let (inner, _) = self
            .changed
            .wait_timeout_while(inner, timeout, |inner| inner.generation == seen)
            .unwrap_or_else(PoisonError::into_inner);
        inner.generation != seen
    }

    /// Binds a local name directly, bypassing clocks. Returns the previous
    /// record so the caller can restore it.
    pub(crate) fn bind_local(&self, name: &str, record: Record) -> Option<Record> {
        self.lock().records.insert(name.to_string(), record)
    }

    pub(crate) fn restore_local(&self, name: &str, previous: Option<Record>) {
        let mut inner = self.lock();
        match previous {
            Some(record) => {
                inner.records.insert(name.to_string(), record);
            }
            None => {
                inner.records.remove(name);
            }
        }
    }

    /// Replaces `{name}` segments in `statement` with the named records'
    /// string values.
    pub fn expand_statement(&self, statement: &str) -> String {
        let mut out = String::with_capacity(statement.len());
        let mut rest = statement;
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}') else {
                break;
            };
            out.push_str(&rest[..open]);
            let name = rest[open + 1..open + close].trim();
            out.push_str(&self.get(name).to_string_value());
            rest = &rest[open + close + 1..];
        }
        out.push_str(rest);
        out
    }
}

fn is_stale(existing: Option<&Record>, incoming: &Record) -> bool {
    existing.is_some_and(|existing| {
        (incoming.clock, incoming.quality) <= (existing.clock, existing.quality)
    })
}

enum NamePattern<'a> {
    Exact(&'a str),
    Prefix(&'a str),
}

impl<'a> NamePattern<'a> {
    fn parse(pattern: &'a str) -> Result<Self, KbError> {
        match pattern.find('*') {
            None => Ok(NamePattern::Exact(pattern)),
            Some(idx) if idx + 1 == pattern.len() => Ok(NamePattern::Prefix(&pattern[..idx])),
            Some(_) => Err(KbError::InvalidPattern(pattern.to_string())),
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            NamePattern::Exact(exact) => name == *exact,
            NamePattern::Prefix(prefix) => name.starts_with(prefix),
        }
    }
}
