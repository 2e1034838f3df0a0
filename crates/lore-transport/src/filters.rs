//! Record and aggregate filters applied at each pipeline stage.
//!
//! Record filters are keyed by the type of the incoming record and run in
//! registration order. Aggregate filters run afterwards, once per batch.
//! A filter that fails or panics is skipped and the value it was given
//! passes through.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use lore_core::{Record, RecordType};
use lore_engine::Variables;
use tracing::{debug, warn};

use crate::context::TransportContext;
use crate::error::FilterError;

/// One update handed to a record filter.
#[derive(Debug, Clone, Copy)]
pub struct FilterArgs<'a> {
    pub name: &'a str,
    pub record: &'a Record,
    pub transport: &'a TransportContext,
}

/// What a record filter decided.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutput {
    /// Keep the record as given.
    Unchanged,
    /// Use this value instead. Clock and quality of the original are kept.
    /// An empty record discards the update.
    Replace(Record),
    /// Remove the update from the batch.
    Discard,
}

impl FilterOutput {
    pub fn replace(record: impl Into<Record>) -> Self {
        FilterOutput::Replace(record.into())
    }
}

pub trait RecordFilter: Send + Sync {
    fn filter(
        &self,
        args: &FilterArgs<'_>,
        vars: &mut Variables<'_>,
    ) -> Result<FilterOutput, FilterError>;
}

impl<F> RecordFilter for F
where
    F: Fn(&FilterArgs<'_>, &mut Variables<'_>) -> Result<FilterOutput, FilterError> + Send + Sync,
{
    fn filter(
        &self,
        args: &FilterArgs<'_>,
        vars: &mut Variables<'_>,
    ) -> Result<FilterOutput, FilterError> {
        self(args, vars)
    }
}

/// Sees the whole batch. May edit, remove, or stage extra records through
/// `TransportContext::add_record`.
pub trait AggregateFilter: Send + Sync {
    fn filter(
        &self,
        updates: &mut BTreeMap<String, Record>,
        transport: &mut TransportContext,
        vars: &mut Variables<'_>,
    ) -> Result<(), FilterError>;
}

impl<F> AggregateFilter for F
where
    F: Fn(
            &mut BTreeMap<String, Record>,
            &mut TransportContext,
            &mut Variables<'_>,
        ) -> Result<(), FilterError>
        + Send
        + Sync,
{
    fn filter(
        &self,
        updates: &mut BTreeMap<String, Record>,
        transport: &mut TransportContext,
        vars: &mut Variables<'_>,
    ) -> Result<(), FilterError> {
        self(updates, transport, vars)
    }
}

/// Counts from one pass over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterReport {
    /// Filters that returned an error or panicked.
    pub failures: usize,
    /// Updates removed by record filters.
    pub discarded: usize,
}

/// Ordered filters for one stage.
#[derive(Clone, Default)]
pub struct FilterChain {
    record_filters: BTreeMap<RecordType, Vec<Arc<dyn RecordFilter>>>,
    aggregate_filters: Vec<Arc<dyn AggregateFilter>>,
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record_filters: BTreeMap<&str, usize> = self
            .record_filters
            .iter()
            .map(|(ty, chain)| (ty.name(), chain.len()))
            .collect();
        f.debug_struct("FilterChain")
            .field("record_filters", &record_filters)
            .field("aggregate_filters", &self.aggregate_filters.len())
            .finish()
    }
}

impl FilterChain {
    /// Appends `filter` to the chain of every type in `types`.
    pub fn add_record_filter<F>(&mut self, types: &[RecordType], filter: F)
    where
        F: Fn(&FilterArgs<'_>, &mut Variables<'_>) -> Result<FilterOutput, FilterError>
            + Send
            + Sync
            + 'static,
    {
        self.add_record_filter_arc(types, Arc::new(filter));
    }

    pub fn add_record_filter_arc(&mut self, types: &[RecordType], filter: Arc<dyn RecordFilter>) {
        for ty in types {
            self.record_filters
                .entry(*ty)
                .or_default()
                .push(Arc::clone(&filter));
        }
    }

    pub fn add_aggregate_filter<F>(&mut self, filter: F)
    where
        F: Fn(
                &mut BTreeMap<String, Record>,
                &mut TransportContext,
                &mut Variables<'_>,
            ) -> Result<(), FilterError>
            + Send
            + Sync
            + 'static,
    {
        self.add_aggregate_filter_arc(Arc::new(filter));
    }

    pub fn add_aggregate_filter_arc(&mut self, filter: Arc<dyn AggregateFilter>) {
        self.aggregate_filters.push(filter);
    }

    pub fn clear_record_filters(&mut self, ty: RecordType) {
        self.record_filters.remove(&ty);
    }

    pub fn clear_aggregate_filters(&mut self) {
        self.aggregate_filters.clear();
    }

    pub fn record_filter_count(&self, ty: RecordType) -> usize {
        self.record_filters.get(&ty).map_or(0, Vec::len)
    }

    pub fn aggregate_filter_count(&self) -> usize {
        self.aggregate_filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_filters.values().all(Vec::is_empty) && self.aggregate_filters.is_empty()
    }

    /// Runs record filters then aggregate filters over `updates`, then adds
    /// any records staged on `transport`.
    pub fn apply(
        &self,
        updates: BTreeMap<String, Record>,
        transport: &mut TransportContext,
        vars: &mut Variables<'_>,
    ) -> (BTreeMap<String, Record>, FilterReport) {
        let mut report = FilterReport::default();
        let mut filtered = BTreeMap::new();
        for (name, record) in updates {
            match self.apply_record_filters(&name, record, transport, vars, &mut report) {
                Some(record) => {
                    filtered.insert(name, record);
                }
                None => report.discarded += 1,
            }
        }

        for filter in &self.aggregate_filters {
            let saved_updates = filtered.clone();
            let saved_transport = transport.clone();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                filter.filter(&mut filtered, transport, vars)
            }));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(_) => "aggregate filter panicked".to_string(),
            };
            warn!(
                "transport: {} aggregate filter skipped: {failure}",
                transport.operation.as_str()
            );
            report.failures += 1;
            filtered = saved_updates;
            *transport = saved_transport;
        }

        let staged = transport.take_staged();
        if !staged.is_empty() {
            debug!(
                "transport: {} filters staged {} extra records",
                transport.operation.as_str(),
                staged.len()
            );
            filtered.extend(staged);
        }
        (filtered, report)
    }

    fn apply_record_filters(
        &self,
        name: &str,
        mut record: Record,
        transport: &TransportContext,
        vars: &mut Variables<'_>,
        report: &mut FilterReport,
    ) -> Option<Record> {
        let Some(chain) = self.record_filters.get(&record.record_type()) else {
            return Some(record);
        };
        for filter in chain {
            let args = FilterArgs {
                name,
                record: &record,
                transport,
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| filter.filter(&args, vars)));
            match outcome {
                Ok(Ok(FilterOutput::Unchanged)) => {}
                Ok(Ok(FilterOutput::Replace(next))) => {
                    if !next.exists() {
                        return None;
                    }
                    record = next.with_clock(record.clock).with_quality(record.quality);
                }
                Ok(Ok(FilterOutput::Discard)) => return None,
                Ok(Err(err)) => {
                    warn!("transport: filter on {name} skipped: {err}");
                    report.failures += 1;
                }
                Err(_) => {
                    warn!("transport: filter on {name} panicked");
                    report.failures += 1;
                }
            }
        }
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use lore_core::{Record, RecordType};
    use lore_engine::{Context, EvalSettings, Variables};

    use super::{FilterChain, FilterOutput};
    use crate::context::{Operation, TransportContext};
    use crate::error::FilterError;

    fn batch(entries: &[(&str, Record)]) -> BTreeMap<String, Record> {
        entries
            .iter()
            .map(|(name, record)| (name.to_string(), record.clone()))
            .collect()
    }

    fn run(
        chain: &FilterChain,
        updates: BTreeMap<String, Record>,
    ) -> (BTreeMap<String, Record>, super::FilterReport, Context) {
        let context = Context::new();
        let settings = EvalSettings::default();
        let mut vars = Variables::new(&context, &settings);
        let mut transport = TransportContext::new(Operation::Send, "lore", "agent.0");
        let (out, report) = chain.apply(updates, &mut transport, &mut vars);
        (out, report, context)
    }

    #[test]
    fn record_filters_run_in_order_before_aggregate() {
        let mut chain = FilterChain::default();
        chain.add_record_filter(&[RecordType::Integer], |args, _| {
            Ok(FilterOutput::replace(args.record.to_integer()? * 2))
        });
        chain.add_record_filter(&[RecordType::Integer], |args, _| {
            Ok(FilterOutput::replace(args.record.to_integer()? + 1))
        });
        chain.add_aggregate_filter(|updates, _, _| {
            let seen = updates.get("count").cloned().unwrap_or_default();
            updates.insert("seen".to_string(), seen);
            Ok(())
        });

        let (out, report, _) = run(&chain, batch(&[("count", Record::integer(4).with_clock(7))]));
        assert_eq!(report.failures, 0);
        let count = out.get("count").expect("count should survive");
        assert_eq!(count.to_integer(), Ok(9));
        assert_eq!(count.clock, 7);
        assert_eq!(out.get("seen").map(Record::to_integer), Some(Ok(9)));
    }

    #[test]
    fn filters_only_see_their_registered_type() {
        let mut chain = FilterChain::default();
        chain.add_record_filter(&[RecordType::Double], |_, _| Ok(FilterOutput::Discard));

        let (out, report, _) = run(
            &chain,
            batch(&[("a", Record::integer(1)), ("b", Record::double(2.5))]),
        );
        assert!(out.contains_key("a"));
        assert!(!out.contains_key("b"));
        assert_eq!(report.discarded, 1);
    }

    #[test]
    fn empty_replacement_discards_update() {
        let mut chain = FilterChain::default();
        chain.add_record_filter(&[RecordType::String], |_, _| {
            Ok(FilterOutput::Replace(Record::empty()))
        });
        let (out, report, _) = run(&chain, batch(&[("name", Record::string("x"))]));
        assert!(out.is_empty());
        assert_eq!(report.discarded, 1);
    }

    #[test]
    fn failing_and_panicking_filters_pass_value_through() {
        let mut chain = FilterChain::default();
        chain.add_record_filter(&[RecordType::Integer], |_, _| {
            Err(FilterError::new("sensor offline"))
        });
        chain.add_record_filter(&[RecordType::Integer], |_, _| panic!("bad filter"));
        chain.add_record_filter(&[RecordType::Integer], |args, _| {
            Ok(FilterOutput::replace(args.record.to_integer()? + 10))
        });

        let (out, report, _) = run(&chain, batch(&[("x", Record::integer(1))]));
        assert_eq!(report.failures, 2);
        assert_eq!(out.get("x").map(Record::to_integer), Some(Ok(11)));
    }

    #[test]
    fn failed_aggregate_filter_rolls_back_its_edits() {
        let mut chain = FilterChain::default();
        chain.add_aggregate_filter(|updates, transport, _| {
            updates.clear();
            transport.add_record("ghost", Record::integer(1));
            Err(FilterError::new("half done"))
        });
        chain.add_aggregate_filter(|_, transport, _| {
            transport.add_record("heartbeat", Record::integer(1));
            Ok(())
        });

        let (out, report, _) = run(&chain, batch(&[("x", Record::integer(1))]));
        assert_eq!(report.failures, 1);
        assert!(out.contains_key("x"));
        assert!(out.contains_key("heartbeat"));
        assert!(!out.contains_key("ghost"));
    }

    #[test]
    fn filters_can_write_through_variables() {
        let mut chain = FilterChain::default();
        chain.add_record_filter(&[RecordType::Integer], |args, vars| {
            vars.set(".last_filtered", args.name);
            Ok(FilterOutput::Unchanged)
        });
        let (_, _, context) = run(&chain, batch(&[("x", Record::integer(1))]));
        assert_eq!(context.get(".last_filtered"), Record::string("x"));
    }

    #[test]
    fn chain_bookkeeping() {
        let mut chain = FilterChain::default();
        assert!(chain.is_empty());
        chain.add_record_filter(&[RecordType::Integer, RecordType::Double], |_, _| {
            Ok(FilterOutput::Unchanged)
        });
        assert_eq!(chain.record_filter_count(RecordType::Integer), 1);
        assert_eq!(chain.record_filter_count(RecordType::Double), 1);
        chain.clear_record_filters(RecordType::Integer);
        assert_eq!(chain.record_filter_count(RecordType::Integer), 0);
        assert!(!chain.is_empty());
        assert_eq!(chain.aggregate_filter_count(), 0);
    }
}
