//! Guarded public facade over one context.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Instant;

use lore_core::{Clock, Quality, Record, Value};
use tracing::{debug, info, warn};

use crate::context::{Context, ContextStats, UpdateOutcome};
use crate::error::KbError;
use crate::expr::{compile, CompiledExpression, Evaluator};
use crate::functions::{FunctionBody, FunctionRegistry};
use crate::guard::Guard;
use crate::settings::{EvalSettings, WaitSettings};
use crate::variables::Variables;

/// Outbound seam implemented by transports.
pub trait Disseminator: Send + Sync {
    /// Sends one batch of modified global records.
    fn send_modifieds(&self, updates: &BTreeMap<String, Record>) -> Result<(), KbError>;
}

/// Terminal state of a `wait` call.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    /// Result of the last evaluation.
    pub record: Record,
    /// `max_wait_time` elapsed before the expression became true.
    pub timed_out: bool,
    pub evaluations: u64,
}

/// Counts from one merged peer batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteMerge {
    /// Records left after filtering.
    pub received: usize,
    pub applied: usize,
    pub stale: usize,
}

struct Shared {
    id: String,
    context: Context,
    guard: Guard,
    functions: FunctionRegistry,
    disseminators: RwLock<Vec<Weak<dyn Disseminator>>>,
}

/// A process-local knowledge base. Clones share the same store.
#[derive(Clone)]
pub struct KnowledgeBase {
    shared: Arc<Shared>,
}

impl fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("id", &self.shared.id)
            .field("context", &self.shared.context.id())
            .finish()
    }
}

impl Default for KnowledgeBase {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeBase {
    /// Creates a knowledge base with a random peer id.
    pub fn new() -> Self {
        Self::with_id(format!("lore.{:08x}", rand::random::<u32>()))
    }

    /// Creates a knowledge base whose transports announce `id` as originator.
    pub fn with_id(id: impl Into<String>) -> Self {
        let context = Context::new();
        let guard = Guard::new(context.id());
        Self {
            shared: Arc::new(Shared {
                id: id.into(),
                context,
                guard,
                functions: FunctionRegistry::default(),
                disseminators: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub(crate) fn context(&self) -> &Context {
        &self.shared.context
    }

    pub(crate) fn guard(&self) -> &Guard {
        &self.shared.guard
    }

    /// Whether the calling thread is inside a callback on this knowledge base.
    pub fn is_locked(&self) -> bool {
        self.guard().is_locked()
    }

    /// Runs `body` as a callback: serialized against other callbacks and
    /// inbound merges, with any re-entry into this knowledge base failing
    /// as `Locked`.
    pub fn run_exclusive<R>(
        &self,
        settings: &EvalSettings,
        body: impl FnOnce(&mut Variables<'_>) -> R,
    ) -> Result<R, KbError> {
        let section = self.guard().exclusive()?;
        let mut vars = Variables::new(self.context(), settings);
        Ok(section.run_callback(|| body(&mut vars)))
    }

    /// Merges a batch received from a peer.
    ///
    /// `filter` runs first as a callback and returns the records to merge
    /// plus a value handed back to the caller. The clock is then raised to
    /// `clock` and non-stale records are applied, all inside one exclusive
    /// section. Merged records are never queued for dissemination.
    pub fn merge_remote<T>(
        &self,
        clock: Clock,
        settings: &EvalSettings,
        filter: impl FnOnce(&mut Variables<'_>) -> (BTreeMap<String, Record>, T),
    ) -> Result<(RemoteMerge, T), KbError> {
        let section = self.guard().exclusive()?;
        let mut vars = Variables::new(self.context(), settings);
        let (updates, extra) = section.run_callback(|| filter(&mut vars));
        let received = updates.len();
        self.context().set_clock(clock);
        let (applied, stale) = self.context().merge_updates(updates);
        Ok((
            RemoteMerge {
                received,
                applied,
                stale,
            },
            extra,
        ))
    }

    /// Registers an outbound path. The knowledge base holds it weakly, so
    /// the caller keeps the transport alive.
    pub fn attach<D>(&self, disseminator: &Arc<D>)
    where
        D: Disseminator + 'static,
    {
        let shared: Arc<dyn Disseminator> = Arc::clone(disseminator) as Arc<dyn Disseminator>;
        self.shared
            .disseminators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&shared));
    }

    /// Forgets every attached transport.
    pub fn close_transports(&self) {
        self.shared
            .disseminators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn get(&self, name: &str) -> Result<Record, KbError> {
        self.guard().check()?;
        Ok(self.context().get(name))
    }

    pub fn exists(&self, name: &str) -> Result<bool, KbError> {
        self.guard().check()?;
        Ok(self.context().exists(name))
    }

    /// Local write with default settings, sent immediately.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<UpdateOutcome, KbError> {
        self.set_with(name, value, &EvalSettings::DEFAULT)
    }

    pub fn set_with(
        &self,
        name: &str,
        value: impl Into<Value>,
        settings: &EvalSettings,
    ) -> Result<UpdateOutcome, KbError> {
        self.guard().check()?;
        let outcome = self.context().set(name, value, settings);
        self.flush_unless_delayed(settings)?;
        Ok(outcome)
    }

    /// Writes a record carrying its own clock and quality.
    pub fn set_record(
        &self,
        name: &str,
        record: Record,
        settings: &EvalSettings,
    ) -> Result<UpdateOutcome, KbError> {
        self.guard().check()?;
        let outcome = self.context().apply_update(name, record, settings);
        self.flush_unless_delayed(settings)?;
        Ok(outcome)
    }

    pub fn set_write_quality(&self, name: &str, quality: Quality) -> Result<(), KbError> {
        self.guard().check()?;
        self.context().set_write_quality(name, quality);
        Ok(())
    }

    pub fn clock(&self) -> Result<Clock, KbError> {
        self.guard().check()?;
        Ok(self.context().clock())
    }

    pub fn clear(&self) -> Result<(), KbError> {
        self.guard().check()?;
        self.context().clear();
        Ok(())
    }

    /// Removes one name. Returns whether it was present.
    pub fn clear_variable(&self, name: &str) -> Result<bool, KbError> {
        self.guard().check()?;
        Ok(self.context().delete(name))
    }

    pub fn to_list(&self, prefix: &str, start: i64, end: i64) -> Result<Vec<Record>, KbError> {
        self.guard().check()?;
        self.context().to_list(prefix, start, end)
    }

    pub fn to_map(&self, pattern: &str) -> Result<BTreeMap<String, Record>, KbError> {
        self.guard().check()?;
        self.context().to_map(pattern)
    }

    pub fn snapshot(&self) -> Result<BTreeMap<String, Record>, KbError> {
        self.guard().check()?;
        Ok(self.context().snapshot())
    }

    pub fn stats(&self) -> ContextStats {
        self.context().stats()
    }

    pub fn compile(&self, expression: &str) -> Result<CompiledExpression, KbError> {
        self.guard().check()?;
        compile(expression)
    }

    pub fn evaluate(&self, expression: &str, settings: &EvalSettings) -> Result<Record, KbError> {
        let compiled = self.compile(expression)?;
        self.evaluate_compiled(&compiled, settings)
    }

    pub fn evaluate_compiled(
        &self,
        compiled: &CompiledExpression,
        settings: &EvalSettings,
    ) -> Result<Record, KbError> {
        self.guard().check()?;
        if let Some(statement) = &settings.pre_print_statement {
            self.emit_print(statement);
        }
        let result = self.run(compiled, settings)?;
        if let Some(statement) = &settings.post_print_statement {
            self.emit_print(statement);
        }
        self.flush_unless_delayed(settings)?;
        Ok(result)
    }

    pub fn wait(&self, expression: &str, settings: &WaitSettings) -> Result<WaitOutcome, KbError> {
        let compiled = self.compile(expression)?;
        self.wait_compiled(&compiled, settings)
    }

    /// Re-evaluates until the result is true or `max_wait_time` elapses.
    /// Sleeps at most `poll_frequency` between evaluations and wakes early
    /// when the context changes.
    pub fn wait_compiled(
        &self,
        compiled: &CompiledExpression,
        settings: &WaitSettings,
    ) -> Result<WaitOutcome, KbError> {
        self.guard().check()?;
        let eval = &settings.eval;
        if let Some(statement) = &eval.pre_print_statement {
            self.emit_print(statement);
        }
        let started = Instant::now();
        let mut evaluations = 0_u64;
        let outcome = loop {
            let record = self.run(compiled, eval)?;
            evaluations += 1;
            let seen = self.context().generation();
            self.flush_unless_delayed(eval)?;
            if record.is_true() {
                break WaitOutcome {
                    record,
                    timed_out: false,
                    evaluations,
                };
            }

            let mut pause = settings.poll_frequency;
            if !settings.max_wait_time.is_zero() {
                let elapsed = started.elapsed();
                if elapsed >= settings.max_wait_time {
                    debug!(
                        "knowledge base: wait timed out after {} evaluations",
                        evaluations
                    );
                    break WaitOutcome {
                        record,
                        timed_out: true,
                        evaluations,
                    };
                }
                pause = pause.min(settings.max_wait_time - elapsed);
            }
            self.context().wait_changed(seen, pause);
        };
        if let Some(statement) = &eval.post_print_statement {
            self.emit_print(statement);
        }
        Ok(outcome)
    }

    /// Defines a function whose body is another expression.
    pub fn define_function(&self, name: &str, expression: &str) -> Result<(), KbError> {
        self.guard().check()?;
        let compiled = compile(expression)?;
        self.shared
            .functions
            .define(name, FunctionBody::Expression(compiled));
        Ok(())
    }

    /// Defines a host function. It runs under the context's exclusive
    /// section and must not call back into this knowledge base.
    pub fn define_native_function<F>(&self, name: &str, function: F) -> Result<(), KbError>
    where
        F: Fn(&[Record], &mut Variables<'_>) -> Result<Record, KbError> + Send + Sync + 'static,
    {
        self.guard().check()?;
        self.shared
            .functions
            .define(name, FunctionBody::native(function));
        Ok(())
    }

    /// Hands the pending modified set to every attached transport. Returns
    /// the number of records sent, zero when nothing was pending.
    pub fn send_modifieds(&self) -> Result<usize, KbError> {
        self.guard().check()?;
        let batch = self.context().take_modifieds();
        if batch.is_empty() {
            return Ok(0);
        }
        let live: Vec<Arc<dyn Disseminator>> = {
            let mut list = self
                .shared
                .disseminators
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            list.retain(|weak| weak.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        debug!(
            "knowledge base: sending {} modified records to {} transports",
            batch.len(),
            live.len()
        );
        let mut first_error = None;
        for disseminator in live {
            if let Err(err) = disseminator.send_modifieds(&batch) {
                warn!("knowledge base: transport send failed: {err}");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(batch.len()),
        }
    }

    /// Expands `{name}` references, logs the result, and returns it.
    pub fn print(&self, statement: &str) -> Result<String, KbError> {
        self.guard().check()?;
        Ok(self.emit_print(statement))
    }

    fn emit_print(&self, statement: &str) -> String {
        let expanded = self.context().expand_statement(statement);
        info!(target: "lore::print", "{expanded}");
        expanded
    }

    fn run(&self, compiled: &CompiledExpression, settings: &EvalSettings) -> Result<Record, KbError> {
        Evaluator::new(
            &self.shared.context,
            &self.shared.guard,
            &self.shared.functions,
            settings,
        )
        .eval(compiled.root())
    }

    fn flush_unless_delayed(&self, settings: &EvalSettings) -> Result<(), KbError> {
        if !settings.delay_sending_modifieds {
            self.send_modifieds()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use lore_core::Record;

    use super::{Disseminator, KnowledgeBase, RemoteMerge};
    use crate::error::KbError;
    use crate::settings::EvalSettings;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<BTreeMap<String, Record>>>,
    }

    impl Disseminator for Recorder {
        fn send_modifieds(&self, updates: &BTreeMap<String, Record>) -> Result<(), KbError> {
            self.batches
                .lock()
                .expect("recorder lock")
                .push(updates.clone());
            Ok(())
        }
    }

    #[test]
    fn writes_are_sent_unless_delayed() {
        let kb = KnowledgeBase::with_id("agent.0");
        let recorder = Arc::new(Recorder::default());
        kb.attach(&recorder);

        kb.set("x", 1_i64).expect("set should succeed");
        kb.set_with("y", 2_i64, &EvalSettings::delayed())
            .expect("delayed set should succeed");
        kb.set(".local", 3_i64).expect("local set should succeed");
        assert_eq!(recorder.batches.lock().expect("lock").len(), 1);

        assert_eq!(kb.send_modifieds(), Ok(1));
        let batches = recorder.batches.lock().expect("lock");
        assert_eq!(batches.len(), 2);
        assert!(batches[1].contains_key("y"));
        assert!(batches.iter().all(|batch| !batch.contains_key(".local")));
    }

    #[test]
    fn modifieds_clear_without_transports() {
        let kb = KnowledgeBase::new();
        kb.set_with("x", 1_i64, &EvalSettings::delayed())
            .expect("set should succeed");
        assert_eq!(kb.send_modifieds(), Ok(1));
        assert_eq!(kb.send_modifieds(), Ok(0));
    }

    #[test]
    fn dropped_transports_are_pruned() {
        let kb = KnowledgeBase::new();
        let recorder = Arc::new(Recorder::default());
        kb.attach(&recorder);
        drop(recorder);
        assert_eq!(kb.set("x", 1_i64).map(|o| o.is_applied()), Ok(true));
    }

    #[test]
    fn print_expands_and_returns_text() {
        let kb = KnowledgeBase::new();
        kb.set("count", 3_i64).expect("set should succeed");
        assert_eq!(
            kb.print("count is {count}").expect("print should succeed"),
            "count is 3"
        );
    }

    #[test]
    fn native_function_cannot_reenter_its_knowledge_base() {
        let kb = KnowledgeBase::new();
        let inner = kb.clone();
        kb.define_native_function("reenter", move |_, _| {
            inner.set("x", 1_i64)?;
            Ok(Record::integer(1))
        })
        .expect("define should succeed");
        assert_eq!(
            kb.evaluate("reenter()", &EvalSettings::default()),
            Err(KbError::Locked)
        );
        assert!(!kb.exists("x").expect("exists should succeed"));
    }

    #[test]
    fn merge_remote_filters_then_merges_without_queueing() {
        let kb = KnowledgeBase::new();
        let recorder = Arc::new(Recorder::default());
        kb.attach(&recorder);
        kb.set_with("kept", 9_i64, &EvalSettings::delayed())
            .expect("set should succeed");

        let inbound = BTreeMap::from([
            ("kept".to_string(), Record::integer(1).with_clock(0)),
            ("fresh".to_string(), Record::integer(2).with_clock(5)),
            ("noise".to_string(), Record::integer(3).with_clock(5)),
        ]);
        let (merge, saw) = kb
            .merge_remote(12, &EvalSettings::delayed(), |vars| {
                vars.set(".filtered", 1_i64);
                let mut updates = inbound;
                updates.remove("noise");
                let saw = updates.len();
                (updates, saw)
            })
            .expect("merge should succeed");

        assert_eq!(saw, 2);
        assert_eq!(
            merge,
            RemoteMerge {
                received: 2,
                applied: 1,
                stale: 1,
            }
        );
        assert_eq!(kb.get("kept").map(|r| r.to_integer()), Ok(Ok(9)));
        assert!(!kb.exists("noise").expect("exists should succeed"));
        assert!(kb.clock().expect("clock should read") >= 12);
        assert_eq!(kb.send_modifieds(), Ok(1));
        let batches = recorder.batches.lock().expect("lock");
        assert!(batches.iter().all(|batch| !batch.contains_key("fresh")));
    }

    #[test]
    fn transport_entry_points_are_locked_inside_callbacks() {
        let kb = KnowledgeBase::new();
        let inner = kb.clone();
        kb.define_native_function("reenter", move |_, _| {
            assert!(inner.is_locked());
            let merged = inner.merge_remote(1, &EvalSettings::DEFAULT, |_| (BTreeMap::new(), ()));
            assert_eq!(merged.map(|_| ()), Err(KbError::Locked));
            inner.run_exclusive(&EvalSettings::DEFAULT, |_| ())?;
            Ok(Record::integer(1))
        })
        .expect("define should succeed");
        assert_eq!(
            kb.evaluate("reenter()", &EvalSettings::default()),
            Err(KbError::Locked)
        );
        assert!(!kb.is_locked());
        assert_eq!(kb.run_exclusive(&EvalSettings::DEFAULT, |vars| vars.exists("x")), Ok(false));
    }
}
