use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lore_core::{ops, Record, RecordError, Value};
use rand::Rng;
use tracing::{info, warn};

use super::tree::{NameRef, NameSegment, Node, SystemCall, Target};
use crate::context::Context;
use crate::error::KbError;
use crate::functions::{FunctionBody, FunctionRegistry};
use crate::guard::Guard;
use crate::settings::EvalSettings;
use crate::variables::Variables;

/// Maximum nesting of user function calls.
pub const MAX_CALL_DEPTH: usize = 64;

/// Maximum tree depth walked by one evaluation, across function calls.
pub const MAX_EVAL_DEPTH: usize = 256;

/// Walks a tree against one context. Each sub-expression's writes are
/// committed as soon as it completes.
pub(crate) struct Evaluator<'a> {
    context: &'a Context,
    guard: &'a Guard,
    functions: &'a FunctionRegistry,
    settings: &'a EvalSettings,
    depth: usize,
    nesting: usize,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(
        context: &'a Context,
        guard: &'a Guard,
        functions: &'a FunctionRegistry,
        settings: &'a EvalSettings,
    ) -> Self {
        Self {
            context,
            guard,
            functions,
            settings,
            depth: 0,
            nesting: 0,
        }
    }

    pub(crate) fn eval(&mut self, node: &Node) -> Result<Record, KbError> {
        if self.nesting >= MAX_EVAL_DEPTH {
            return Err(KbError::NestingLimit(MAX_EVAL_DEPTH));
        }
        self.nesting += 1;
        let result = self.eval_node(node);
        self.nesting -= 1;
        result
    }

    fn eval_node(&mut self, node: &Node) -> Result<Record, KbError> {
        match node {
            Node::Literal(record) => Ok(record.clone()),
            Node::Variable(name) => {
                let name = self.resolve(name);
                Ok(self.context.get(&name))
            }
            Node::Index { name, index } => {
                let name = self.resolve(name);
                let index = self.index(index)?;
                Ok(ops::retrieve_index(&self.context.get(&name), index)?)
            }
            Node::Assign { target, op, value } => {
                let value = self.eval(value)?;
                self.assign(target, |current| match op {
                    None => Ok(value),
                    Some(op) => op.apply(current, &value),
                })
            }
            Node::Step { target, delta } => {
                let delta = Record::integer(*delta);
                self.assign(target, |current| ops::add(current, &delta))
            }
            Node::Unary { op, operand } => Ok(op.apply(&self.eval(operand)?)?),
            Node::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                Ok(op.apply(&lhs, &rhs)?)
            }
            Node::And(lhs, rhs) => {
                let truth = self.eval(lhs)?.is_true() && self.eval(rhs)?.is_true();
                Ok(Record::integer(i64::from(truth)))
            }
            Node::Or(lhs, rhs) => {
                let truth = self.eval(lhs)?.is_true() || self.eval(rhs)?.is_true();
                Ok(Record::integer(i64::from(truth)))
            }
            Node::Implies(lhs, rhs) => {
                if self.eval(lhs)?.is_true() {
                    self.eval(rhs)
                } else {
                    Ok(Record::integer(0))
                }
            }
            Node::Both(lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                Ok(ops::max(lhs, rhs))
            }
            Node::Sequence(items) => {
                let mut last = Record::empty();
                for item in items {
                    last = self.eval(item)?;
                }
                Ok(last)
            }
            Node::Call { name, args } => self.call(name, args),
            Node::System { call, args } => self.system(*call, args),
        }
    }

    fn resolve(&self, name: &NameRef) -> String {
        if let Some(name) = name.as_static() {
            return name.to_string();
        }
        let mut out = String::new();
        for segment in name.segments() {
            match segment {
                NameSegment::Text(text) => out.push_str(text),
                NameSegment::Expand(var) => {
                    out.push_str(&self.context.get(var).to_string_value());
                }
            }
        }
        out
    }

    fn index(&mut self, node: &Node) -> Result<usize, KbError> {
        let index = self.eval(node)?.to_integer()?;
        usize::try_from(index).map_err(|_| KbError::InvalidIndex(index))
    }

    /// Reads the target, computes its next value, and writes it back under
    /// one context lock. Returns the value written to the addressed slot.
    fn assign(
        &mut self,
        target: &Target,
        next: impl FnOnce(&Record) -> Result<Record, RecordError>,
    ) -> Result<Record, KbError> {
        match target {
            Target::Variable(name) => {
                let name = self.resolve(name);
                self.context.update(&name, self.settings, |current| {
                    let value = next(current)?;
                    Ok::<_, KbError>((value.value().clone(), value))
                })
            }
            Target::Index { name, index } => {
                let name = self.resolve(name);
                let index = self.index(index)?;
                if index >= ops::MAX_ARRAY_LEN {
                    return Err(KbError::InvalidIndex(i64::try_from(index).unwrap_or(i64::MAX)));
                }
                self.context.update(&name, self.settings, |current| {
                    let element = next(&ops::retrieve_index(current, index)?)?;
                    let mut array = current.clone();
                    ops::set_index(&mut array, index, &element)?;
                    Ok::<_, KbError>((array.into_value(), element))
                })
            }
        }
    }

    fn call(&mut self, name: &str, args: &[Node]) -> Result<Record, KbError> {
        let Some(body) = self.functions.get(name) else {
            return Err(KbError::UnknownFunction(name.to_string()));
        };
        if self.depth >= MAX_CALL_DEPTH {
            return Err(KbError::RecursionLimit(MAX_CALL_DEPTH));
        }
        let args = args
            .iter()
            .map(|arg| self.eval(arg))
            .collect::<Result<Vec<_>, _>>()?;

        match body {
            FunctionBody::Expression(compiled) => {
                let bound: Vec<(String, Option<Record>)> = args
                    .into_iter()
                    .enumerate()
                    .map(|(idx, arg)| {
                        let local = format!(".{idx}");
                        let previous = self.context.bind_local(&local, arg);
                        (local, previous)
                    })
                    .collect();
                self.depth += 1;
                let result = self.eval(compiled.root());
                self.depth -= 1;
                for (local, previous) in bound.into_iter().rev() {
                    self.context.restore_local(&local, previous);
                }
                result
            }
            FunctionBody::Native(function) => {
                let section = self.guard.exclusive()?;
                let mut vars = Variables::new(self.context, self.settings);
                let outcome = section.run_callback(|| {
                    panic::catch_unwind(AssertUnwindSafe(|| function(args.as_slice(), &mut vars)))
                });
                outcome.unwrap_or_else(|_| {
                    warn!("evaluator: function {name} panicked");
                    Err(KbError::Callback(format!("function {name} panicked")))
                })
            }
        }
    }

    fn args(&mut self, args: &[Node]) -> Result<Vec<Record>, KbError> {
        args.iter().map(|arg| self.eval(arg)).collect()
    }

    fn system(&mut self, call: SystemCall, args: &[Node]) -> Result<Record, KbError> {
        match call {
            SystemCall::Print => {
                let text: String = self
                    .args(args)?
                    .iter()
                    .map(Record::to_string_value)
                    .collect();
                let expanded = self.context.expand_statement(&text);
                info!(target: "lore::print", "{expanded}");
                Ok(Record::string(expanded))
            }
            SystemCall::ToInteger => Ok(Record::integer(self.first(args)?.to_integer()?)),
            SystemCall::ToDouble => Ok(Record::double(self.first(args)?.to_double()?)),
            SystemCall::ToString => {
                let values = self.args(args)?;
                let [value, rest @ ..] = values.as_slice() else {
                    return Ok(Record::string(""));
                };
                match rest.first() {
                    Some(delimiter) => Ok(Record::string(join_with(value, &delimiter.to_string_value()))),
                    None => Ok(Record::string(value.to_string_value())),
                }
            }
            SystemCall::Size => Ok(Record::integer(self.first(args)?.size() as i64)),
            SystemCall::Type => Ok(Record::string(self.first(args)?.record_type().name())),
            SystemCall::GetTime => {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
                    .unwrap_or(0);
                Ok(Record::integer(nanos))
            }
            SystemCall::Sleep => {
                let seconds = self.first(args)?.to_double()?;
                if let Ok(duration) = Duration::try_from_secs_f64(seconds) {
                    thread::sleep(duration);
                }
                Ok(Record::double(seconds))
            }
            SystemCall::RandInt => {
                let values = self.args(args)?;
                let floor = values.first().map_or(Ok(0), Record::to_integer)?;
                let ceiling = values
                    .get(1)
                    .map_or(Ok(i64::from(i32::MAX)), Record::to_integer)?;
                let (low, high) = (floor.min(ceiling), floor.max(ceiling));
                Ok(Record::integer(rand::thread_rng().gen_range(low..=high)))
            }
            SystemCall::RandDouble => {
                let values = self.args(args)?;
                let floor = values.first().map_or(Ok(0.0), Record::to_double)?;
                let ceiling = values.get(1).map_or(Ok(1.0), Record::to_double)?;
                let (low, high) = (floor.min(ceiling), floor.max(ceiling));
                if low >= high || !low.is_finite() || !high.is_finite() {
                    return Ok(Record::double(low));
                }
                Ok(Record::double(rand::thread_rng().gen_range(low..high)))
            }
            SystemCall::ClearVariable => {
                let name = match args.first() {
                    Some(Node::Variable(name)) => self.resolve(name),
                    _ => self.first(args)?.to_string_value(),
                };
                Ok(Record::integer(i64::from(self.context.delete(&name))))
            }
        }
    }

    fn first(&mut self, args: &[Node]) -> Result<Record, KbError> {
        match args.first() {
            Some(node) => self.eval(node),
            None => Ok(Record::empty()),
        }
    }
}

fn join_with(record: &Record, delimiter: &str) -> String {
    match record.value() {
        Value::IntegerArray(items) => items
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(delimiter),
        Value::DoubleArray(items) => items
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(delimiter),
        _ => record.to_string_value(),
    }
}

#[cfg(test)]
mod tests {
    use lore_core::Record;

    use lore_core::ops::MAX_ARRAY_LEN;

    use super::{Evaluator, MAX_CALL_DEPTH, MAX_EVAL_DEPTH};
    use crate::context::Context;
    use crate::error::KbError;
    use crate::expr::compile;
    use crate::functions::{FunctionBody, FunctionRegistry};
    use crate::guard::Guard;
    use crate::settings::EvalSettings;

    struct Fixture {
        context: Context,
        guard: Guard,
        functions: FunctionRegistry,
        settings: EvalSettings,
    }

    impl Fixture {
        fn new() -> Self {
            let context = Context::new();
            let guard = Guard::new(context.id());
            Self {
                context,
                guard,
                functions: FunctionRegistry::default(),
                settings: EvalSettings::default(),
            }
        }

        fn eval(&self, source: &str) -> Result<Record, KbError> {
            let compiled = compile(source)?;
            Evaluator::new(&self.context, &self.guard, &self.functions, &self.settings)
                .eval(compiled.root())
        }
    }

    #[test]
    fn assignments_and_sequences() {
        let fx = Fixture::new();
        let result = fx.eval("x = 5; y = x + 1; y *= 2").expect("should evaluate");
        assert_eq!(result, Record::integer(12));
        assert_eq!(fx.context.get("x").to_integer(), Ok(5));
        assert_eq!(fx.context.get("y").to_integer(), Ok(12));
    }

    #[test]
    fn logical_operators_short_circuit() {
        let fx = Fixture::new();
        fx.eval("0 && (a = 1); 1 || (b = 1)").expect("should evaluate");
        assert!(!fx.context.exists("a"));
        assert!(!fx.context.exists("b"));
        assert_eq!(fx.eval("2 && 'x'"), Ok(Record::integer(1)));
    }

    #[test]
    fn implies_and_comma() {
        let fx = Fixture::new();
        assert_eq!(fx.eval("0 => (z = 1)"), Ok(Record::integer(0)));
        assert!(!fx.context.exists("z"));
        assert_eq!(fx.eval("1 => 7"), Ok(Record::integer(7)));
        assert_eq!(fx.eval("(a = 3), (b = 9)"), Ok(Record::integer(9)));
        assert_eq!(fx.context.get("a").to_integer(), Ok(3));
    }

    #[test]
    fn prefix_steps_update_in_place() {
        let fx = Fixture::new();
        assert_eq!(fx.eval("++.i; ++.i; --.i"), Ok(Record::integer(1)));
        assert_eq!(fx.context.get(".i").to_integer(), Ok(1));
    }

    #[test]
    fn indexed_reads_and_writes() {
        let fx = Fixture::new();
        fx.eval("arr[2] = 5; arr[0] += 1.5").expect("should evaluate");
        assert_eq!(
            fx.context.get("arr").to_double_array(),
            Ok(vec![1.5, 0.0, 5.0])
        );
        assert_eq!(fx.eval("arr[2]"), Ok(Record::double(5.0)));
        assert_eq!(fx.eval("arr[-1]"), Err(KbError::InvalidIndex(-1)));
    }

    #[test]
    fn huge_index_writes_fail_without_growing() {
        let fx = Fixture::new();
        fx.eval("arr[1] = 2").expect("should evaluate");
        assert_eq!(
            fx.eval("arr[9223372036854775807] = 1"),
            Err(KbError::InvalidIndex(i64::MAX))
        );
        let limit = i64::try_from(MAX_ARRAY_LEN).expect("limit fits");
        assert_eq!(
            fx.eval(&format!("arr[{limit}] += 1")),
            Err(KbError::InvalidIndex(limit))
        );
        assert_eq!(fx.context.get("arr").to_integer_array(), Ok(vec![0, 2]));
        assert_eq!(fx.context.get("arr").clock, 1);
        assert_eq!(fx.eval("arr[9223372036854775807]"), Ok(Record::empty()));
    }

    #[test]
    fn names_expand_from_variables() {
        let fx = Fixture::new();
        fx.eval(".id = 3; agent{.id}.ready = 1").expect("should evaluate");
        assert_eq!(fx.context.get("agent3.ready").to_integer(), Ok(1));
        assert_eq!(fx.eval("agent{.id}.ready"), Ok(Record::integer(1)));
    }

    #[test]
    fn expression_functions_bind_arguments_as_locals() {
        let fx = Fixture::new();
        fx.functions.define(
            "sum",
            FunctionBody::Expression(compile(".0 + .1").expect("body should compile")),
        );
        fx.eval(".0 = 'outer'").expect("should evaluate");
        assert_eq!(fx.eval("sum(2, 3)"), Ok(Record::integer(5)));
        assert_eq!(fx.context.get(".0").to_string_value(), "outer");
        assert!(!fx.context.exists(".1"));
    }

    #[test]
    fn recursive_functions_are_bounded() {
        let fx = Fixture::new();
        fx.functions.define(
            "fact",
            FunctionBody::Expression(
                compile("(.0 <= 1 => 1), (.0 > 1 => .0 * fact(.0 - 1))").expect("body should compile"),
            ),
        );
        assert_eq!(fx.eval("fact(5)"), Ok(Record::integer(120)));

        fx.functions.define(
            "forever",
            FunctionBody::Expression(compile("forever()").expect("body should compile")),
        );
        assert_eq!(
            fx.eval("forever()"),
            Err(KbError::RecursionLimit(MAX_CALL_DEPTH))
        );
    }

    #[test]
    fn deep_bodies_hit_the_evaluation_depth_limit() {
        let fx = Fixture::new();
        let body = format!("{}deep(){}", "1 + (".repeat(100), ")".repeat(100));
        fx.functions.define(
            "deep",
            FunctionBody::Expression(compile(&body).expect("body should compile")),
        );
        assert_eq!(fx.eval("deep()"), Err(KbError::NestingLimit(MAX_EVAL_DEPTH)));
        assert_eq!(fx.eval("1 + 1"), Ok(Record::integer(2)));
    }

    #[test]
    fn native_functions_see_arguments_and_variables() {
        let fx = Fixture::new();
        fx.functions.define(
            "stamp",
            FunctionBody::native(|args, vars| {
                vars.set("stamped", args.len() as i64);
                Ok(Record::integer(args[0].to_integer()? * 10))
            }),
        );
        assert_eq!(fx.eval("stamp(4, 'x')"), Ok(Record::integer(40)));
        assert_eq!(fx.context.get("stamped").to_integer(), Ok(2));
        assert_eq!(
            fx.eval("missing(1)"),
            Err(KbError::UnknownFunction("missing".to_string()))
        );
    }

    #[test]
    fn panicking_native_function_is_reported() {
        let fx = Fixture::new();
        fx.functions
            .define("boom", FunctionBody::native(|_, _| panic!("native failure")));
        assert!(matches!(fx.eval("boom()"), Err(KbError::Callback(_))));
        assert!(fx.guard.check().is_ok());
    }

    #[test]
    fn system_calls() {
        let fx = Fixture::new();
        assert_eq!(fx.eval("#to_integer('12')"), Ok(Record::integer(12)));
        assert_eq!(fx.eval("#to_double(3)"), Ok(Record::double(3.0)));
        assert_eq!(fx.eval("#type(1.5)"), Ok(Record::string("double")));
        assert_eq!(fx.eval("#size('abcd')"), Ok(Record::integer(4)));
        assert_eq!(fx.eval("a[1] = 2; #to_string(a, ';')"), Ok(Record::string("0;2")));
        assert_eq!(fx.eval("x = 4; #print('x={x}')"), Ok(Record::string("x=4")));

        let roll = fx
            .eval("#rand_int(1, 6)")
            .and_then(|r| Ok(r.to_integer()?))
            .expect("rand should evaluate");
        assert!((1..=6).contains(&roll));
        let unit = fx
            .eval("#rand_double()")
            .and_then(|r| Ok(r.to_double()?))
            .expect("rand should evaluate");
        assert!((0.0..1.0).contains(&unit));

        assert_eq!(fx.eval("#clear_variable(x)"), Ok(Record::integer(1)));
        assert!(!fx.context.exists("x"));
        assert_eq!(fx.eval("#clear_variable('x')"), Ok(Record::integer(0)));
        assert!(fx.eval("#get_time()").expect("time").to_integer().expect("int") > 0);
    }

    #[test]
    fn runtime_errors_surface() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.eval("1 / 0"),
            Err(KbError::Record(lore_core::RecordError::DivisionByZero))
        ));
        assert!(matches!(
            fx.eval("a = 1; a[0]"),
            Err(KbError::Record(lore_core::RecordError::TypeMismatch { .. }))
        ));
    }
}
