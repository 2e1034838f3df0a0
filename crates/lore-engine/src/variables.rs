use std::collections::BTreeMap;

use lore_core::{Clock, Record, Value};

use crate::context::{Context, UpdateOutcome};
use crate::error::KbError;
use crate::settings::EvalSettings;

/// Restricted context view handed to callbacks and filters.
///
/// Reads and writes go straight to the context without the reentrancy
/// check, and there is no way to evaluate or wait from here.
pub struct Variables<'a> {
    context: &'a Context,
    settings: &'a EvalSettings,
}

impl<'a> Variables<'a> {
    pub fn new(context: &'a Context, settings: &'a EvalSettings) -> Self {
        Self { context, settings }
    }

    pub fn get(&self, name: &str) -> Record {
        self.context.get(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.context.exists(name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> UpdateOutcome {
        self.context.set(name, value, self.settings)
    }

    pub fn set_record(&mut self, name: &str, record: Record) -> UpdateOutcome {
        self.context.apply_update(name, record, self.settings)
    }

    pub fn to_list(&self, prefix: &str, start: i64, end: i64) -> Result<Vec<Record>, KbError> {
        self.context.to_list(prefix, start, end)
    }

    pub fn to_map(&self, pattern: &str) -> Result<BTreeMap<String, Record>, KbError> {
        self.context.to_map(pattern)
    }

    pub fn clock(&self) -> Clock {
        self.context.clock()
    }

    pub fn expand_statement(&self, statement: &str) -> String {
        self.context.expand_statement(statement)
    }
}

#[cfg(test)]
mod tests {
    use super::Variables;
    use crate::context::Context;
    use crate::settings::EvalSettings;

    #[test]
    fn writes_through_view_are_ordinary_local_writes() {
        let ctx = Context::new();
        let settings = EvalSettings::default();
        let mut vars = Variables::new(&ctx, &settings);
        vars.set("seen", 1_i64);
        assert_eq!(vars.get("seen").to_integer(), Ok(1));
        assert_eq!(ctx.modified_names(), vec!["seen".to_string()]);
        assert_eq!(vars.expand_statement("seen={seen}"), "seen=1");
    }
}
