use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use lore_core::Record;

use crate::error::KbError;
use crate::expr::CompiledExpression;
use crate::variables::Variables;

/// Host-supplied function body. Receives evaluated arguments and a
/// restricted view of the calling context.
pub type NativeFunction =
    Arc<dyn Fn(&[Record], &mut Variables<'_>) -> Result<Record, KbError> + Send + Sync>;

#[derive(Clone)]
pub enum FunctionBody {
    /// Expression body; arguments are bound as locals `.0`, `.1`, ...
    Expression(CompiledExpression),
    Native(NativeFunction),
}

impl FunctionBody {
    pub fn native<F>(function: F) -> Self
    where
        F: Fn(&[Record], &mut Variables<'_>) -> Result<Record, KbError> + Send + Sync + 'static,
    {
        FunctionBody::Native(Arc::new(function))
    }
}

impl fmt::Debug for FunctionBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionBody::Expression(compiled) => {
                f.debug_tuple("Expression").field(&compiled.source()).finish()
            }
            FunctionBody::Native(_) => f.write_str("Native(..)"),
        }
    }
}

/// Named function table for one knowledge base.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, FunctionBody>>,
}

impl FunctionRegistry {
    /// Registers or replaces `name`.
    pub fn define(&self, name: impl Into<String>, body: FunctionBody) {
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), body);
    }

    pub fn get(&self, name: &str) -> Option<FunctionBody> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use lore_core::Record;

    use super::{FunctionBody, FunctionRegistry};

    #[test]
    fn later_definitions_replace_earlier_ones() {
        let registry = FunctionRegistry::default();
        registry.define("one", FunctionBody::native(|_, _| Ok(Record::integer(1))));
        registry.define("one", FunctionBody::native(|_, _| Ok(Record::integer(2))));
        assert!(registry.contains("one"));
        assert!(matches!(registry.get("one"), Some(FunctionBody::Native(_))));
        assert!(registry.get("two").is_none());
    }
}
