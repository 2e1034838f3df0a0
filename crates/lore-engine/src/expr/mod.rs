//! Expression language: lexer, parser, tree, and evaluator.

mod eval;
mod lexer;
mod parser;
mod tree;

pub(crate) use eval::Evaluator;
pub use eval::{MAX_CALL_DEPTH, MAX_EVAL_DEPTH};
pub use parser::MAX_EXPRESSION_DEPTH;
pub use tree::{
    AssignOp, BinaryOp, CompiledExpression, NameRef, NameSegment, Node, SystemCall, Target,
    UnaryOp,
};

use crate::error::KbError;

/// Parses and constant-folds `source`. Malformed input fails without
/// touching any context.
pub fn compile(source: &str) -> Result<CompiledExpression, KbError> {
    let root = parser::parse(source)?.fold();
    Ok(CompiledExpression::new(source, root))
}

#[cfg(test)]
mod tests {
    use super::compile;

    #[test]
    fn equal_sources_compile_to_equal_trees() {
        let first = compile("x = y * (2 + 3)").expect("should compile");
        let second = compile("x = y * (2 + 3)").expect("should compile");
        assert_eq!(first, second);
        assert_eq!(first.source(), "x = y * (2 + 3)");
    }
}
