//! LORE knowledge engine.
//!
//! Holds the named record store, the expression language that reads and
//! writes it, and the reentrancy guard that protects it from callbacks.

pub mod context;
pub mod error;
pub mod expr;
pub mod functions;
pub mod guard;
pub mod knowledge_base;
pub mod settings;
pub mod variables;

pub use context::{Context, ContextStats, UpdateOutcome, MAX_LIST_LEN};
pub use error::KbError;
pub use expr::{compile, CompiledExpression};
pub use functions::{FunctionBody, NativeFunction};
pub use guard::Guard;
pub use knowledge_base::{Disseminator, KnowledgeBase, RemoteMerge, WaitOutcome};
pub use settings::{EvalSettings, WaitSettings};
pub use variables::Variables;
