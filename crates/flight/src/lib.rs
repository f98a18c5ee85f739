//! Hangar flights: loading modules, caching them, and evaluating them into resource documents.
//!
//! A flight is a module invocation `execute(module, stdin, env) -> stdout | error`. The
//! [`ProcessEvaluator`] runs a module as a child process with a deadline; other sandboxes plug in
//! through the [`Evaluator`] trait.

#![forbid(unsafe_code)]

mod cache;
mod error;
mod evaluator;
mod module;

pub use cache::ModuleCache;
pub use error::EvalError;
pub use evaluator::{EvalConfig, Evaluation, Evaluator, Flight, ProcessEvaluator, ENV_NAMESPACE, ENV_RELEASE};
pub use module::Module;
