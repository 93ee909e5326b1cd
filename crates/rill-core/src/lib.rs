//! # rill-core
//!
//! Compiler and linear evaluator for **RILL** (Rules In Linear
//! Layout): a parenthesized prefix language for boolean decisions and
//! values over a caller-supplied variable environment.
//!
//! ## Module Roles
//!
//! | Module | Responsibility | Public Entry Points |
//! |---|---|---|
//! | `engine` | Registries + compile facade | [`Engine`] |
//! | `program` | Linear program form, compile errors | [`Program`], [`CompileError`] |
//! | `runtime` | Operator registry, contexts, eval errors | [`Operators`], [`Context`], [`Selector`] |
//! | `value` | Tagged value type + JSON interop | [`Value`] |
//!
//! ## Execution Contract
//!
//! 1. Register selectors/constants/operators on an [`Engine`].
//! 2. Compile once: source → tokens → AST → linear [`Program`].
//! 3. Evaluate many times, each against its own [`Context`].
//!
//! The program is a flat node array with precomputed stack offsets and
//! short-circuit jump targets; evaluation is a single loop with no
//! recursion. Optimizations (constant folding, child reordering,
//! fast-operator fusion) are enabled per engine or per source through
//! a `;;;; optimize:true` comment header, and must never change
//! observable results.
//!
//! ## Hello World (one-shot API)
//!
//! ```
//! use rill_core::{eval, Value};
//! use std::collections::HashMap;
//!
//! let mut vars = HashMap::new();
//! vars.insert("age".to_string(), Value::Int(25));
//! let out = eval("(and (>= age 18) (< age 65))", &vars).expect("eval");
//! assert_eq!(out, Value::Bool(true));
//! ```
//!
//! ## Compile Once, Evaluate Many
//!
//! ```
//! use rill_core::{Context, Engine, MapSelector, Value};
//! use std::collections::HashMap;
//!
//! let mut engine = Engine::new();
//! engine.register_selector("age");
//! let program = engine
//!     .compile(";;;; optimize:true\n(>= age 18)")
//!     .expect("compile");
//!
//! for (age, expected) in [(30, true), (12, false)] {
//!     let mut vars = HashMap::new();
//!     vars.insert("age".to_string(), Value::Int(age));
//!     let selector = MapSelector::new(&engine, vars);
//!     let allowed = program.eval_bool(&Context::new(&selector)).expect("eval");
//!     assert_eq!(allowed, expected);
//! }
//! ```

use std::collections::HashMap;
use std::fmt;

pub mod engine;
pub mod program;
pub mod runtime;
pub mod value;

mod compiler;
mod reader;
mod vm;

pub use engine::Engine;
pub use program::{CompileError, CompileOptions, NodeKind, Program};
pub use runtime::{
    CancelHandle, Context, EvalError, EvalResult, MapSelector, OpEntry, OperatorFn, Operators,
    Selector, SelectorKey,
};
pub use value::Value;

/// Either phase of a one-shot evaluation can fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RillError {
    Compile(CompileError),
    Eval(EvalError),
}

impl fmt::Display for RillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RillError::Compile(e) => write!(f, "{e}"),
            RillError::Eval(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RillError {}

impl From<CompileError> for RillError {
    fn from(e: CompileError) -> Self {
        RillError::Compile(e)
    }
}

impl From<EvalError> for RillError {
    fn from(e: EvalError) -> Self {
        RillError::Eval(e)
    }
}

/// One-shot convenience: compile `source` against a fresh default
/// engine whose selectors are the variable names, then evaluate.
/// For repeated evaluation, hold an [`Engine`] and a [`Program`]
/// instead.
pub fn eval(source: &str, vars: &HashMap<String, Value>) -> Result<Value, RillError> {
    let mut engine = Engine::new();
    for name in vars.keys() {
        engine.register_selector(name.as_str());
    }
    let program = engine.compile(source)?;
    let selector = MapSelector::new(&engine, vars.clone());
    Ok(program.eval(&Context::new(&selector))?)
}

/// One-shot boolean decision; a non-boolean result is an error.
pub fn eval_bool(source: &str, vars: &HashMap<String, Value>) -> Result<bool, RillError> {
    match eval(source, vars)? {
        Value::Bool(b) => Ok(b),
        other => Err(RillError::Eval(EvalError::new(
            "RILL_E_RESULT",
            format!("expected a boolean result, got {} [{other}]", other.type_name()),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn one_shot_eval() {
        assert_eq!(eval("(+ 1 2)", &HashMap::new()), Ok(Value::Int(3)));
        assert_eq!(
            eval(
                "(if (< x 0) \"neg\" \"nonneg\")",
                &vars(&[("x", Value::Int(-3))])
            ),
            Ok(Value::from("neg"))
        );
    }

    #[test]
    fn one_shot_eval_bool() {
        assert_eq!(
            eval_bool("(> salary 100000)", &vars(&[("salary", Value::Int(150000))])),
            Ok(true)
        );
        let err = eval_bool("(+ 1 2)", &HashMap::new()).expect_err("non-boolean");
        assert!(matches!(err, RillError::Eval(e) if e.code == "RILL_E_RESULT"));
    }

    #[test]
    fn one_shot_surfaces_compile_errors() {
        let err = eval("(+ 1", &HashMap::new()).expect_err("unbalanced");
        assert!(matches!(err, RillError::Compile(e) if e.code == "RILL_E_PAREN"));
    }
}
