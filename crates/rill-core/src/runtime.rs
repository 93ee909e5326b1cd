//! Runtime contracts consumed by compiled programs.
//!
//! This module defines:
//! - the evaluation error type ([`EvalError`])
//! - selector resolution ([`SelectorKey`], [`Selector`], [`MapSelector`])
//! - cooperative cancellation ([`CancelHandle`])
//! - the per-evaluation environment ([`Context`])
//! - the operator table ([`Operators`]) and its builtin entries
//!
//! Operators are plain function pointers paired with the metadata the
//! compiler needs (commutativity, purity, cost, short-circuit marks).
//! The registry is instance-local: different engines can carry
//! different operator sets safely.

use crate::engine::Engine;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Standard evaluator return type.
pub type EvalResult = Result<Value, EvalError>;

/// Structured runtime evaluation error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalError {
    pub code: String,
    pub message: String,
}

impl EvalError {
    /// Create a new evaluation error with an explicit code.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub(crate) fn cancelled() -> Self {
        Self::new("RILL_E_CANCELLED", "evaluation cancelled")
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new("RILL_E_INTERNAL", message)
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for EvalError {}

/// Compile-time handle for a named variable, assigned densely by the
/// engine. [`SelectorKey::UNDEFINED`] marks names that were not
/// pre-registered and resolve lazily by their string hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectorKey(pub i16);

impl SelectorKey {
    pub const UNDEFINED: SelectorKey = SelectorKey(-1);

    #[inline]
    pub fn is_undefined(self) -> bool {
        self.0 < 0
    }
}

/// The variable environment backend. Implementations may block or
/// perform I/O; the evaluator calls them one at a time.
pub trait Selector {
    /// Resolve a variable. The `hint` is the source name and is only
    /// meaningful for [`SelectorKey::UNDEFINED`].
    fn get(&self, key: SelectorKey, hint: &str) -> EvalResult;
}

/// Selector backend over a plain name → value map.
///
/// Keyed lookups are resolved to dense slots at construction through
/// the engine's selector registry; unregistered names stay reachable
/// by hint.
#[derive(Debug, Clone, Default)]
pub struct MapSelector {
    by_key: Vec<Option<Value>>,
    by_name: HashMap<String, Value>,
}

impl MapSelector {
    pub fn new(engine: &Engine, vars: HashMap<String, Value>) -> Self {
        let mut by_key = vec![None; engine.selector_count()];
        let mut by_name = HashMap::with_capacity(vars.len());
        for (name, value) in vars {
            if let Some(key) = engine.selector_key(&name) {
                by_key[key.0 as usize] = Some(value.clone());
            }
            by_name.insert(name, value);
        }
        Self { by_key, by_name }
    }
}

impl Selector for MapSelector {
    fn get(&self, key: SelectorKey, hint: &str) -> EvalResult {
        if !key.is_undefined() {
            if let Some(Some(value)) = self.by_key.get(key.0 as usize) {
                return Ok(value.clone());
            }
        }
        self.by_name
            .get(hint)
            .cloned()
            .ok_or_else(|| EvalError::new("RILL_E_SELECTOR", format!("no value for [{hint}]")))
    }
}

/// Selector backend used while folding constants at compile time;
/// constant subtrees never look anything up.
pub(crate) struct NoSelectors;

impl Selector for NoSelectors {
    fn get(&self, _key: SelectorKey, hint: &str) -> EvalResult {
        Err(EvalError::new(
            "RILL_E_SELECTOR",
            format!("no selectors available at compile time: [{hint}]"),
        ))
    }
}

/// Cloneable cancellation flag carried by a [`Context`]. Cancel from
/// another thread (or a timer) to stop an in-flight evaluation at its
/// next selector lookup or operator call.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Per-evaluation environment: selector backend + cancellation.
/// Contexts are cheap and never outlive a single evaluation.
pub struct Context<'a> {
    pub selector: &'a dyn Selector,
    pub cancel: CancelHandle,
}

impl<'a> Context<'a> {
    pub fn new(selector: &'a dyn Selector) -> Self {
        Self {
            selector,
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve a variable, honoring cancellation first.
    pub fn get(&self, key: SelectorKey, hint: &str) -> EvalResult {
        self.ensure_live()?;
        self.selector.get(key, hint)
    }

    #[inline]
    pub(crate) fn ensure_live(&self) -> Result<(), EvalError> {
        if self.cancel.is_cancelled() {
            return Err(EvalError::cancelled());
        }
        Ok(())
    }
}

/// Operator function signature used by the registry.
pub type OperatorFn = fn(args: &[Value], ctx: &Context) -> EvalResult;

/// An operator function plus the metadata the compiler consumes.
#[derive(Debug, Clone, Copy)]
pub struct OpEntry {
    pub func: OperatorFn,
    /// Children may be reordered by cost under the reordering pass.
    pub commutative: bool,
    /// Safe to evaluate at compile time over constant children.
    pub pure: bool,
    /// Declared cost added to child costs by the reordering pass.
    pub cost: u32,
    /// A false result determines the enclosing expression.
    pub short_on_false: bool,
    /// A true result determines the enclosing expression.
    pub short_on_true: bool,
}

impl OpEntry {
    /// Entry with conservative defaults: impure, cost 1, no marks.
    pub fn new(func: OperatorFn) -> Self {
        Self {
            func,
            commutative: false,
            pure: false,
            cost: 1,
            short_on_false: false,
            short_on_true: false,
        }
    }
}

/// Canonical operator registry.
///
/// Use [`Operators::register`] to add or replace entries before
/// compiling.
#[derive(Debug, Clone)]
pub struct Operators {
    ops: HashMap<String, OpEntry>,
}

impl Operators {
    /// Build the registry with the builtin operator set preloaded.
    pub fn new() -> Self {
        fn pure(func: OperatorFn) -> OpEntry {
            OpEntry {
                pure: true,
                ..OpEntry::new(func)
            }
        }

        let mut ops: HashMap<String, OpEntry> = HashMap::new();
        ops.insert(
            "and".into(),
            OpEntry {
                commutative: true,
                short_on_false: true,
                ..pure(op_and)
            },
        );
        ops.insert(
            "or".into(),
            OpEntry {
                commutative: true,
                short_on_true: true,
                ..pure(op_or)
            },
        );
        ops.insert("not".into(), pure(op_not));
        ops.insert(
            "=".into(),
            OpEntry {
                commutative: true,
                ..pure(op_eq)
            },
        );
        ops.insert(
            "!=".into(),
            OpEntry {
                commutative: true,
                ..pure(op_ne)
            },
        );
        ops.insert("<".into(), pure(op_lt));
        ops.insert("<=".into(), pure(op_le));
        ops.insert(">".into(), pure(op_gt));
        ops.insert(">=".into(), pure(op_ge));
        ops.insert(
            "+".into(),
            OpEntry {
                commutative: true,
                ..pure(op_add)
            },
        );
        ops.insert("-".into(), pure(op_sub));
        ops.insert(
            "*".into(),
            OpEntry {
                commutative: true,
                ..pure(op_mul)
            },
        );
        ops.insert("/".into(), pure(op_div));
        ops.insert("mod".into(), pure(op_mod));
        ops.insert(
            "in".into(),
            OpEntry {
                cost: 2,
                ..pure(op_in)
            },
        );
        ops.insert(
            "overlap".into(),
            OpEntry {
                commutative: true,
                cost: 2,
                ..pure(op_overlap)
            },
        );
        Self { ops }
    }

    /// Lookup an operator entry by name.
    pub fn get(&self, name: &str) -> Option<&OpEntry> {
        self.ops.get(name)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    /// Register or replace an operator. Returns the previous entry if
    /// present.
    pub fn register(&mut self, name: impl Into<String>, entry: OpEntry) -> Option<OpEntry> {
        self.ops.insert(name.into(), entry)
    }
}

impl Default for Operators {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifiers resolved to constants before the caller's registries are
/// consulted.
pub(crate) fn builtin_constant(name: &str) -> Option<Value> {
    match name {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        _ => None,
    }
}

// ─── synthetic conditional operators ─────────────────────────────────────────

/// Branch head: inverts the condition so that a true result means
/// "take the else arm". A non-boolean condition is a type error.
pub(crate) fn op_branch_head(args: &[Value], _ctx: &Context) -> EvalResult {
    match require_arg(args, 0, "if")? {
        Value::Bool(b) => Ok(Value::Bool(!b)),
        other => Err(EvalError::new(
            "RILL_E_TYPE",
            format!("if condition must be bool, got {}", other.type_name()),
        )),
    }
}

/// Join marker at the end of a then arm; always branches.
pub(crate) fn op_branch_join(_args: &[Value], _ctx: &Context) -> EvalResult {
    Ok(Value::Bool(true))
}

// ─── builtin operators ───────────────────────────────────────────────────────

fn require_arg<'a>(args: &'a [Value], index: usize, op: &str) -> Result<&'a Value, EvalError> {
    args.get(index)
        .ok_or_else(|| EvalError::new("RILL_E_OP", format!("{op} requires argument {index}")))
}

fn require_bool(op: &str, v: &Value) -> Result<bool, EvalError> {
    v.as_bool().ok_or_else(|| type_err(op, "bool", v))
}

fn require_int(op: &str, v: &Value) -> Result<i64, EvalError> {
    v.as_int().ok_or_else(|| type_err(op, "int", v))
}

fn type_err(op: &str, want: &str, got: &Value) -> EvalError {
    EvalError::new(
        "RILL_E_TYPE",
        format!("{op} expects {want}, got {} [{got}]", got.type_name()),
    )
}

fn op_and(args: &[Value], _ctx: &Context) -> EvalResult {
    require_arg(args, 0, "and")?;
    let mut res = true;
    for v in args {
        res = res && require_bool("and", v)?;
    }
    Ok(Value::Bool(res))
}

fn op_or(args: &[Value], _ctx: &Context) -> EvalResult {
    require_arg(args, 0, "or")?;
    let mut res = false;
    for v in args {
        res = res || require_bool("or", v)?;
    }
    Ok(Value::Bool(res))
}

fn op_not(args: &[Value], _ctx: &Context) -> EvalResult {
    if args.len() != 1 {
        return Err(EvalError::new("RILL_E_OP", "not takes exactly one argument"));
    }
    Ok(Value::Bool(!require_bool("not", &args[0])?))
}

fn values_equal(op: &str, lhs: &Value, rhs: &Value) -> Result<bool, EvalError> {
    match (lhs, rhs) {
        (Value::Int(_), Value::Int(_))
        | (Value::Str(_), Value::Str(_))
        | (Value::Bool(_), Value::Bool(_))
        | (Value::IntList(_), Value::IntList(_))
        | (Value::StrList(_), Value::StrList(_))
        | (Value::Absent, Value::Absent) => Ok(lhs == rhs),
        _ => Err(EvalError::new(
            "RILL_E_TYPE",
            format!(
                "{op} cannot compare {} with {}",
                lhs.type_name(),
                rhs.type_name()
            ),
        )),
    }
}

fn op_eq(args: &[Value], _ctx: &Context) -> EvalResult {
    let lhs = require_arg(args, 0, "=")?;
    let rhs = require_arg(args, 1, "=")?;
    Ok(Value::Bool(values_equal("=", lhs, rhs)?))
}

fn op_ne(args: &[Value], _ctx: &Context) -> EvalResult {
    let lhs = require_arg(args, 0, "!=")?;
    let rhs = require_arg(args, 1, "!=")?;
    Ok(Value::Bool(!values_equal("!=", lhs, rhs)?))
}

fn int_pair(op: &str, args: &[Value]) -> Result<(i64, i64), EvalError> {
    let lhs = require_int(op, require_arg(args, 0, op)?)?;
    let rhs = require_int(op, require_arg(args, 1, op)?)?;
    Ok((lhs, rhs))
}

fn op_lt(args: &[Value], _ctx: &Context) -> EvalResult {
    let (lhs, rhs) = int_pair("<", args)?;
    Ok(Value::Bool(lhs < rhs))
}

fn op_le(args: &[Value], _ctx: &Context) -> EvalResult {
    let (lhs, rhs) = int_pair("<=", args)?;
    Ok(Value::Bool(lhs <= rhs))
}

fn op_gt(args: &[Value], _ctx: &Context) -> EvalResult {
    let (lhs, rhs) = int_pair(">", args)?;
    Ok(Value::Bool(lhs > rhs))
}

fn op_ge(args: &[Value], _ctx: &Context) -> EvalResult {
    let (lhs, rhs) = int_pair(">=", args)?;
    Ok(Value::Bool(lhs >= rhs))
}

fn op_add(args: &[Value], _ctx: &Context) -> EvalResult {
    require_arg(args, 0, "+")?;
    let mut total = 0i64;
    for v in args {
        total = total.wrapping_add(require_int("+", v)?);
    }
    Ok(Value::Int(total))
}

fn op_sub(args: &[Value], _ctx: &Context) -> EvalResult {
    let (lhs, rhs) = int_pair("-", args)?;
    Ok(Value::Int(lhs.wrapping_sub(rhs)))
}

fn op_mul(args: &[Value], _ctx: &Context) -> EvalResult {
    require_arg(args, 0, "*")?;
    let mut total = 1i64;
    for v in args {
        total = total.wrapping_mul(require_int("*", v)?);
    }
    Ok(Value::Int(total))
}

fn op_div(args: &[Value], _ctx: &Context) -> EvalResult {
    let (lhs, rhs) = int_pair("/", args)?;
    if rhs == 0 {
        return Err(EvalError::new("RILL_E_OP", "division by zero"));
    }
    Ok(Value::Int(lhs.wrapping_div(rhs)))
}

fn op_mod(args: &[Value], _ctx: &Context) -> EvalResult {
    let (lhs, rhs) = int_pair("mod", args)?;
    if rhs == 0 {
        return Err(EvalError::new("RILL_E_OP", "modulo by zero"));
    }
    Ok(Value::Int(lhs.wrapping_rem(rhs)))
}

fn op_in(args: &[Value], _ctx: &Context) -> EvalResult {
    let needle = require_arg(args, 0, "in")?;
    let haystack = require_arg(args, 1, "in")?;
    match (needle, haystack) {
        (Value::Int(n), Value::IntList(items)) => Ok(Value::Bool(items.contains(n))),
        (Value::Str(s), Value::StrList(items)) => {
            Ok(Value::Bool(items.iter().any(|item| item == s.as_ref())))
        }
        _ => Err(EvalError::new(
            "RILL_E_TYPE",
            format!(
                "in expects (int, int-list) or (string, string-list), got ({}, {})",
                needle.type_name(),
                haystack.type_name()
            ),
        )),
    }
}

fn op_overlap(args: &[Value], _ctx: &Context) -> EvalResult {
    let lhs = require_arg(args, 0, "overlap")?;
    let rhs = require_arg(args, 1, "overlap")?;
    match (lhs, rhs) {
        (Value::IntList(a), Value::IntList(b)) => {
            Ok(Value::Bool(a.iter().any(|n| b.contains(n))))
        }
        (Value::StrList(a), Value::StrList(b)) => {
            Ok(Value::Bool(a.iter().any(|s| b.contains(s))))
        }
        _ => Err(EvalError::new(
            "RILL_E_TYPE",
            format!(
                "overlap expects two lists of the same kind, got ({}, {})",
                lhs.type_name(),
                rhs.type_name()
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_value(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn call(name: &str, args: &[Value]) -> EvalResult {
        let ops = Operators::new();
        let entry = ops.get(name).expect("builtin registered");
        let sel = NoSelectors;
        let ctx = Context::new(&sel);
        (entry.func)(args, &ctx)
    }

    #[test]
    fn logic_operators() {
        assert_eq!(
            call("and", &[Value::Bool(true), Value::Bool(false)]),
            Ok(Value::Bool(false))
        );
        assert_eq!(
            call("or", &[Value::Bool(false), Value::Bool(true)]),
            Ok(Value::Bool(true))
        );
        assert_eq!(call("not", &[Value::Bool(false)]), Ok(Value::Bool(true)));
        let err = call("and", &[Value::Int(1)]).expect_err("type error");
        assert_eq!(err.code, "RILL_E_TYPE");
    }

    #[test]
    fn arithmetic_wraps_and_guards_zero() {
        assert_eq!(
            call("+", &[Value::Int(1), Value::Int(2), Value::Int(3)]),
            Ok(Value::Int(6))
        );
        assert_eq!(
            call("+", &[Value::Int(i64::MAX), Value::Int(1)]),
            Ok(Value::Int(i64::MIN))
        );
        assert_eq!(call("-", &[Value::Int(5), Value::Int(7)]), Ok(Value::Int(-2)));
        assert_eq!(
            call("mod", &[Value::Int(7), Value::Int(3)]),
            Ok(Value::Int(1))
        );
        let err = call("/", &[Value::Int(1), Value::Int(0)]).expect_err("div zero");
        assert_eq!(err.code, "RILL_E_OP");
    }

    #[test]
    fn equality_is_same_variant_only() {
        assert_eq!(
            call("=", &[Value::from("US"), Value::from("US")]),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            call("!=", &[Value::Int(1), Value::Int(2)]),
            Ok(Value::Bool(true))
        );
        let err = call("=", &[Value::Int(1), Value::from("1")]).expect_err("mismatch");
        assert_eq!(err.code, "RILL_E_TYPE");
    }

    #[test]
    fn membership_operators() {
        assert_eq!(
            call("in", &[Value::from("SF"), Value::from(vec!["NYC".to_string(), "SF".to_string()])]),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            call("in", &[Value::Int(4), Value::from(vec![1, 2, 3])]),
            Ok(Value::Bool(false))
        );
        assert_eq!(
            call(
                "overlap",
                &[Value::from(vec![1, 2]), Value::from(vec![2, 9])]
            ),
            Ok(Value::Bool(true))
        );
        let err = call("overlap", &[Value::from(vec![1]), Value::from(vec!["a".to_string()])])
            .expect_err("mixed lists");
        assert_eq!(err.code, "RILL_E_TYPE");
    }

    #[test]
    fn registry_register_replaces() {
        fn op_zero(_args: &[Value], _ctx: &Context) -> EvalResult {
            Ok(Value::Int(0))
        }
        let mut ops = Operators::new();
        assert!(ops.contains("+"));
        assert!(ops.register("zero", OpEntry::new(op_zero)).is_none());
        assert!(ops.register("zero", OpEntry::new(op_zero)).is_some());
    }

    #[test]
    fn cancel_handle_stops_context() {
        let sel = NoSelectors;
        let cancel = CancelHandle::new();
        let ctx = Context::new(&sel).with_cancel(cancel.clone());
        assert!(ctx.ensure_live().is_ok());
        cancel.cancel();
        let err = ctx.ensure_live().expect_err("cancelled");
        assert_eq!(err.code, "RILL_E_CANCELLED");
    }

    #[test]
    fn map_selector_resolves_by_key_and_hint() {
        let mut engine = Engine::new();
        let key = engine.register_selector("age");
        let vars = ctx_value(&[("age", Value::Int(30)), ("extra", Value::from("x"))]);
        let sel = MapSelector::new(&engine, vars);
        assert_eq!(sel.get(key, "age"), Ok(Value::Int(30)));
        assert_eq!(
            sel.get(SelectorKey::UNDEFINED, "extra"),
            Ok(Value::from("x"))
        );
        let err = sel
            .get(SelectorKey::UNDEFINED, "missing")
            .expect_err("missing");
        assert_eq!(err.code, "RILL_E_SELECTOR");
    }
}
