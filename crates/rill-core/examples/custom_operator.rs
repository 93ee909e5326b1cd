//! Register a custom operator and use it from a rule.
//!
//! Usage: cargo run -p rill-core --example custom_operator

use rill_core::{Context, Engine, EvalError, EvalResult, MapSelector, OpEntry, Value};
use std::collections::HashMap;
use std::process;

/// `(clamp n lo hi)` — n forced into [lo, hi].
fn op_clamp(args: &[Value], _ctx: &Context) -> EvalResult {
    let int = |i: usize| -> Result<i64, EvalError> {
        args.get(i)
            .and_then(Value::as_int)
            .ok_or_else(|| EvalError::new("RILL_E_TYPE", "clamp expects three ints"))
    };
    let (n, lo, hi) = (int(0)?, int(1)?, int(2)?);
    Ok(Value::Int(n.clamp(lo, hi)))
}

fn main() {
    let mut engine = Engine::new();
    engine.register_selector("score");
    engine.register_operator(
        "clamp",
        OpEntry {
            pure: true,
            ..OpEntry::new(op_clamp)
        },
    );

    let program = engine
        .compile("(clamp (* score 2) 0 100)")
        .unwrap_or_else(|e| {
            eprintln!("compile: {}", e);
            process::exit(1);
        });

    for score in [10i64, 80] {
        let mut vars = HashMap::new();
        vars.insert("score".to_string(), Value::Int(score));
        let selector = MapSelector::new(&engine, vars);
        let out = program
            .eval(&Context::new(&selector))
            .unwrap_or_else(|e| {
                eprintln!("eval: {}", e);
                process::exit(1);
            });
        println!("score {} -> {}", score, out);
    }
}
