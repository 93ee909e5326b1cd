//! Compile a rule file and evaluate it: read → compile → eval.
//!
//! Usage: cargo run -p rill-core --example run_rules -- rule.rill '{"age": 25}'

use rill_core::{eval, Value};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::process;

fn main() {
    let path = match env::args().nth(1) {
        Some(p) => p,
        None => {
            eprintln!("Usage: run_rules <path.rill> [vars-json]");
            eprintln!("  e.g. cargo run -p rill-core --example run_rules -- rule.rill '{{\"age\": 25}}'");
            process::exit(1);
        }
    };
    let source = fs::read_to_string(&path).unwrap_or_else(|e| {
        eprintln!("read {}: {}", path, e);
        process::exit(1);
    });

    let mut vars: HashMap<String, Value> = HashMap::new();
    if let Some(payload) = env::args().nth(2) {
        let doc: serde_json::Value = serde_json::from_str(&payload).unwrap_or_else(|e| {
            eprintln!("parse vars: {}", e);
            process::exit(1);
        });
        let Some(object) = doc.as_object() else {
            eprintln!("vars must be a JSON object");
            process::exit(1);
        };
        for (name, value) in object {
            let value = Value::try_from(value).unwrap_or_else(|e| {
                eprintln!("var {}: {}", name, e);
                process::exit(1);
            });
            vars.insert(name.clone(), value);
        }
    }

    let out = eval(&source, &vars).unwrap_or_else(|e| {
        eprintln!("eval {}: {}", path, e);
        process::exit(1);
    });
    println!("{}", out);
}
