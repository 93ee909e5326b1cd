//! Thin command line embedding of rill-core.
//!
//! Commands:
//! - `rill run FILE [--vars JSON_OR_PATH] [--bool]` — compile and
//!   evaluate a rule against a variable map
//! - `rill check FILE [--dump]` — compile only; `--dump` prints the
//!   linear program table

use rill_core::{eval, eval_bool, Engine, Value};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone)]
enum CliCommand {
    Run {
        file: PathBuf,
        vars: Option<String>,
        as_bool: bool,
    },
    Check {
        file: PathBuf,
        dump: bool,
    },
}

pub fn run_from_env() -> Result<(), String> {
    run_from_args(env::args().skip(1).collect())
}

pub fn run_from_args(args: Vec<String>) -> Result<(), String> {
    match parse_command(args)? {
        CliCommand::Run {
            file,
            vars,
            as_bool,
        } => run_rule(file, vars, as_bool),
        CliCommand::Check { file, dump } => check_rule(file, dump),
    }
}

fn parse_command(args: Vec<String>) -> Result<CliCommand, String> {
    if args.is_empty() {
        return Err(help_text());
    }

    let cmd = args[0].as_str();
    match cmd {
        "run" => parse_run(args),
        "check" => parse_check(args),
        "help" | "--help" | "-h" => Err(help_text()),
        _ => Err(format!("unknown command: {cmd}\n\n{}", help_text())),
    }
}

fn parse_run(args: Vec<String>) -> Result<CliCommand, String> {
    let mut file: Option<PathBuf> = None;
    let mut vars: Option<String> = None;
    let mut as_bool = false;

    let mut i = 1usize;
    while i < args.len() {
        let token = &args[i];
        match token.as_str() {
            "--vars" => {
                i += 1;
                vars = Some(
                    args.get(i)
                        .ok_or_else(|| "--vars requires a value".to_string())?
                        .to_string(),
                );
            }
            "--bool" => as_bool = true,
            x if x.starts_with("--") => return Err(format!("unknown flag: {x}")),
            _ => {
                if file.is_some() {
                    return Err("only one FILE positional argument is allowed".to_string());
                }
                file = Some(PathBuf::from(token));
            }
        }
        i += 1;
    }

    let file = file.ok_or_else(|| "run requires FILE".to_string())?;
    Ok(CliCommand::Run {
        file,
        vars,
        as_bool,
    })
}

fn parse_check(args: Vec<String>) -> Result<CliCommand, String> {
    let mut file: Option<PathBuf> = None;
    let mut dump = false;

    let mut i = 1usize;
    while i < args.len() {
        let token = &args[i];
        match token.as_str() {
            "--dump" => dump = true,
            x if x.starts_with("--") => return Err(format!("unknown flag: {x}")),
            _ => {
                if file.is_some() {
                    return Err("only one FILE positional argument is allowed".to_string());
                }
                file = Some(PathBuf::from(token));
            }
        }
        i += 1;
    }

    let file = file.ok_or_else(|| "check requires FILE".to_string())?;
    Ok(CliCommand::Check { file, dump })
}

fn help_text() -> String {
    [
        "rill CLI",
        "",
        "Commands:",
        "  rill run FILE [--vars JSON_OR_PATH] [--bool]",
        "  rill check FILE [--dump]",
    ]
    .join("\n")
}

fn run_rule(file: PathBuf, vars: Option<String>, as_bool: bool) -> Result<(), String> {
    let source =
        fs::read_to_string(&file).map_err(|e| format!("failed to read {}: {e}", file.display()))?;
    let vars = load_vars(vars)?;

    if as_bool {
        let out = eval_bool(&source, &vars).map_err(|e| e.to_string())?;
        println!("{out}");
        return Ok(());
    }
    let out = eval(&source, &vars).map_err(|e| e.to_string())?;
    let json: serde_json::Value = out.into();
    println!(
        "{}",
        serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
    );
    Ok(())
}

fn check_rule(file: PathBuf, dump: bool) -> Result<(), String> {
    let source =
        fs::read_to_string(&file).map_err(|e| format!("failed to read {}: {e}", file.display()))?;

    // Checking happens without a variable map, so names resolve lazily.
    let mut engine = Engine::new();
    engine.options_mut().allow_unknown_selectors = true;
    let program = engine.compile(&source).map_err(|e| e.to_string())?;

    if dump {
        println!("{program}");
    } else {
        println!(
            "ok: {} nodes, max stack {}",
            program.len(),
            program.max_stack_size()
        );
    }
    Ok(())
}

/// `--vars` accepts inline JSON or a path to a JSON file; the document
/// must be an object of rule values.
fn load_vars(payload: Option<String>) -> Result<HashMap<String, Value>, String> {
    let Some(payload) = payload else {
        return Ok(HashMap::new());
    };
    let text = if payload.trim_start().starts_with('{') {
        payload
    } else {
        fs::read_to_string(&payload).map_err(|e| format!("failed to read {payload}: {e}"))?
    };
    let doc: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| format!("failed to parse vars: {e}"))?;
    let Some(object) = doc.as_object() else {
        return Err("vars must be a JSON object".to_string());
    };

    let mut vars = HashMap::with_capacity(object.len());
    for (name, value) in object {
        let value = Value::try_from(value).map_err(|e| format!("var {name}: {e}"))?;
        vars.insert(name.clone(), value);
    }
    Ok(vars)
}
