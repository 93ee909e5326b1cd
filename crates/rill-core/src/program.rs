//! The compiled, linear program form and its compile-time error type.
//!
//! A [`Program`] is a flat node array in evaluation order plus the
//! precomputed maximum operand-stack size. It is immutable after
//! compilation and safe to share across any number of concurrent
//! evaluations.

use crate::runtime::{OperatorFn, SelectorKey};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node kinds of the linear form. `FastOperator` heads a three-slot
/// fused sequence whose two trailing slots are read inline by the
/// evaluator; `CondBranch` nodes transfer control without producing a
/// stack value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Constant,
    Selector,
    Operator,
    FastOperator,
    CondBranch,
}

impl NodeKind {
    fn tag(self) -> &'static str {
        match self {
            NodeKind::Constant => "const",
            NodeKind::Selector => "selector",
            NodeKind::Operator => "op",
            NodeKind::FastOperator => "fastop",
            NodeKind::CondBranch => "branch",
        }
    }
}

/// Short-circuit when the node's boolean result is false.
pub(crate) const SC_IF_FALSE: u8 = 0b01;
/// Short-circuit when the node's boolean result is true.
pub(crate) const SC_IF_TRUE: u8 = 0b10;

/// One slot of the linear program.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) flags: u8,
    /// Operand slots consumed from the value stack (inline fast
    /// operands are counted here but never touch the stack).
    pub(crate) child_count: u8,
    /// Jump target when a short-circuit is taken; -1 terminates the
    /// evaluation with the current value. Join markers may point one
    /// past the last node.
    pub(crate) sc_target: i16,
    /// Operand-stack top index at entry to this node's subtree; the
    /// depth restored when a short-circuit jump lands here.
    pub(crate) os_top: i16,
    pub(crate) sel_key: SelectorKey,
    /// Constant: the literal. Selector: the name hint. Operator kinds:
    /// the display name.
    pub(crate) value: Value,
    pub(crate) operator: Option<OperatorFn>,
}

impl Node {
    /// Name hint for selector resolution; empty for non-selector nodes.
    #[inline]
    pub(crate) fn hint(&self) -> &str {
        self.value.as_str().unwrap_or_default()
    }
}

/// Compile options, settable on the engine and overridable per source
/// through a `;;;;` directive header (except `allow_unknown_selectors`,
/// which is engine-only).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    pub constant_folding: bool,
    pub reordering: bool,
    pub fast_evaluation: bool,
    pub allow_unknown_selectors: bool,
}

impl CompileOptions {
    /// All optimization passes on (the `optimize` directive shorthand).
    pub fn optimized() -> Self {
        Self {
            constant_folding: true,
            reordering: true,
            fast_evaluation: true,
            allow_unknown_selectors: false,
        }
    }

    pub(crate) fn set_all_optimizations(&mut self, enabled: bool) {
        self.constant_folding = enabled;
        self.reordering = enabled;
        self.fast_evaluation = enabled;
    }
}

/// A compiled expression: the linear node array in evaluation order
/// plus its precomputed stack bound. Produced once by
/// [`Engine::compile`](crate::Engine::compile), evaluated many times.
#[derive(Debug, Clone)]
pub struct Program {
    pub(crate) nodes: Vec<Node>,
    pub(crate) max_stack_size: i16,
    pub(crate) options: CompileOptions,
}

impl Program {
    /// Number of linear slots (including inline fast operands).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Upper bound of the operand stack during any evaluation.
    pub fn max_stack_size(&self) -> usize {
        self.max_stack_size as usize
    }

    /// The options the program was compiled under, after directive
    /// overrides.
    pub fn options(&self) -> CompileOptions {
        self.options
    }
}

/// Development dump: one row per slot. No semantic contract.
impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>4}  {:<8}  {:<22}  {:>2}  {:>2}  {:>6}  {:>5}",
            "idx", "kind", "value", "cc", "sc", "target", "ostop"
        )?;
        for (i, node) in self.nodes.iter().enumerate() {
            let sc = match node.flags & (SC_IF_FALSE | SC_IF_TRUE) {
                0 => "-",
                SC_IF_FALSE => "F",
                SC_IF_TRUE => "T",
                _ => "FT",
            };
            writeln!(
                f,
                "{:>4}  {:<8}  {:<22}  {:>2}  {:>2}  {:>6}  {:>5}",
                i,
                node.kind.tag(),
                node.value.to_string(),
                node.child_count,
                sc,
                node.sc_target,
                node.os_top
            )?;
        }
        write!(f, "max stack size: {}", self.max_stack_size)
    }
}

/// Structured compile-time error (lex, parse, config, or internal
/// layout violation). Positional errors carry a bracketed source
/// window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileError {
    pub code: String,
    pub message: String,
    pub pos: Option<usize>,
    pub context: Option<String>,
}

impl CompileError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            pos: None,
            context: None,
        }
    }

    /// Attach a character offset and its rendered source window.
    pub(crate) fn at(mut self, source: &[char], pos: usize) -> Self {
        self.pos = Some(pos);
        self.context = Some(context_window(source, pos));
        self
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new("RILL_E_INTERNAL", message)
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(context) = &self.context {
            write!(f, " at{context}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Up to 30 characters on either side of `pos`, offender bracketed.
fn context_window(source: &[char], pos: usize) -> String {
    const WIDTH: usize = 30;
    if pos >= source.len() {
        return " [end of input]".to_string();
    }
    let left = if pos > WIDTH {
        let s: String = source[pos - WIDTH..pos].iter().collect();
        format!("...{s}")
    } else {
        source[..pos].iter().collect()
    };
    let right = if pos + WIDTH < source.len() {
        let s: String = source[pos + 1..pos + WIDTH].iter().collect();
        format!("{s}...")
    } else {
        source[pos + 1..].iter().collect()
    };
    format!(" {left}[{}]{right}", source[pos])
}
