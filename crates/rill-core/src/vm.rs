//! The linear evaluator.
//!
//! This is the hot loop: a program counter over the flat node array
//! and a preallocated operand stack. Dispatch is two-level — first on
//! the node kind, then on the boolean short-circuit flags of whatever
//! the step produced. Short-circuit jumps restore the stack top in
//! O(1) from the target's precomputed entry depth; conditional branch
//! nodes transfer control without touching the stack at all.

use crate::program::{Node, NodeKind, Program, SC_IF_FALSE, SC_IF_TRUE};
use crate::runtime::{Context, EvalError, EvalResult, OperatorFn};
use crate::value::Value;
use smallvec::{smallvec, SmallVec};
use std::mem;

impl Program {
    /// Execute against a context. The context is per-evaluation; the
    /// program itself may be shared freely across threads.
    pub fn eval(&self, ctx: &Context) -> EvalResult {
        let nodes = &self.nodes;
        let len = nodes.len();
        // Inline buffer covers the common small programs; larger
        // stacks spill to one heap allocation sized at compile time.
        let mut os: SmallVec<[Value; 16]> =
            smallvec![Value::Absent; self.max_stack_size as usize];
        let mut os_top: i32 = -1;
        let mut i = 0usize;

        while i < len {
            let node = &nodes[i];
            let res = match node.kind {
                NodeKind::Constant => node.value.clone(),
                NodeKind::Selector => ctx.get(node.sel_key, node.hint())?,
                NodeKind::Operator => {
                    ctx.ensure_live()?;
                    let op = operator_of(node)?;
                    os_top -= i32::from(node.child_count);
                    let base = stack_base(os_top)?;
                    if node.child_count == 2 {
                        let pair = [
                            mem::take(&mut os[base]),
                            mem::take(&mut os[base + 1]),
                        ];
                        op(&pair, ctx)?
                    } else {
                        let params: Vec<Value> = os
                            [base..base + node.child_count as usize]
                            .iter_mut()
                            .map(mem::take)
                            .collect();
                        op(&params, ctx)?
                    }
                }
                NodeKind::FastOperator => {
                    ctx.ensure_live()?;
                    let op = operator_of(node)?;
                    if i + 2 >= len {
                        return Err(EvalError::internal("truncated fast-operator sequence"));
                    }
                    let lhs = inline_operand(ctx, &nodes[i + 1])?;
                    let rhs = inline_operand(ctx, &nodes[i + 2])?;
                    i += 2;
                    op(&[lhs, rhs], ctx)?
                }
                NodeKind::CondBranch => {
                    ctx.ensure_live()?;
                    let op = operator_of(node)?;
                    let res = if node.child_count == 1 {
                        os_top -= 1;
                        let base = stack_base(os_top)?;
                        let cond = mem::take(&mut os[base]);
                        op(&[cond], ctx)?
                    } else {
                        op(&[], ctx)?
                    };
                    let Some(b) = res.as_bool() else {
                        return Err(EvalError::internal("branch produced a non-boolean"));
                    };
                    // Pure control transfer: branch results never
                    // reach the operand stack.
                    if sc_match(node.flags, b) {
                        i = node.sc_target as usize;
                    } else {
                        i += 1;
                    }
                    continue;
                }
            };

            if let Some(b) = res.as_bool() {
                let mut curt = node;
                while sc_match(curt.flags, b) {
                    let target = curt.sc_target;
                    if target < 0 {
                        return Ok(res);
                    }
                    // Land on the determined ancestor: restore its
                    // subtree-entry depth, push the result in its
                    // place, and let its own flags chain further.
                    i = target as usize;
                    curt = &nodes[i];
                    os_top = i32::from(curt.os_top);
                }
            }

            os_top += 1;
            os[os_top as usize] = res;
            i += 1;
        }

        if os_top != 0 {
            return Err(EvalError::internal(
                "operand stack unbalanced at termination",
            ));
        }
        Ok(mem::take(&mut os[0]))
    }

    /// Execute and coerce to a boolean decision.
    pub fn eval_bool(&self, ctx: &Context) -> Result<bool, EvalError> {
        match self.eval(ctx)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::new(
                "RILL_E_RESULT",
                format!("expected a boolean result, got {} [{other}]", other.type_name()),
            )),
        }
    }
}

// ─── helpers ─────────────────────────────────────────────────────────────────

#[inline]
fn sc_match(flags: u8, b: bool) -> bool {
    (!b && flags & SC_IF_FALSE != 0) || (b && flags & SC_IF_TRUE != 0)
}

#[inline]
fn operator_of(node: &Node) -> Result<OperatorFn, EvalError> {
    node.operator
        .ok_or_else(|| EvalError::internal("operator node without a function"))
}

#[inline]
fn stack_base(os_top: i32) -> Result<usize, EvalError> {
    if os_top < -1 {
        return Err(EvalError::internal("operand stack underflow"));
    }
    Ok((os_top + 1) as usize)
}

/// Inline fast-operator operand: selectors resolve through the
/// context, everything else is its stored value.
#[inline]
fn inline_operand(ctx: &Context, node: &Node) -> EvalResult {
    match node.kind {
        NodeKind::Selector => ctx.get(node.sel_key, node.hint()),
        _ => Ok(node.value.clone()),
    }
}
