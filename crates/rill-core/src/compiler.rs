//! AST → [`Program`] lowering.
//!
//! Passes, in order:
//!
//! 1. constant folding (optional) — pure operators over constant
//!    children evaluate at compile time; never across a conditional
//! 2. child reordering (optional) — commutative operators evaluate
//!    cheaper, side-effect-free operands first
//! 3. post-order linearization with conditional branch/join wiring
//! 4. fast-operator fusion (optional) — two-leaf operators become a
//!    three-slot inline sequence
//! 5. short-circuit flag and target propagation
//! 6. stack-depth annotation and the final invariant sweep
//!
//! Lowering is the final pass over a program: the three-slot
//! fast-operator layout and every jump target are positional, so no
//! later stage may move slots.

use crate::program::{
    CompileError, CompileOptions, Node, NodeKind, Program, SC_IF_FALSE, SC_IF_TRUE,
};
use crate::reader::AstExpr;
use crate::runtime::{
    op_branch_head, op_branch_join, Context, NoSelectors, OpEntry, OperatorFn, SelectorKey,
};
use crate::value::Value;

pub(crate) fn lower(ast: AstExpr, options: CompileOptions) -> Result<Program, CompileError> {
    let mut ast = ast;
    if options.constant_folding {
        ast = fold(ast);
    }
    if options.reordering {
        reorder(&mut ast);
    }

    let mut emitter = Emitter {
        fast_evaluation: options.fast_evaluation,
        nodes: Vec::new(),
        parents: Vec::new(),
        op_short: Vec::new(),
        max_depth: 0,
    };
    let (_, top) = emitter.emit(&ast, -1)?;
    if top != 0 {
        return Err(CompileError::internal("unbalanced stack after lowering"));
    }
    emitter.wire_short_circuits();
    emitter.finish(options)
}

// ─── constant folding ────────────────────────────────────────────────────────

fn constant_value(ast: &AstExpr) -> Option<&Value> {
    match ast {
        AstExpr::Constant(v) => Some(v),
        _ => None,
    }
}

/// Bottom-up folding of pure operators over constant children. A
/// fold-time operator error leaves the node in place so the failure
/// still surfaces at evaluation time. Conditionals are never folded,
/// though their subtrees fold internally.
fn fold(ast: AstExpr) -> AstExpr {
    match ast {
        AstExpr::Operator {
            name,
            entry,
            children,
        } => {
            let children: Vec<AstExpr> = children.into_iter().map(fold).collect();
            if entry.pure {
                let params: Option<Vec<Value>> =
                    children.iter().map(|c| constant_value(c).cloned()).collect();
                if let Some(params) = params {
                    let sel = NoSelectors;
                    let ctx = Context::new(&sel);
                    if let Ok(value) = (entry.func)(&params, &ctx) {
                        return AstExpr::Constant(value);
                    }
                }
            }
            AstExpr::Operator {
                name,
                entry,
                children,
            }
        }
        AstExpr::Cond { children } => AstExpr::Cond {
            children: children.into_iter().map(fold).collect(),
        },
        leaf => leaf,
    }
}

// ─── child reordering ────────────────────────────────────────────────────────

fn cost(ast: &AstExpr) -> u32 {
    match ast {
        AstExpr::Constant(_) | AstExpr::Selector { .. } => 1,
        AstExpr::Operator { entry, children, .. } => {
            children.iter().map(cost).sum::<u32>() + entry.cost
        }
        AstExpr::Cond { children } => children.iter().map(cost).sum::<u32>() + 1,
    }
}

/// A child may be moved only when evaluating it early cannot be
/// observed: constants, selectors, and trees of pure operators.
/// Conditionals pin their children in place.
fn is_side_effect_free(ast: &AstExpr) -> bool {
    match ast {
        AstExpr::Constant(_) | AstExpr::Selector { .. } => true,
        AstExpr::Operator { entry, children, .. } => {
            entry.pure && children.iter().all(is_side_effect_free)
        }
        AstExpr::Cond { .. } => false,
    }
}

fn reorder(ast: &mut AstExpr) {
    match ast {
        AstExpr::Operator {
            entry, children, ..
        } => {
            for child in children.iter_mut() {
                reorder(child);
            }
            if entry.commutative && children.iter().all(is_side_effect_free) {
                children.sort_by_key(cost);
            }
        }
        AstExpr::Cond { children } => {
            for child in children.iter_mut() {
                reorder(child);
            }
        }
        _ => {}
    }
}

// ─── linearization ───────────────────────────────────────────────────────────

struct Emitter {
    fast_evaluation: bool,
    nodes: Vec<Node>,
    /// Linear index of each node's parent; -1 at the root. Inline fast
    /// operands point at their FastOperator head.
    parents: Vec<i32>,
    /// Short-circuit marks of each node's own operator, for target
    /// chain walking.
    op_short: Vec<(bool, bool)>,
    /// Deepest simulated operand-stack value count.
    max_depth: i32,
}

fn leaf_kind(ast: &AstExpr) -> bool {
    matches!(ast, AstExpr::Constant(_) | AstExpr::Selector { .. })
}

/// Fusion applies to two-leaf operators without short-circuit marks:
/// fusing a short-circuiting operator would resolve both inline
/// operands eagerly.
fn fusible(entry: &OpEntry, children: &[AstExpr]) -> bool {
    children.len() == 2
        && children.iter().all(leaf_kind)
        && !entry.short_on_false
        && !entry.short_on_true
}

impl Emitter {
    fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.parents.push(-1);
        self.op_short.push((false, false));
        self.nodes.len() - 1
    }

    fn record_depth(&mut self, top: i32) {
        if top + 1 > self.max_depth {
            self.max_depth = top + 1;
        }
    }

    fn leaf(ast: &AstExpr, base: i32) -> Result<Node, CompileError> {
        match ast {
            AstExpr::Constant(v) => Ok(Node {
                kind: NodeKind::Constant,
                flags: 0,
                child_count: 0,
                sc_target: -1,
                os_top: base as i16,
                sel_key: SelectorKey::UNDEFINED,
                value: v.clone(),
                operator: None,
            }),
            AstExpr::Selector { name, key } => Ok(Node {
                kind: NodeKind::Selector,
                flags: 0,
                child_count: 0,
                sc_target: -1,
                os_top: base as i16,
                sel_key: *key,
                value: Value::from(name.as_str()),
                operator: None,
            }),
            _ => Err(CompileError::internal("leaf emission on a non-leaf node")),
        }
    }

    /// Emit `ast` in post-order. `base` is the operand-stack top index
    /// at entry to the subtree; returns the subtree's representative
    /// node index and the top index after it completes.
    fn emit(&mut self, ast: &AstExpr, base: i32) -> Result<(usize, i32), CompileError> {
        match ast {
            AstExpr::Constant(_) | AstExpr::Selector { .. } => {
                let node = Self::leaf(ast, base)?;
                let idx = self.push(node);
                self.record_depth(base + 1);
                Ok((idx, base + 1))
            }
            AstExpr::Operator {
                name,
                entry,
                children,
            } => {
                if children.len() > u8::MAX as usize {
                    return Err(CompileError::new(
                        "RILL_E_ARITY",
                        format!("[{name}] has too many arguments"),
                    ));
                }
                if self.fast_evaluation && fusible(entry, children) {
                    let head = self.push(Node {
                        kind: NodeKind::FastOperator,
                        flags: 0,
                        child_count: 2,
                        sc_target: -1,
                        os_top: base as i16,
                        sel_key: SelectorKey::UNDEFINED,
                        value: Value::from(name.as_str()),
                        operator: Some(entry.func),
                    });
                    self.op_short[head] = (entry.short_on_false, entry.short_on_true);
                    for child in children {
                        let node = Self::leaf(child, base)?;
                        let slot = self.push(node);
                        self.parents[slot] = head as i32;
                    }
                    self.record_depth(base + 1);
                    return Ok((head, base + 1));
                }

                let mut top = base;
                let mut roots = Vec::with_capacity(children.len());
                for child in children {
                    let (root, next) = self.emit(child, top)?;
                    roots.push(root);
                    top = next;
                }
                let idx = self.push(Node {
                    kind: NodeKind::Operator,
                    flags: 0,
                    child_count: children.len() as u8,
                    sc_target: -1,
                    os_top: base as i16,
                    sel_key: SelectorKey::UNDEFINED,
                    value: Value::from(name.as_str()),
                    operator: Some(entry.func),
                });
                self.op_short[idx] = (entry.short_on_false, entry.short_on_true);
                for root in roots {
                    self.parents[root] = idx as i32;
                }
                self.record_depth(base + 1);
                Ok((idx, base + 1))
            }
            AstExpr::Cond { children } => self.emit_cond(children, base),
        }
    }

    /// `(if c t e)` emits as `[C…, HEAD, T…, JOIN, E…]`.
    ///
    /// HEAD pops the condition and inverts it; a true result (condition
    /// false) branches to the first node of E. The then arm falls
    /// through into JOIN, which always branches one past the construct.
    /// Branch jumps transfer control only — both arms leave the stack
    /// at the same depth, so nothing is pushed or restored.
    fn emit_cond(&mut self, children: &[AstExpr], base: i32) -> Result<(usize, i32), CompileError> {
        let [cond, then_arm, else_arm] = children else {
            return Err(CompileError::internal("conditional without three children"));
        };

        let (c_root, c_top) = self.emit(cond, base)?;
        if c_top != base + 1 {
            return Err(CompileError::internal("condition arm unbalanced"));
        }
        let head = self.push(Node {
            kind: NodeKind::CondBranch,
            flags: SC_IF_TRUE,
            child_count: 1,
            sc_target: -1,
            os_top: base as i16,
            sel_key: SelectorKey::UNDEFINED,
            value: Value::from("if"),
            operator: Some(op_branch_head as OperatorFn),
        });
        self.parents[c_root] = head as i32;

        let (t_root, t_top) = self.emit(then_arm, base)?;
        self.parents[t_root] = head as i32;
        let join = self.push(Node {
            kind: NodeKind::CondBranch,
            flags: SC_IF_TRUE,
            child_count: 0,
            sc_target: -1,
            os_top: (base + 1) as i16,
            sel_key: SelectorKey::UNDEFINED,
            value: Value::from("fi"),
            operator: Some(op_branch_join as OperatorFn),
        });

        let (e_root, e_top) = self.emit(else_arm, base)?;
        self.parents[e_root] = head as i32;
        if t_top != base + 1 || e_top != base + 1 {
            return Err(CompileError::internal("conditional arms unbalanced"));
        }

        self.nodes[head].sc_target = (join + 1) as i16;
        self.nodes[join].sc_target = self.nodes.len() as i16;
        Ok((head, base + 1))
    }

    // ─── short-circuit propagation ───────────────────────────────────────────

    /// Every child of a short-circuit-marked operator gets the matching
    /// flag. Its target is the farthest ancestor still determined by
    /// the result (false through `and`, true through `or`), collapsed
    /// at compile time; -1 terminates the evaluation when that ancestor
    /// is the program root. Branch nodes and inline fast operands are
    /// wired separately and skipped here.
    fn wire_short_circuits(&mut self) {
        for i in 0..self.nodes.len() {
            if self.nodes[i].kind == NodeKind::CondBranch {
                continue;
            }
            let parent = self.parents[i];
            if parent < 0 {
                continue;
            }
            let parent = parent as usize;
            if self.nodes[parent].kind == NodeKind::FastOperator {
                continue;
            }
            let (on_false, on_true) = self.op_short[parent];
            if !on_false && !on_true {
                continue;
            }

            let mut target = parent;
            loop {
                let up = self.parents[target];
                if up < 0 {
                    break;
                }
                let (up_false, up_true) = self.op_short[up as usize];
                if (on_false && up_false) || (on_true && up_true) {
                    target = up as usize;
                } else {
                    break;
                }
            }

            let node = &mut self.nodes[i];
            if on_false {
                node.flags |= SC_IF_FALSE;
            }
            if on_true {
                node.flags |= SC_IF_TRUE;
            }
            node.sc_target = if self.parents[target] < 0 {
                -1
            } else {
                target as i16
            };
        }
    }

    // ─── validation ──────────────────────────────────────────────────────────

    fn finish(self, options: CompileOptions) -> Result<Program, CompileError> {
        let len = self.nodes.len();
        if len >= i16::MAX as usize {
            return Err(CompileError::internal("program exceeds the node limit"));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.flags == 0 {
                continue;
            }
            let target = node.sc_target;
            if target < -1 || target > len as i16 {
                return Err(CompileError::internal("short-circuit target out of range"));
            }
            if target >= 0 && target as usize <= i {
                return Err(CompileError::internal("short-circuit target must be later"));
            }
        }
        Ok(Program {
            nodes: self.nodes,
            max_stack_size: self.max_depth as i16,
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::program::Program;

    fn engine() -> Engine {
        let mut engine = Engine::new();
        for name in ["a", "b", "c", "age", "country", "mode", "x"] {
            engine.register_selector(name);
        }
        engine
    }

    fn compile_with(source: &str, options: CompileOptions) -> Program {
        let mut engine = engine();
        *engine.options_mut() = options;
        engine.compile(source).expect("compile")
    }

    fn compile(source: &str) -> Program {
        compile_with(source, CompileOptions::default())
    }

    fn kinds(program: &Program) -> Vec<NodeKind> {
        program.nodes.iter().map(|n| n.kind).collect()
    }

    fn names(program: &Program) -> Vec<String> {
        program
            .nodes
            .iter()
            .map(|n| match n.value.as_str() {
                Some(s) => s.to_string(),
                None => n.value.to_string(),
            })
            .collect()
    }

    #[test]
    fn post_order_layout() {
        let program = compile("(+ 1 2)");
        assert_eq!(
            kinds(&program),
            vec![NodeKind::Constant, NodeKind::Constant, NodeKind::Operator]
        );
        assert_eq!(program.nodes[2].child_count, 2);
        assert_eq!(program.max_stack_size, 2);
        assert_eq!(program.nodes[0].os_top, -1);
        assert_eq!(program.nodes[1].os_top, 0);
        assert_eq!(program.nodes[2].os_top, -1);
    }

    #[test]
    fn and_children_short_on_false_to_termination() {
        let program = compile("(and (< age 18) (= country \"US\"))");
        let lt = &program.nodes[2];
        assert_eq!(lt.kind, NodeKind::Operator);
        assert_eq!(lt.flags, SC_IF_FALSE);
        assert_eq!(lt.sc_target, -1);
        let eq = &program.nodes[5];
        assert_eq!(eq.flags, SC_IF_FALSE);
        assert_eq!(eq.sc_target, -1);
        let and = &program.nodes[6];
        assert_eq!(and.flags, 0);
    }

    #[test]
    fn nested_short_circuit_targets_collapse() {
        // (or (and a b) c): a false determines only the and; the and's
        // true result determines the or (the root).
        let program = compile("(or (and a b) c)");
        assert_eq!(names(&program), vec!["a", "b", "and", "c", "or"]);
        assert_eq!(program.nodes[0].flags, SC_IF_FALSE);
        assert_eq!(program.nodes[0].sc_target, 2);
        assert_eq!(program.nodes[1].sc_target, 2);
        assert_eq!(program.nodes[2].flags, SC_IF_TRUE);
        assert_eq!(program.nodes[2].sc_target, -1);
        assert_eq!(program.nodes[3].flags, SC_IF_TRUE);
        assert_eq!(program.nodes[3].sc_target, -1);
    }

    #[test]
    fn same_polarity_chains_collapse_to_the_farthest_ancestor() {
        let program = compile("(and (and a b) c)");
        // a's false kills both ands; the outer is the root.
        assert_eq!(program.nodes[0].sc_target, -1);
        assert_eq!(program.nodes[1].sc_target, -1);
        assert_eq!(program.nodes[2].sc_target, -1);
    }

    #[test]
    fn conditional_layout_and_targets() {
        let program = compile("(if (= mode \"A\") (* x 2) (* x 3))");
        assert_eq!(
            names(&program),
            vec!["mode", "A", "=", "if", "x", "2", "*", "fi", "x", "3", "*"]
        );
        let head = &program.nodes[3];
        assert_eq!(head.kind, NodeKind::CondBranch);
        assert_eq!(head.flags, SC_IF_TRUE);
        assert_eq!(head.child_count, 1);
        assert_eq!(head.sc_target, 8);
        let join = &program.nodes[7];
        assert_eq!(join.kind, NodeKind::CondBranch);
        assert_eq!(join.child_count, 0);
        assert_eq!(join.sc_target, 11);
        // condition children carry no and/or flags
        assert_eq!(program.nodes[2].flags, 0);
    }

    #[test]
    fn nested_conditionals_share_join_points() {
        let program = compile("(if a 1 (if b 2 3))");
        assert_eq!(
            names(&program),
            vec!["a", "if", "1", "fi", "b", "if", "2", "fi", "3"]
        );
        assert_eq!(program.nodes[1].sc_target, 4);
        assert_eq!(program.nodes[3].sc_target, 9);
        assert_eq!(program.nodes[5].sc_target, 8);
        assert_eq!(program.nodes[7].sc_target, 9);
    }

    #[test]
    fn constant_folding_collapses_pure_trees() {
        let options = CompileOptions {
            constant_folding: true,
            ..CompileOptions::default()
        };
        let program = compile_with("(+ 1 (+ 2 3))", options);
        assert_eq!(program.len(), 1);
        assert_eq!(program.nodes[0].kind, NodeKind::Constant);
        assert_eq!(program.nodes[0].value, Value::Int(6));
    }

    #[test]
    fn folding_never_crosses_a_conditional() {
        let options = CompileOptions {
            constant_folding: true,
            ..CompileOptions::default()
        };
        let program = compile_with("(if (< 1 2) (+ 1 2) (+ 2 3))", options);
        // arms fold to constants, the conditional itself survives
        assert_eq!(names(&program), vec!["true", "if", "3", "fi", "5"]);
    }

    #[test]
    fn folding_leaves_failing_operators_unfolded() {
        let options = CompileOptions {
            constant_folding: true,
            ..CompileOptions::default()
        };
        let program = compile_with("(/ 1 0)", options);
        assert_eq!(program.len(), 3);
    }

    #[test]
    fn fast_operator_fusion_layout() {
        let options = CompileOptions {
            fast_evaluation: true,
            ..CompileOptions::default()
        };
        let program = compile_with("(and (< age 18) (= country \"US\"))", options);
        assert_eq!(
            kinds(&program),
            vec![
                NodeKind::FastOperator,
                NodeKind::Selector,
                NodeKind::Constant,
                NodeKind::FastOperator,
                NodeKind::Selector,
                NodeKind::Constant,
                NodeKind::Operator,
            ]
        );
        // the fused comparisons still short-circuit the and
        assert_eq!(program.nodes[0].flags, SC_IF_FALSE);
        assert_eq!(program.nodes[0].sc_target, -1);
        // inline operand slots carry no flags
        assert_eq!(program.nodes[1].flags, 0);
        assert_eq!(program.nodes[2].flags, 0);
        assert_eq!(program.max_stack_size, 2);
    }

    #[test]
    fn short_circuiting_operators_are_never_fused() {
        let options = CompileOptions {
            fast_evaluation: true,
            ..CompileOptions::default()
        };
        let program = compile_with("(and a b)", options);
        assert_eq!(
            kinds(&program),
            vec![NodeKind::Selector, NodeKind::Selector, NodeKind::Operator]
        );
    }

    #[test]
    fn reordering_puts_cheap_children_first() {
        let options = CompileOptions {
            reordering: true,
            ..CompileOptions::default()
        };
        let program = compile_with("(and (in age (10 20 30)) (= age 1))", options);
        let names = names(&program);
        assert_eq!(names[2], "=");
        assert_eq!(names.last().map(String::as_str), Some("and"));
    }

    #[test]
    fn reordering_is_stable_for_equal_costs() {
        let options = CompileOptions {
            reordering: true,
            ..CompileOptions::default()
        };
        let program = compile_with("(+ a b)", options);
        assert_eq!(names(&program), vec!["a", "b", "+"]);
    }

    #[test]
    fn reordering_skips_conditional_children() {
        let options = CompileOptions {
            reordering: true,
            ..CompileOptions::default()
        };
        let program = compile_with("(and (if a true b) (= age 1))", options);
        // the conditional child pins the order even though = is cheaper
        assert_eq!(program.nodes[1].kind, NodeKind::CondBranch);
    }

    #[test]
    fn compilation_is_deterministic() {
        let source = ";;;; optimize:true\n(or (and (< age 18) (= country \"US\")) (in age (1 2 3)))";
        let one = engine().compile(source).expect("compile");
        let two = engine().compile(source).expect("compile");
        assert_eq!(one.to_string(), two.to_string());
    }

    #[test]
    fn stack_annotation_invariants_hold() {
        let sources = [
            "(+ 1 2)",
            "(and (or a b) (not c))",
            "(if (= mode \"A\") (* x 2) (+ x (* x 3)))",
            ";;;; optimize:true\n(or (and (< age 18) (= country \"US\")) (in age (1 2 3)))",
        ];
        for source in sources {
            let program = engine().compile(source).expect("compile");
            let len = program.len() as i16;
            for node in &program.nodes {
                assert!(node.os_top >= -1, "{source}");
                assert!(node.os_top + 1 < program.max_stack_size + 1, "{source}");
                if node.flags != 0 {
                    assert!(node.sc_target >= -1 && node.sc_target <= len, "{source}");
                }
            }
            assert!(program.max_stack_size >= 1);
        }
    }

    #[test]
    fn optimize_header_sets_all_option_bits() {
        let program = compile(";;;; optimize:true\n(+ age 2)");
        let options = program.options();
        assert!(options.constant_folding);
        assert!(options.reordering);
        assert!(options.fast_evaluation);
    }
}
