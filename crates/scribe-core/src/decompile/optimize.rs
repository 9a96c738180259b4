//! Peephole cleanup of a decompiled function.
//!
//! Collapses single-use synthetic temporaries, simplifies negation chains,
//! and drops assignments never read again. Calls are never reordered,
//! dropped, or changed; only pure values move or disappear.

use crate::ast::{Expr, ScriptFunction, Stmt};
use crate::decompile::structure::invert;

pub fn optimize(func: &mut ScriptFunction) {
    simplify_negations(&mut func.body);
    inline_temps(func);
    remove_dead_stores(func);
    remove_unused_temp_decls(func);
}

fn simplify_negations(stmts: &mut [Stmt]) {
    for_each_expr_mut(stmts, &mut |e| {
        if let Expr::Not(inner) = e {
            if matches!(
                inner.as_ref(),
                Expr::Not(_) | Expr::Binary { .. } | Expr::BoolLit(_)
            ) {
                let taken = std::mem::replace(inner.as_mut(), Expr::Null);
                match invert(taken) {
                    // Still negated: nothing simpler, restore the operand.
                    Expr::Not(orig) => *inner = orig,
                    other => *e = other,
                }
            }
        }
    });
}

/// Inline `$tmp = <pure>;` into the immediately following statement when
/// that is the temporary's only read in the whole function. The read must
/// sit in a once-evaluated position; loop conditions re-evaluate and are
/// excluded.
fn inline_temps(func: &mut ScriptFunction) {
    loop {
        let mut candidates: Vec<String> = Vec::new();
        collect_inline_temps(&func.body, func, &mut candidates);
        let Some(name) = candidates.into_iter().next() else {
            return;
        };
        if !apply_inline(&mut func.body, &name) {
            return;
        }
    }
}

fn collect_inline_temps(stmts: &[Stmt], func: &ScriptFunction, out: &mut Vec<String>) {
    for pair in stmts.windows(2) {
        if let Stmt::Assign { targets, value } = &pair[0] {
            if let [name] = &targets[..] {
                if name.starts_with("$tmp")
                    && !value.has_side_effects()
                    && count_reads(&func.body, name) == 1
                    && count_writes(&func.body, name) == 1
                    && once_evaluated_reads(&pair[1], name) == 1
                {
                    out.push(name.clone());
                }
            }
        }
    }
    for s in stmts {
        for body in stmt_bodies(s) {
            collect_inline_temps(body, func, out);
        }
    }
}

fn apply_inline(stmts: &mut Vec<Stmt>, name: &str) -> bool {
    let mut k = 0;
    while k + 1 < stmts.len() {
        let matches_here = match &stmts[k] {
            Stmt::Assign { targets, .. } => targets.len() == 1 && targets[0] == name,
            _ => false,
        };
        if matches_here && once_evaluated_reads(&stmts[k + 1], name) == 1 {
            let Stmt::Assign { value, .. } = stmts.remove(k) else {
                unreachable!();
            };
            substitute(&mut stmts[k], name, &value);
            return true;
        }
        k += 1;
    }
    for s in stmts {
        for body in stmt_bodies_mut(s) {
            if apply_inline(body, name) {
                return true;
            }
        }
    }
    false
}

/// Drop `$x = <pure>;` when `$x` is read nowhere in the function.
fn remove_dead_stores(func: &mut ScriptFunction) {
    let snapshot = func.body.clone();
    prune_stmts(&mut func.body, &|s| {
        if let Stmt::Assign { targets, value } = s {
            if let [name] = &targets[..] {
                return !value.has_side_effects() && count_reads(&snapshot, name) == 0;
            }
        }
        false
    });
}

fn remove_unused_temp_decls(func: &mut ScriptFunction) {
    let snapshot = func.body.clone();
    prune_stmts(&mut func.body, &|s| {
        if let Stmt::Decl {
            name, init: None, ..
        } = s
        {
            return name.starts_with("$tmp")
                && count_reads(&snapshot, name) == 0
                && count_writes(&snapshot, name) == 0;
        }
        false
    });
}

// ---------------------------------------------------------------------------
// Traversal helpers
// ---------------------------------------------------------------------------

fn stmt_bodies(s: &Stmt) -> Vec<&Vec<Stmt>> {
    match s {
        Stmt::If {
            then_body,
            else_body,
            ..
        } => vec![then_body, else_body],
        Stmt::While { body, .. } | Stmt::DoWhile { body, .. } => vec![body],
        Stmt::Switch { arms, default, .. } => {
            let mut v: Vec<&Vec<Stmt>> = arms.iter().map(|a| &a.body).collect();
            if let Some(d) = default {
                v.push(d);
            }
            v
        }
        _ => Vec::new(),
    }
}

fn stmt_bodies_mut(s: &mut Stmt) -> Vec<&mut Vec<Stmt>> {
    match s {
        Stmt::If {
            then_body,
            else_body,
            ..
        } => vec![then_body, else_body],
        Stmt::While { body, .. } | Stmt::DoWhile { body, .. } => vec![body],
        Stmt::Switch { arms, default, .. } => {
            let mut v: Vec<&mut Vec<Stmt>> = arms.iter_mut().map(|a| &mut a.body).collect();
            if let Some(d) = default {
                v.push(d);
            }
            v
        }
        _ => Vec::new(),
    }
}

fn stmt_exprs(s: &Stmt) -> Vec<&Expr> {
    match s {
        Stmt::Decl { init: Some(e), .. } => vec![e],
        Stmt::Decl { .. } | Stmt::Label(_) | Stmt::Goto(_) => Vec::new(),
        Stmt::Assign { value, .. } => vec![value],
        Stmt::Expr(e) => vec![e],
        Stmt::If { cond, .. } => vec![cond],
        Stmt::While { cond, .. } | Stmt::DoWhile { cond, .. } => vec![cond],
        Stmt::Switch { value, .. } => vec![value],
        Stmt::Return(exprs) => exprs.iter().collect(),
    }
}

fn for_each_expr_mut(stmts: &mut [Stmt], f: &mut impl FnMut(&mut Expr)) {
    fn walk_expr(e: &mut Expr, f: &mut impl FnMut(&mut Expr)) {
        match e {
            Expr::Binary { lhs, rhs, .. } | Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                walk_expr(lhs, f);
                walk_expr(rhs, f);
            }
            Expr::Not(inner) => walk_expr(inner, f),
            Expr::Call { args, .. } => {
                for a in args {
                    walk_expr(a, f);
                }
            }
            _ => {}
        }
        f(e);
    }

    for s in stmts {
        match s {
            Stmt::Decl { init: Some(e), .. } | Stmt::Expr(e) | Stmt::Assign { value: e, .. } => {
                walk_expr(e, f)
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                walk_expr(cond, f);
                for_each_expr_mut(then_body, f);
                for_each_expr_mut(else_body, f);
            }
            Stmt::While { cond, body } | Stmt::DoWhile { body, cond } => {
                walk_expr(cond, f);
                for_each_expr_mut(body, f);
            }
            Stmt::Switch {
                value,
                arms,
                default,
            } => {
                walk_expr(value, f);
                for arm in arms {
                    for_each_expr_mut(&mut arm.body, f);
                }
                if let Some(d) = default {
                    for_each_expr_mut(d, f);
                }
            }
            Stmt::Return(exprs) => {
                for e in exprs {
                    walk_expr(e, f);
                }
            }
            Stmt::Decl { .. } | Stmt::Label(_) | Stmt::Goto(_) => {}
        }
    }
}

fn count_reads(stmts: &[Stmt], name: &str) -> usize {
    let mut n = 0;
    for s in stmts {
        for e in stmt_exprs(s) {
            n += e.count_local(name);
        }
        for body in stmt_bodies(s) {
            n += count_reads(body, name);
        }
    }
    n
}

fn count_writes(stmts: &[Stmt], name: &str) -> usize {
    let mut n = 0;
    for s in stmts {
        if let Stmt::Assign { targets, .. } = s {
            n += targets.iter().filter(|t| *t == name).count();
        }
        for body in stmt_bodies(s) {
            n += count_writes(body, name);
        }
    }
    n
}

/// Reads of `name` in the positions of `s` that evaluate exactly once when
/// the statement runs (loop conditions re-evaluate, nested bodies may not
/// run at all).
fn once_evaluated_reads(s: &Stmt, name: &str) -> usize {
    match s {
        Stmt::Decl { init: Some(e), .. }
        | Stmt::Assign { value: e, .. }
        | Stmt::Expr(e)
        | Stmt::If { cond: e, .. }
        | Stmt::Switch { value: e, .. } => e.count_local(name),
        Stmt::Return(exprs) => exprs.iter().map(|e| e.count_local(name)).sum(),
        _ => 0,
    }
}

fn substitute(s: &mut Stmt, name: &str, replacement: &Expr) {
    fn subst_expr(e: &mut Expr, name: &str, replacement: &Expr) {
        if matches!(e, Expr::Local(n) if n == name) {
            *e = replacement.clone();
            return;
        }
        match e {
            Expr::Binary { lhs, rhs, .. } | Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                subst_expr(lhs, name, replacement);
                subst_expr(rhs, name, replacement);
            }
            Expr::Not(inner) => subst_expr(inner, name, replacement),
            Expr::Call { args, .. } => {
                for a in args {
                    subst_expr(a, name, replacement);
                }
            }
            _ => {}
        }
    }

    match s {
        Stmt::Decl { init: Some(e), .. }
        | Stmt::Assign { value: e, .. }
        | Stmt::Expr(e)
        | Stmt::If { cond: e, .. }
        | Stmt::Switch { value: e, .. } => subst_expr(e, name, replacement),
        Stmt::Return(exprs) => {
            for e in exprs {
                subst_expr(e, name, replacement);
            }
        }
        _ => {}
    }
}

fn prune_stmts(stmts: &mut Vec<Stmt>, dead: &impl Fn(&Stmt) -> bool) {
    stmts.retain(|s| !dead(s));
    for s in stmts {
        for body in stmt_bodies_mut(s) {
            prune_stmts(body, dead);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinOp;
    use crate::ty::Type;

    fn func(body: Vec<Stmt>) -> ScriptFunction {
        ScriptFunction {
            id: Some(1),
            name: "script_1".into(),
            params: vec![],
            returns: vec![],
            body,
        }
    }

    #[test]
    fn double_negation_collapses() {
        let mut f = func(vec![Stmt::If {
            cond: Expr::Not(Box::new(Expr::Not(Box::new(Expr::Local("$i0".into()))))),
            then_body: vec![],
            else_body: vec![],
        }]);
        optimize(&mut f);
        match &f.body[..] {
            [Stmt::If { cond, .. }] => assert_eq!(*cond, Expr::Local("$i0".into())),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn negated_comparison_flips() {
        let cmp = Expr::Binary {
            op: BinOp::Lt,
            lhs: Box::new(Expr::Local("$i0".into())),
            rhs: Box::new(Expr::int(3)),
        };
        let mut f = func(vec![Stmt::If {
            cond: Expr::Not(Box::new(cmp)),
            then_body: vec![],
            else_body: vec![],
        }]);
        optimize(&mut f);
        match &f.body[..] {
            [Stmt::If { cond, .. }] => {
                assert_eq!(
                    *cond,
                    Expr::Binary {
                        op: BinOp::Ge,
                        lhs: Box::new(Expr::Local("$i0".into())),
                        rhs: Box::new(Expr::int(3)),
                    }
                );
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn single_use_temp_inlines_and_decl_disappears() {
        let mut f = func(vec![
            Stmt::Decl {
                ty: Type::Int,
                name: "$tmp0".into(),
                init: None,
            },
            Stmt::Assign {
                targets: vec!["$tmp0".into()],
                value: Expr::int(7),
            },
            Stmt::Return(vec![Expr::Local("$tmp0".into())]),
        ]);
        optimize(&mut f);
        assert_eq!(f.body, vec![Stmt::Return(vec![Expr::int(7)])]);
    }

    #[test]
    fn dead_pure_store_is_removed_but_calls_stay() {
        let call = Expr::Call {
            target: crate::ast::CallTarget::Op {
                opcode: 111,
                name: "clock".into(),
            },
            args: vec![],
            mode: 0,
        };
        let mut f = func(vec![
            Stmt::Assign {
                targets: vec!["$i0".into()],
                value: Expr::int(1),
            },
            Stmt::Assign {
                targets: vec!["$i1".into()],
                value: call.clone(),
            },
            Stmt::Return(vec![]),
        ]);
        optimize(&mut f);
        assert_eq!(
            f.body,
            vec![
                Stmt::Assign {
                    targets: vec!["$i1".into()],
                    value: call,
                },
                Stmt::Return(vec![]),
            ]
        );
    }
}
