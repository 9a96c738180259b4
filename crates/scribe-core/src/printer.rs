//! Deterministic rendering of a script function to `.cs2` source text.
//!
//! Fixed four-space indent, one statement per line, cuddled braces,
//! canonical operator spacing. The output parses back to the same AST, so
//! print → parse → print is a fixed point.

use std::fmt::Write;

use crate::ast::{BinOp, Expr, ScriptFunction, Stmt};

/// Operator binding strength, mirroring the parser's precedence climbing.
fn precedence(e: &Expr) -> u8 {
    match e {
        Expr::Or(..) => 1,
        Expr::And(..) => 2,
        Expr::Binary { op, .. } if op.is_comparison() => 3,
        Expr::Binary {
            op: BinOp::Add | BinOp::Sub,
            ..
        } => 4,
        Expr::Binary { .. } => 5,
        Expr::Not(..) => 6,
        _ => 7,
    }
}

pub fn print(func: &ScriptFunction) -> String {
    let mut out = String::new();
    let mut p = Printer { out: &mut out };
    p.function(func);
    out
}

struct Printer<'a> {
    out: &'a mut String,
}

impl Printer<'_> {
    fn function(&mut self, func: &ScriptFunction) {
        if func.returns.is_empty() {
            self.out.push_str("void ");
        } else {
            for (i, ret) in func.returns.iter().enumerate() {
                if i > 0 {
                    self.out.push_str(" | ");
                }
                self.out.push_str(ret.keyword());
            }
            self.out.push(' ');
        }
        let _ = write!(self.out, "{}(", func.name);
        for (i, (name, ty)) in func.params.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            let _ = write!(self.out, "{} {}", ty.keyword(), name);
        }
        self.out.push_str(") {\n");
        self.block(&func.body, 1);
        self.out.push_str("}\n");
    }

    fn indent(&mut self, depth: usize) {
        for _ in 0..depth {
            self.out.push_str("    ");
        }
    }

    fn block(&mut self, stmts: &[Stmt], depth: usize) {
        for stmt in stmts {
            self.stmt(stmt, depth);
        }
    }

    fn stmt(&mut self, stmt: &Stmt, depth: usize) {
        match stmt {
            Stmt::Decl { ty, name, init } => {
                self.indent(depth);
                let _ = write!(self.out, "{} {}", ty.keyword(), name);
                if let Some(init) = init {
                    self.out.push_str(" = ");
                    self.expr(init, 0);
                }
                self.out.push_str(";\n");
            }
            Stmt::Assign { targets, value } => {
                self.indent(depth);
                for (i, t) in targets.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.out.push_str(t);
                }
                self.out.push_str(" = ");
                self.expr(value, 0);
                self.out.push_str(";\n");
            }
            Stmt::Expr(e) => {
                self.indent(depth);
                self.expr(e, 0);
                self.out.push_str(";\n");
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                self.indent(depth);
                self.out.push_str("if (");
                self.expr(cond, 0);
                self.out.push_str(") {\n");
                self.block(then_body, depth + 1);
                self.if_tail(else_body, depth);
            }
            Stmt::While { cond, body } => {
                self.indent(depth);
                self.out.push_str("while (");
                self.expr(cond, 0);
                self.out.push_str(") {\n");
                self.block(body, depth + 1);
                self.indent(depth);
                self.out.push_str("}\n");
            }
            Stmt::DoWhile { body, cond } => {
                self.indent(depth);
                self.out.push_str("do {\n");
                self.block(body, depth + 1);
                self.indent(depth);
                self.out.push_str("} while (");
                self.expr(cond, 0);
                self.out.push_str(");\n");
            }
            Stmt::Switch {
                value,
                arms,
                default,
            } => {
                self.indent(depth);
                self.out.push_str("switch (");
                self.expr(value, 0);
                self.out.push_str(") {\n");
                for arm in arms {
                    self.indent(depth + 1);
                    self.out.push_str("case ");
                    for (i, v) in arm.values.iter().enumerate() {
                        if i > 0 {
                            self.out.push_str(", ");
                        }
                        let _ = write!(self.out, "{v}");
                    }
                    self.out.push_str(":\n");
                    self.block(&arm.body, depth + 2);
                }
                if let Some(default) = default {
                    self.indent(depth + 1);
                    self.out.push_str("default:\n");
                    self.block(default, depth + 2);
                }
                self.indent(depth);
                self.out.push_str("}\n");
            }
            Stmt::Return(exprs) => {
                self.indent(depth);
                if exprs.is_empty() {
                    self.out.push_str("return;\n");
                } else {
                    self.out.push_str("return(");
                    for (i, e) in exprs.iter().enumerate() {
                        if i > 0 {
                            self.out.push_str(", ");
                        }
                        self.expr(e, 0);
                    }
                    self.out.push_str(");\n");
                }
            }
            Stmt::Label(n) => {
                self.indent(depth);
                let _ = write!(self.out, "label_{n}:\n");
            }
            Stmt::Goto(n) => {
                self.indent(depth);
                let _ = write!(self.out, "goto label_{n};\n");
            }
        }
    }

    /// `} else {` / `} else if (...) {` chains.
    fn if_tail(&mut self, else_body: &[Stmt], depth: usize) {
        if else_body.is_empty() {
            self.indent(depth);
            self.out.push_str("}\n");
            return;
        }
        if let [Stmt::If {
            cond,
            then_body,
            else_body: nested_else,
        }] = else_body
        {
            self.indent(depth);
            self.out.push_str("} else if (");
            self.expr(cond, 0);
            self.out.push_str(") {\n");
            self.block(then_body, depth + 1);
            self.if_tail(nested_else, depth);
            return;
        }
        self.indent(depth);
        self.out.push_str("} else {\n");
        self.block(else_body, depth + 1);
        self.indent(depth);
        self.out.push_str("}\n");
    }

    /// Print an expression, parenthesizing when its binding is at or below
    /// `min_prec` of the surrounding operator position.
    fn expr(&mut self, e: &Expr, min_prec: u8) {
        let prec = precedence(e);
        let parens = prec < min_prec;
        if parens {
            self.out.push('(');
        }
        match e {
            Expr::IntLit { value, hex } => {
                if *hex && *value >= 0 {
                    let _ = write!(self.out, "0x{value:x}");
                } else {
                    let _ = write!(self.out, "{value}");
                }
            }
            Expr::LongLit(v) => {
                let _ = write!(self.out, "{v}L");
            }
            Expr::StringLit(s) => {
                self.out.push('"');
                for c in s.chars() {
                    match c {
                        '"' => self.out.push_str("\\\""),
                        '\\' => self.out.push_str("\\\\"),
                        '\n' => self.out.push_str("\\n"),
                        '\t' => self.out.push_str("\\t"),
                        c => self.out.push(c),
                    }
                }
                self.out.push('"');
            }
            Expr::BoolLit(b) => {
                let _ = write!(self.out, "{b}");
            }
            Expr::Null => self.out.push_str("null"),
            Expr::Local(name) => self.out.push_str(name),
            Expr::Binary { op, lhs, rhs } => {
                self.expr(lhs, prec);
                let _ = write!(self.out, " {} ", op.symbol());
                self.expr(rhs, prec + 1);
            }
            Expr::Not(inner) => {
                self.out.push('!');
                self.expr(inner, precedence(e));
            }
            Expr::And(lhs, rhs) => {
                self.expr(lhs, prec);
                self.out.push_str(" && ");
                self.expr(rhs, prec + 1);
            }
            Expr::Or(lhs, rhs) => {
                self.expr(lhs, prec);
                self.out.push_str(" || ");
                self.expr(rhs, prec + 1);
            }
            Expr::Call { target, args, mode } => {
                if *mode != 0 {
                    self.out.push('.');
                }
                self.out.push_str(target.name());
                self.out.push('(');
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.expr(a, 0);
                }
                self.out.push(')');
            }
            Expr::ScriptRef(id) => {
                let _ = write!(self.out, "&script_{id}");
            }
        }
        if parens {
            self.out.push(')');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{CallTarget, SwitchArm};
    use crate::ty::Type;

    fn local(name: &str) -> Expr {
        Expr::Local(name.into())
    }

    fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    #[test]
    fn minimal_void_script() {
        let func = ScriptFunction {
            id: Some(5),
            name: "script_5".into(),
            params: vec![],
            returns: vec![],
            body: vec![Stmt::Return(vec![])],
        };
        assert_eq!(print(&func), "void script_5() {\n    return;\n}\n");
    }

    #[test]
    fn precedence_parenthesizes_only_where_needed() {
        // ($i0 + 1) * 2 needs parens; $i0 + 1 * 2 does not.
        let func = ScriptFunction {
            id: Some(1),
            name: "script_1".into(),
            params: vec![("$i0".into(), Type::Int)],
            returns: vec![Type::Int],
            body: vec![
                Stmt::Return(vec![bin(
                    BinOp::Mul,
                    bin(BinOp::Add, local("$i0"), Expr::int(1)),
                    Expr::int(2),
                )]),
            ],
        };
        let text = print(&func);
        assert!(text.contains("return(($i0 + 1) * 2);"), "{text}");

        let func2 = ScriptFunction {
            body: vec![Stmt::Return(vec![bin(
                BinOp::Add,
                local("$i0"),
                bin(BinOp::Mul, Expr::int(1), Expr::int(2)),
            )])],
            ..func
        };
        let text2 = print(&func2);
        assert!(text2.contains("return($i0 + 1 * 2);"), "{text2}");
    }

    #[test]
    fn else_if_chains_stay_flat() {
        let arm = |v: i32| Stmt::If {
            cond: bin(BinOp::Eq, local("$i0"), Expr::int(v)),
            then_body: vec![Stmt::Return(vec![])],
            else_body: vec![],
        };
        let mut chain = arm(2);
        if let Stmt::If { else_body, .. } = &mut chain {
            *else_body = vec![arm(3)];
        }
        let func = ScriptFunction {
            id: Some(1),
            name: "script_1".into(),
            params: vec![("$i0".into(), Type::Int)],
            returns: vec![],
            body: vec![chain, Stmt::Return(vec![])],
        };
        let text = print(&func);
        assert!(text.contains("} else if ($i0 == 3) {"), "{text}");
    }

    #[test]
    fn switch_and_hex_and_callback_render() {
        let func = ScriptFunction {
            id: Some(9),
            name: "script_9".into(),
            params: vec![("$i0".into(), Type::Int)],
            returns: vec![],
            body: vec![
                Stmt::Switch {
                    value: local("$i0"),
                    arms: vec![SwitchArm {
                        values: vec![1, 2],
                        body: vec![Stmt::Expr(Expr::Call {
                            target: CallTarget::Op {
                                opcode: 115,
                                name: "timer_set".into(),
                            },
                            args: vec![Expr::int(50), Expr::ScriptRef(12)],
                            mode: 0,
                        })],
                    }],
                    default: Some(vec![Stmt::Assign {
                        targets: vec!["$i0".into()],
                        value: Expr::IntLit {
                            value: 0xff00ff,
                            hex: true,
                        },
                    }]),
                },
                Stmt::Return(vec![]),
            ],
        };
        let text = print(&func);
        assert!(text.contains("case 1, 2:"), "{text}");
        assert!(text.contains("timer_set(50, &script_12);"), "{text}");
        assert!(text.contains("$i0 = 0xff00ff;"), "{text}");
    }
}
