use crate::ast::{BinOp, CallTarget, Expr, ScriptFunction, Stmt, SwitchArm};
use crate::db::{SigKey, SignatureDb};
use crate::error::{CoreError, Diagnostic, Result};
use crate::ty::Type;

use super::lexer::{lex, Pos, Token};

/// Parse one script function from source text.
///
/// Unresolved calls and references are accepted untyped and reported as
/// soft diagnostics; grammar violations abort with `SyntaxError`.
pub fn parse(src: &str, db: &SignatureDb) -> Result<(ScriptFunction, Vec<Diagnostic>)> {
    let tokens = lex(src)?;
    let mut p = Parser {
        tokens,
        pos: 0,
        db,
        diags: Vec::new(),
    };
    let func = p.function()?;
    p.expect(&Token::Eof)?;
    Ok((func, p.diags))
}

struct Parser<'a> {
    tokens: Vec<(Token, Pos)>,
    pos: usize,
    db: &'a SignatureDb,
    diags: Vec<Diagnostic>,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].0
    }

    fn peek2(&self) -> &Token {
        let idx = (self.pos + 1).min(self.tokens.len() - 1);
        &self.tokens[idx].0
    }

    fn here(&self) -> Pos {
        self.tokens[self.pos].1
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].0.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn err_at(&self, pos: Pos, message: String) -> CoreError {
        CoreError::Syntax {
            line: pos.line,
            col: pos.col,
            message,
        }
    }

    fn err(&self, message: String) -> CoreError {
        self.err_at(self.here(), message)
    }

    fn expect(&mut self, want: &Token) -> Result<()> {
        if self.peek() == want {
            self.advance();
            Ok(())
        } else {
            Err(self.err(format!("expected `{want}`, found `{}`", self.peek())))
        }
    }

    fn eat(&mut self, want: &Token) -> bool {
        if self.peek() == want {
            self.advance();
            true
        } else {
            false
        }
    }

    // -----------------------------------------------------------------------
    // Function header
    // -----------------------------------------------------------------------

    fn function(&mut self) -> Result<ScriptFunction> {
        let returns = self.return_types()?;

        let name_pos = self.here();
        let Token::Ident(name) = self.advance() else {
            return Err(self.err_at(name_pos, "expected a script name".into()));
        };
        let id = self.resolve_script_name(&name, name_pos);

        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                let ty = self.type_keyword()?;
                let pos = self.here();
                let Token::DollarIdent(pname) = self.advance() else {
                    return Err(self.err_at(pos, "expected a `$`-prefixed parameter name".into()));
                };
                params.push((pname, ty));
                if !self.eat(&Token::Comma) {
                    self.expect(&Token::RParen)?;
                    break;
                }
            }
        }

        self.expect(&Token::LBrace)?;
        let body = self.stmt_list(&Token::RBrace)?;
        self.expect(&Token::RBrace)?;

        Ok(ScriptFunction {
            id,
            name,
            params,
            returns,
            body,
        })
    }

    fn return_types(&mut self) -> Result<Vec<Type>> {
        if self.eat(&Token::Void) {
            return Ok(Vec::new());
        }
        let mut returns = vec![self.type_keyword()?];
        while self.eat(&Token::Pipe) {
            returns.push(self.type_keyword()?);
        }
        Ok(returns)
    }

    fn type_keyword(&mut self) -> Result<Type> {
        let pos = self.here();
        match self.advance() {
            Token::TypeKw(ty) => Ok(ty),
            other => Err(self.err_at(pos, format!("expected a type, found `{other}`"))),
        }
    }

    fn resolve_script_name(&mut self, name: &str, pos: Pos) -> Option<u32> {
        if let Some(id) = name.strip_prefix("script_").and_then(|s| s.parse().ok()) {
            return Some(id);
        }
        match self.db.resolve_name(name) {
            Some((SigKey::Script(id), _)) => Some(id),
            _ => {
                self.diags.push(Diagnostic::UnresolvedSymbol {
                    name: name.to_string(),
                    line: pos.line,
                    col: pos.col,
                });
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn stmt_list(&mut self, terminator: &Token) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while self.peek() != terminator {
            if self.peek() == &Token::Eof {
                return Err(self.err(format!("expected `{terminator}`, found end of input")));
            }
            self.stmt(&mut stmts)?;
        }
        Ok(stmts)
    }

    fn stmt(&mut self, out: &mut Vec<Stmt>) -> Result<()> {
        match self.peek() {
            Token::TypeKw(_) => {
                let ty = self.type_keyword()?;
                let pos = self.here();
                let Token::DollarIdent(name) = self.advance() else {
                    return Err(self.err_at(pos, "expected a `$`-prefixed local name".into()));
                };
                let init = if self.eat(&Token::Assign) {
                    Some(self.expr()?)
                } else {
                    None
                };
                self.expect(&Token::Semi)?;
                out.push(Stmt::Decl { ty, name, init });
            }

            Token::DollarIdent(_) => {
                let mut targets = Vec::new();
                loop {
                    let pos = self.here();
                    let Token::DollarIdent(name) = self.advance() else {
                        return Err(
                            self.err_at(pos, "expected a `$`-prefixed assignment target".into())
                        );
                    };
                    targets.push(name);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::Assign)?;
                let value = self.expr()?;
                self.expect(&Token::Semi)?;
                out.push(Stmt::Assign { targets, value });
            }

            Token::If => out.push(self.if_stmt()?),

            Token::While => {
                self.advance();
                self.expect(&Token::LParen)?;
                let cond = self.expr()?;
                self.expect(&Token::RParen)?;
                let body = self.braced_block()?;
                out.push(Stmt::While { cond, body });
            }

            Token::Do => {
                self.advance();
                let body = self.braced_block()?;
                self.expect(&Token::While)?;
                self.expect(&Token::LParen)?;
                let cond = self.expr()?;
                self.expect(&Token::RParen)?;
                self.expect(&Token::Semi)?;
                out.push(Stmt::DoWhile { body, cond });
            }

            Token::Switch => out.push(self.switch_stmt()?),

            Token::Return => {
                self.advance();
                let mut exprs = Vec::new();
                if self.eat(&Token::LParen) {
                    loop {
                        exprs.push(self.expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::RParen)?;
                }
                self.expect(&Token::Semi)?;
                out.push(Stmt::Return(exprs));
            }

            Token::Goto => {
                self.advance();
                let pos = self.here();
                let Token::Ident(name) = self.advance() else {
                    return Err(self.err_at(pos, "expected a label after `goto`".into()));
                };
                let n = parse_label(&name)
                    .ok_or_else(|| self.err_at(pos, format!("unknown label {name:?}")))?;
                self.expect(&Token::Semi)?;
                out.push(Stmt::Goto(n));
            }

            Token::Ident(name) if self.peek2() == &Token::Colon => {
                let name = name.clone();
                let pos = self.here();
                let n = parse_label(&name)
                    .ok_or_else(|| self.err_at(pos, format!("unknown label {name:?}")))?;
                self.advance();
                self.advance();
                out.push(Stmt::Label(n));
            }

            // A bare block has no scoping of its own; splice its statements.
            Token::LBrace => {
                let stmts = self.braced_block()?;
                out.extend(stmts);
            }

            _ => {
                let e = self.expr()?;
                self.expect(&Token::Semi)?;
                out.push(Stmt::Expr(e));
            }
        }
        Ok(())
    }

    fn braced_block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(&Token::LBrace)?;
        let stmts = self.stmt_list(&Token::RBrace)?;
        self.expect(&Token::RBrace)?;
        Ok(stmts)
    }

    fn if_stmt(&mut self) -> Result<Stmt> {
        self.expect(&Token::If)?;
        self.expect(&Token::LParen)?;
        let cond = self.expr()?;
        self.expect(&Token::RParen)?;
        let then_body = self.braced_block()?;
        let else_body = if self.eat(&Token::Else) {
            if self.peek() == &Token::If {
                vec![self.if_stmt()?]
            } else {
                self.braced_block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            cond,
            then_body,
            else_body,
        })
    }

    fn switch_stmt(&mut self) -> Result<Stmt> {
        self.expect(&Token::Switch)?;
        self.expect(&Token::LParen)?;
        let value = self.expr()?;
        self.expect(&Token::RParen)?;
        self.expect(&Token::LBrace)?;

        let mut arms = Vec::new();
        let mut default = None;
        loop {
            match self.peek() {
                Token::Case => {
                    self.advance();
                    let mut values = vec![self.case_value()?];
                    while self.eat(&Token::Comma) {
                        values.push(self.case_value()?);
                    }
                    self.expect(&Token::Colon)?;
                    let body = self.case_body()?;
                    arms.push(SwitchArm { values, body });
                }
                Token::Default => {
                    let pos = self.here();
                    self.advance();
                    self.expect(&Token::Colon)?;
                    if default.is_some() {
                        return Err(self.err_at(pos, "duplicate default case".into()));
                    }
                    default = Some(self.case_body()?);
                }
                Token::RBrace => {
                    self.advance();
                    break;
                }
                other => {
                    return Err(self.err(format!(
                        "expected `case`, `default` or `}}`, found `{other}`"
                    )))
                }
            }
        }
        Ok(Stmt::Switch {
            value,
            arms,
            default,
        })
    }

    fn case_value(&mut self) -> Result<i32> {
        let negate = self.eat(&Token::Minus);
        let pos = self.here();
        match self.advance() {
            Token::IntLit { value, .. } => Ok(if negate { -value } else { value }),
            other => Err(self.err_at(pos, format!("expected a case value, found `{other}`"))),
        }
    }

    fn case_body(&mut self) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while !matches!(
            self.peek(),
            Token::Case | Token::Default | Token::RBrace | Token::Eof
        ) {
            self.stmt(&mut stmts)?;
        }
        Ok(stmts)
    }

    // -----------------------------------------------------------------------
    // Expressions (precedence climbing)
    // -----------------------------------------------------------------------

    fn expr(&mut self) -> Result<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::PipePipe) {
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.cmp_expr()?;
        while self.eat(&Token::AmpAmp) {
            let rhs = self.cmp_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.add_expr()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinOp::Eq,
                Token::NotEq => BinOp::Ne,
                Token::Lt => BinOp::Lt,
                Token::Gt => BinOp::Gt,
                Token::Le => BinOp::Le,
                Token::Ge => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.add_expr()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn add_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.mul_expr()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn mul_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary_expr()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary_expr(&mut self) -> Result<Expr> {
        if self.eat(&Token::Bang) {
            let inner = self.unary_expr()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        if self.eat(&Token::Minus) {
            let inner = self.unary_expr()?;
            return Ok(match inner {
                Expr::IntLit { value, .. } => Expr::int(value.wrapping_neg()),
                Expr::LongLit(v) => Expr::LongLit(v.wrapping_neg()),
                other => Expr::Binary {
                    op: BinOp::Sub,
                    lhs: Box::new(Expr::int(0)),
                    rhs: Box::new(other),
                },
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        let pos = self.here();
        match self.advance() {
            Token::IntLit { value, hex } => Ok(Expr::IntLit { value, hex }),
            Token::LongLit(v) => Ok(Expr::LongLit(v)),
            Token::StringLit(s) => Ok(Expr::StringLit(s)),
            Token::True => Ok(Expr::BoolLit(true)),
            Token::False => Ok(Expr::BoolLit(false)),
            Token::Null => Ok(Expr::Null),
            Token::DollarIdent(name) => Ok(Expr::Local(name)),
            Token::LParen => {
                let e = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(e)
            }
            Token::Amp => {
                let ref_pos = self.here();
                let Token::Ident(name) = self.advance() else {
                    return Err(self.err_at(ref_pos, "expected a script name after `&`".into()));
                };
                match self.script_ref_id(&name) {
                    Some(id) => Ok(Expr::ScriptRef(id)),
                    None => {
                        self.diags.push(Diagnostic::UnresolvedSymbol {
                            name,
                            line: ref_pos.line,
                            col: ref_pos.col,
                        });
                        Ok(Expr::Null)
                    }
                }
            }
            Token::Dot => {
                let call_pos = self.here();
                let Token::Ident(name) = self.advance() else {
                    return Err(self.err_at(call_pos, "expected a call after `.`".into()));
                };
                self.call(name, call_pos, 1)
            }
            Token::Ident(name) => self.call(name, pos, 0),
            other => Err(self.err_at(pos, format!("expected an expression, found `{other}`"))),
        }
    }

    fn script_ref_id(&self, name: &str) -> Option<u32> {
        if let Some(id) = name.strip_prefix("script_").and_then(|s| s.parse().ok()) {
            return Some(id);
        }
        match self.db.resolve_name(name) {
            Some((SigKey::Script(id), _)) => Some(id),
            _ => None,
        }
    }

    fn call(&mut self, name: String, pos: Pos, mode: u8) -> Result<Expr> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.expr()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
        }

        // `join_string` is the concatenation primitive; in source it is
        // plain string `+`, so the call form desugars.
        if name == "join_string" {
            return args
                .into_iter()
                .reduce(|lhs, rhs| Expr::Binary {
                    op: BinOp::Add,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                })
                .ok_or_else(|| self.err_at(pos, "join_string needs at least one argument".into()));
        }

        let target = self.resolve_call(&name, args.len(), pos);
        Ok(Expr::Call { target, args, mode })
    }

    fn resolve_call(&mut self, name: &str, argc: usize, pos: Pos) -> CallTarget {
        if let Some(id) = name.strip_prefix("script_").and_then(|s| s.parse().ok()) {
            self.check_arity(SigKey::Script(id), name, argc, pos);
            return CallTarget::Script {
                id,
                name: name.to_string(),
            };
        }
        if let Some(op) = name.strip_prefix("op_").and_then(|s| s.parse().ok()) {
            return CallTarget::Op {
                opcode: op,
                name: name.to_string(),
            };
        }
        match self.db.resolve_name(name) {
            Some((key @ SigKey::Opcode(op), _)) => {
                self.check_arity(key, name, argc, pos);
                CallTarget::Op {
                    opcode: op,
                    name: name.to_string(),
                }
            }
            Some((key @ SigKey::Script(id), _)) => {
                self.check_arity(key, name, argc, pos);
                CallTarget::Script {
                    id,
                    name: name.to_string(),
                }
            }
            None => {
                self.diags.push(Diagnostic::UnresolvedSymbol {
                    name: name.to_string(),
                    line: pos.line,
                    col: pos.col,
                });
                CallTarget::Unresolved {
                    name: name.to_string(),
                }
            }
        }
    }

    /// Soft arity check against the database; the compiler re-checks hard.
    fn check_arity(&mut self, key: SigKey, name: &str, argc: usize, pos: Pos) {
        if let Some(sig) = self.db.resolve(key) {
            if sig.params.len() != argc {
                self.diags.push(Diagnostic::SignatureMismatch {
                    name: name.to_string(),
                    message: format!("expected {} arguments, found {argc}", sig.params.len()),
                    line: pos.line,
                    col: pos.col,
                });
            }
        }
    }
}

fn parse_label(name: &str) -> Option<usize> {
    name.strip_prefix("label_")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SignatureDb;

    fn parse_ok(src: &str) -> (ScriptFunction, Vec<Diagnostic>) {
        let db = SignatureDb::with_canonical_table();
        parse(src, &db).unwrap()
    }

    #[test]
    fn minimal_script() {
        let (f, diags) = parse_ok("void script_5() {\n    return;\n}\n");
        assert!(diags.is_empty());
        assert_eq!(f.id, Some(5));
        assert_eq!(f.returns, vec![]);
        assert_eq!(f.body, vec![Stmt::Return(vec![])]);
    }

    #[test]
    fn params_returns_and_locals() {
        let (f, _) = parse_ok(
            "int | string script_7(int $i0, string $s0) {\n    widget $i1;\n    return($i0, $s0);\n}\n",
        );
        assert_eq!(f.returns, vec![Type::Int, Type::String]);
        assert_eq!(
            f.params,
            vec![("$i0".to_string(), Type::Int), ("$s0".to_string(), Type::String)]
        );
        assert_eq!(
            f.body[0],
            Stmt::Decl {
                ty: Type::Widget,
                name: "$i1".into(),
                init: None,
            }
        );
    }

    #[test]
    fn known_call_resolves_and_arity_mismatch_is_soft() {
        let (f, diags) = parse_ok("void script_1() {\n    sound_play(1, 2);\n    return;\n}\n");
        assert!(matches!(
            &f.body[0],
            Stmt::Expr(Expr::Call {
                target: CallTarget::Op { opcode: 106, .. },
                ..
            })
        ));
        assert!(matches!(
            diags[..],
            [Diagnostic::SignatureMismatch { line: 2, .. }]
        ));
    }

    #[test]
    fn unresolved_call_is_accepted_untyped() {
        let (f, diags) = parse_ok("void script_1() {\n    frobnicate($i0);\n    return;\n}\n");
        assert!(matches!(
            &f.body[0],
            Stmt::Expr(Expr::Call {
                target: CallTarget::Unresolved { .. },
                ..
            })
        ));
        assert!(matches!(diags[..], [Diagnostic::UnresolvedSymbol { .. }]));
    }

    #[test]
    fn precedence_and_unary_minus() {
        let (f, _) = parse_ok("void script_1() {\n    $i0 = -3 + 2 * $i1;\n    return;\n}\n");
        let Stmt::Assign { value, .. } = &f.body[0] else {
            panic!("{:?}", f.body[0]);
        };
        assert_eq!(
            *value,
            Expr::Binary {
                op: BinOp::Add,
                lhs: Box::new(Expr::int(-3)),
                rhs: Box::new(Expr::Binary {
                    op: BinOp::Mul,
                    lhs: Box::new(Expr::int(2)),
                    rhs: Box::new(Expr::Local("$i1".into())),
                }),
            }
        );
    }

    #[test]
    fn join_string_desugars_to_string_add() {
        let (f, _) = parse_ok("void script_1() {\n    $s0 = join_string(\"a\", $s1, \"b\");\n    return;\n}\n");
        let Stmt::Assign { value, .. } = &f.body[0] else {
            panic!();
        };
        assert_eq!(
            *value,
            Expr::Binary {
                op: BinOp::Add,
                lhs: Box::new(Expr::Binary {
                    op: BinOp::Add,
                    lhs: Box::new(Expr::StringLit("a".into())),
                    rhs: Box::new(Expr::Local("$s1".into())),
                }),
                rhs: Box::new(Expr::StringLit("b".into())),
            }
        );
    }

    #[test]
    fn do_while_switch_goto_label() {
        let src = "\
void script_2(int $i0) {
    do {
        $i0 = $i0 - 1;
    } while ($i0 > 0);
    switch ($i0) {
        case 1, -2:
            goto label_9;
        default:
            return;
    }
    label_9:
    return;
}
";
        let (f, diags) = parse_ok(src);
        assert!(diags.is_empty(), "{diags:?}");
        assert!(matches!(f.body[0], Stmt::DoWhile { .. }));
        let Stmt::Switch { arms, default, .. } = &f.body[1] else {
            panic!("{:?}", f.body[1]);
        };
        assert_eq!(arms[0].values, vec![1, -2]);
        assert!(default.is_some());
        assert_eq!(f.body[2], Stmt::Label(9));
    }

    #[test]
    fn syntax_error_carries_line_and_column() {
        let db = SignatureDb::with_canonical_table();
        let err = parse("void script_1() {\n    $i0 = ;\n}\n", &db).unwrap_err();
        match err {
            CoreError::Syntax { line, col, .. } => {
                assert_eq!(line, 2);
                assert!(col > 1);
            }
            other => panic!("expected syntax error, got {other}"),
        }
    }

    #[test]
    fn mode_call_and_script_ref() {
        let (f, diags) =
            parse_ok("void script_1() {\n    .sound_play(3);\n    timer_set(10, &script_4);\n    return;\n}\n");
        assert!(diags.is_empty(), "{diags:?}");
        assert!(matches!(
            &f.body[0],
            Stmt::Expr(Expr::Call { mode: 1, .. })
        ));
        let Stmt::Expr(Expr::Call { args, .. }) = &f.body[1] else {
            panic!();
        };
        assert_eq!(args[1], Expr::ScriptRef(4));
    }
}
