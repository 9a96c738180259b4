//! Lowering from source form back to bytecode.
//!
//! Expressions emit in operand-then-operator postfix order, left to right.
//! Control statements lower to comparison branches with symbolic labels
//! that are back-patched once block extents are known. The emitted shapes
//! are exactly the ones the decompiler's structural recovery classifies,
//! so a compile/decompile round trip is stable.

use std::collections::HashMap;

use cs2bin::{
    encode_script, BaseKind, FormatFlags, Instruction, Opcode, Operand, ScrambleMap, Script,
    SwitchCase, API_OPCODE_BASE,
};

use crate::ast::{BinOp, CallTarget, Expr, ScriptFunction, Stmt};
use crate::db::{SigKey, SignatureDb};
use crate::error::{CoreError, Result};
use crate::ty::Type;

/// Compile a function to a script buffer.
///
/// When `disasm` is supplied, a mnemonic-resolved listing of everything
/// emitted is written to it in emission order regardless of overall
/// success, to aid debugging a partially-failing compile.
pub fn compile(
    func: &ScriptFunction,
    db: &SignatureDb,
    scramble: &ScrambleMap,
    flags: FormatFlags,
    disasm: Option<&mut String>,
) -> Result<Vec<u8>> {
    let mut c = Compiler {
        func,
        db,
        flags,
        insts: Vec::new(),
        next_label: 0,
        label_pcs: HashMap::new(),
        user_labels: HashMap::new(),
        fixups: Vec::new(),
        table_fixups: Vec::new(),
        locals: HashMap::new(),
        counts: [0; 3],
    };
    let result = c.run();
    if let Some(sink) = disasm {
        c.write_disasm(sink);
    }
    let script = result?;
    encode_script(&script, scramble, flags)
        .map_err(|e| CoreError::from_format(script.id, e))
}

/// Symbolic jump target, resolved to a pc during back-patching.
type LabelId = usize;

struct Compiler<'a> {
    func: &'a ScriptFunction,
    db: &'a SignatureDb,
    flags: FormatFlags,
    /// Canonical opcode + operand per emitted instruction; branch operands
    /// hold placeholders until back-patching.
    insts: Vec<(u16, Operand)>,
    next_label: usize,
    label_pcs: HashMap<LabelId, usize>,
    /// Source `label_<n>` → symbolic label.
    user_labels: HashMap<usize, LabelId>,
    fixups: Vec<(usize, LabelId)>,
    table_fixups: Vec<(usize, Vec<(i32, LabelId)>)>,
    locals: HashMap<String, (Type, i32)>,
    counts: [i32; 3],
}

fn kind_index(kind: BaseKind) -> usize {
    match kind {
        BaseKind::Int => 0,
        BaseKind::String => 1,
        BaseKind::Long => 2,
    }
}

impl<'a> Compiler<'a> {
    fn err(&self, locus: &str, message: String) -> CoreError {
        CoreError::Compile {
            script: self.func.name.clone(),
            locus: locus.to_string(),
            message,
        }
    }

    fn run(&mut self) -> Result<Script> {
        let id = match self.func.id {
            Some(id) => id,
            None => {
                return Err(self.err(
                    "header",
                    "script has no numeric id (name it script_<id> or register it)".into(),
                ))
            }
        };

        self.collect_locals()?;
        let func = self.func;
        self.stmts(&func.body)?;

        // A function must not run off the end of its instruction stream.
        if self.insts.last().map(|(op, _)| *op) != Some(Opcode::Return as u16) {
            if self.func.returns.is_empty() {
                self.emit(Opcode::Return as u16, Operand::None);
            } else {
                return Err(self.err(
                    "end of function",
                    "control can reach the end of a function with return values".into(),
                ));
            }
        }

        self.patch()?;

        let instructions = self
            .insts
            .iter()
            .enumerate()
            .map(|(pc, (opcode, operand))| Instruction {
                pc,
                opcode: *opcode,
                raw: *opcode,
                operand: operand.clone(),
            })
            .collect();

        Ok(Script {
            id,
            param_codes: self.func.params.iter().map(|(_, ty)| ty.code()).collect(),
            int_locals: self.counts[0] as u16,
            string_locals: self.counts[1] as u16,
            long_locals: self.counts[2] as u16,
            instructions,
        })
    }

    // -----------------------------------------------------------------------
    // Locals
    // -----------------------------------------------------------------------

    fn collect_locals(&mut self) -> Result<()> {
        let func = self.func;
        for (name, ty) in &func.params {
            self.declare(name, *ty)?;
        }
        collect_decls(&func.body, &mut |name, ty| self.declare(name, ty))
    }

    fn declare(&mut self, name: &str, ty: Type) -> Result<()> {
        if ty == Type::Long && self.flags.disable_longs {
            return Err(CoreError::UnsupportedFormat {
                feature: "long locals".into(),
                pc: self.insts.len(),
            });
        }
        let idx = kind_index(ty.base());
        let slot = self.counts[idx];
        if self
            .locals
            .insert(name.to_string(), (ty, slot))
            .is_some()
        {
            return Err(self.err("declarations", format!("duplicate local {name}")));
        }
        self.counts[idx] += 1;
        Ok(())
    }

    fn local(&self, name: &str, locus: &str) -> Result<(Type, i32)> {
        self.locals
            .get(name)
            .copied()
            .ok_or_else(|| self.err(locus, format!("undeclared local {name}")))
    }

    // -----------------------------------------------------------------------
    // Emission primitives
    // -----------------------------------------------------------------------

    fn emit(&mut self, opcode: u16, operand: Operand) -> usize {
        self.insts.push((opcode, operand));
        self.insts.len() - 1
    }

    fn emit_checked(&mut self, op: Opcode, operand: Operand, locus: &str) -> Result<usize> {
        if op == Opcode::Switch && self.flags.disable_switches {
            return Err(CoreError::UnsupportedFormat {
                feature: format!("switch ({locus})"),
                pc: self.insts.len(),
            });
        }
        if op.needs_longs() && self.flags.disable_longs {
            return Err(CoreError::UnsupportedFormat {
                feature: format!("long ({locus})"),
                pc: self.insts.len(),
            });
        }
        Ok(self.emit(op as u16, operand))
    }

    fn new_label(&mut self) -> LabelId {
        self.next_label += 1;
        self.next_label - 1
    }

    fn define_label(&mut self, label: LabelId) {
        self.label_pcs.insert(label, self.insts.len());
    }

    fn branch(&mut self, op: Opcode, label: LabelId) {
        let idx = self.emit(op as u16, Operand::Int(0));
        self.fixups.push((idx, label));
    }

    fn user_label(&mut self, n: usize) -> LabelId {
        if let Some(&l) = self.user_labels.get(&n) {
            return l;
        }
        let l = self.new_label();
        self.user_labels.insert(n, l);
        l
    }

    fn patch(&mut self) -> Result<()> {
        let fixups = std::mem::take(&mut self.fixups);
        for (idx, label) in fixups {
            let target = *self.label_pcs.get(&label).ok_or_else(|| {
                self.err("back-patching", "branch to an undefined label".into())
            })?;
            self.insts[idx].1 = Operand::Int(target as i32 - idx as i32 - 1);
        }
        for (idx, cases) in std::mem::take(&mut self.table_fixups) {
            let mut table = Vec::with_capacity(cases.len());
            for (value, label) in cases {
                let target = *self.label_pcs.get(&label).ok_or_else(|| {
                    self.err("back-patching", "switch case to an undefined label".into())
                })?;
                table.push(SwitchCase {
                    value,
                    delta: target as i32 - idx as i32 - 1,
                });
            }
            self.insts[idx].1 = Operand::Table(table);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn stmts(&mut self, stmts: &[Stmt]) -> Result<()> {
        for s in stmts {
            self.stmt(s)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Decl { name, init, .. } => {
                if let Some(init) = init {
                    self.assign_one(name, init)?;
                }
                Ok(())
            }

            Stmt::Assign { targets, value } => match &targets[..] {
                [single] => self.assign_one(single, value),
                _ => self.assign_multi(targets, value),
            },

            Stmt::Expr(e) => {
                let produced = self.eval_multi(e, "expression statement")?;
                for ty in produced.iter().rev() {
                    let pop = match ty.base() {
                        BaseKind::Int => Opcode::PopInt,
                        BaseKind::String => Opcode::PopString,
                        BaseKind::Long => Opcode::PopLong,
                    };
                    self.emit_checked(pop, Operand::None, "expression statement")?;
                }
                Ok(())
            }

            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let l_else = self.new_label();
                self.cond_jump(cond, l_else, false)?;
                self.stmts(then_body)?;
                if else_body.is_empty() {
                    self.define_label(l_else);
                } else {
                    let l_end = self.new_label();
                    self.branch(Opcode::Goto, l_end);
                    self.define_label(l_else);
                    self.stmts(else_body)?;
                    self.define_label(l_end);
                }
                Ok(())
            }

            Stmt::While { cond, body } => {
                let l_cond = self.new_label();
                let l_end = self.new_label();
                self.define_label(l_cond);
                self.cond_jump(cond, l_end, false)?;
                self.stmts(body)?;
                self.branch(Opcode::Goto, l_cond);
                self.define_label(l_end);
                Ok(())
            }

            Stmt::DoWhile { body, cond } => {
                let l_start = self.new_label();
                self.define_label(l_start);
                self.stmts(body)?;
                self.cond_jump(cond, l_start, true)
            }

            Stmt::Switch {
                value,
                arms,
                default,
            } => self.switch(value, arms, default.as_deref()),

            Stmt::Return(exprs) => {
                if exprs.len() != self.func.returns.len() {
                    return Err(self.err(
                        "return statement",
                        format!(
                            "{} values returned, {} declared",
                            exprs.len(),
                            self.func.returns.len()
                        ),
                    ));
                }
                let declared = self.func.returns.clone();
                for (e, want) in exprs.iter().zip(declared) {
                    let got = self.eval(e, "return statement")?;
                    self.check_type(got, want, "return statement")?;
                }
                self.emit(Opcode::Return as u16, Operand::None);
                Ok(())
            }

            Stmt::Label(n) => {
                let l = self.user_label(*n);
                if self.label_pcs.contains_key(&l) {
                    return Err(self.err("labels", format!("duplicate label label_{n}")));
                }
                self.define_label(l);
                Ok(())
            }

            Stmt::Goto(n) => {
                let l = self.user_label(*n);
                self.branch(Opcode::Goto, l);
                Ok(())
            }
        }
    }

    fn assign_one(&mut self, target: &str, value: &Expr) -> Result<()> {
        let locus = format!("assignment to {target}");
        let (ty, slot) = self.local(target, &locus)?;
        let got = self.eval(value, &locus)?;
        self.check_type(got, ty, &locus)?;
        let store = match ty.base() {
            BaseKind::Int => Opcode::StoreInt,
            BaseKind::String => Opcode::StoreString,
            BaseKind::Long => Opcode::StoreLong,
        };
        self.emit_checked(store, Operand::Int(slot), &locus)?;
        Ok(())
    }

    fn assign_multi(&mut self, targets: &[String], value: &Expr) -> Result<()> {
        let locus = "multi-assignment";
        if !matches!(value, Expr::Call { .. }) {
            return Err(self.err(locus, "only a call can assign multiple targets".into()));
        }
        let produced = self.eval_multi(value, locus)?;
        if produced.len() != targets.len() {
            return Err(self.err(
                locus,
                format!(
                    "call produces {} values for {} targets",
                    produced.len(),
                    targets.len()
                ),
            ));
        }
        // Later-pushed values pop first: store back to front.
        for (target, &got) in targets.iter().zip(produced.iter()).rev() {
            let (ty, slot) = self.local(target, locus)?;
            self.check_type(got, ty, locus)?;
            let store = match ty.base() {
                BaseKind::Int => Opcode::StoreInt,
                BaseKind::String => Opcode::StoreString,
                BaseKind::Long => Opcode::StoreLong,
            };
            self.emit_checked(store, Operand::Int(slot), locus)?;
        }
        Ok(())
    }

    fn switch(&mut self, value: &Expr, arms: &[crate::ast::SwitchArm], default: Option<&[Stmt]>) -> Result<()> {
        let locus = "switch";
        let got = self.eval(value, locus)?;
        if got.base() != BaseKind::Int {
            return Err(self.err(locus, format!("switch value must be int-like, found {got}")));
        }

        let mut seen = HashMap::new();
        let mut cases = Vec::new();
        let arm_labels: Vec<LabelId> = arms.iter().map(|_| self.new_label()).collect();
        for (arm, &label) in arms.iter().zip(&arm_labels) {
            for &v in &arm.values {
                if seen.insert(v, ()).is_some() {
                    return Err(self.err(locus, format!("duplicate case value {v}")));
                }
                cases.push((v, label));
            }
        }

        let idx = self.emit_checked(Opcode::Switch, Operand::Table(Vec::new()), locus)?;
        self.table_fixups.push((idx, cases));

        let l_end = self.new_label();
        if let Some(default) = default {
            self.stmts(default)?;
        }
        self.branch(Opcode::Goto, l_end);
        for (arm, label) in arms.iter().zip(arm_labels) {
            self.define_label(label);
            self.stmts(&arm.body)?;
            self.branch(Opcode::Goto, l_end);
        }
        self.define_label(l_end);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Conditions
    // -----------------------------------------------------------------------

    /// Emit a jump to `label` taken when `cond` evaluates to `jump_if`.
    fn cond_jump(&mut self, cond: &Expr, label: LabelId, jump_if: bool) -> Result<()> {
        let locus = "condition";
        match cond {
            Expr::Binary { op, lhs, rhs } if op.is_comparison() => {
                let lk = self.static_type(lhs, locus)?.base();
                let rk = self.static_type(rhs, locus)?.base();
                if lk != rk {
                    return Err(self.err(
                        locus,
                        format!("comparison between {lk:?} and {rk:?} operands"),
                    ));
                }
                if lk == BaseKind::String {
                    return Err(self.err(
                        locus,
                        "the instruction set has no string comparison".into(),
                    ));
                }
                self.eval(lhs, locus)?;
                self.eval(rhs, locus)?;

                let effective = if jump_if {
                    *op
                } else {
                    op.inverse().expect("comparisons always invert")
                };
                match lk {
                    BaseKind::Int => {
                        let branch_op = match effective {
                            BinOp::Eq => Opcode::IfIcmpEq,
                            BinOp::Ne => Opcode::IfIcmpNe,
                            BinOp::Lt => Opcode::IfIcmpLt,
                            BinOp::Gt => Opcode::IfIcmpGt,
                            BinOp::Le => Opcode::IfIcmpLe,
                            BinOp::Ge => Opcode::IfIcmpGe,
                            _ => unreachable!(),
                        };
                        self.branch(branch_op, label);
                    }
                    BaseKind::Long => {
                        // Only eq/ne/lt/gt exist for longs; le/ge emit the
                        // complement skipping over an unconditional jump.
                        let direct = match effective {
                            BinOp::Eq => Some(Opcode::IfLcmpEq),
                            BinOp::Ne => Some(Opcode::IfLcmpNe),
                            BinOp::Lt => Some(Opcode::IfLcmpLt),
                            BinOp::Gt => Some(Opcode::IfLcmpGt),
                            _ => None,
                        };
                        match direct {
                            Some(op) => {
                                let idx = self.emit_checked(op, Operand::Int(0), locus)?;
                                self.fixups.push((idx, label));
                            }
                            None => {
                                let complement = match effective {
                                    BinOp::Le => Opcode::IfLcmpGt,
                                    BinOp::Ge => Opcode::IfLcmpLt,
                                    _ => unreachable!(),
                                };
                                let l_skip = self.new_label();
                                let idx =
                                    self.emit_checked(complement, Operand::Int(0), locus)?;
                                self.fixups.push((idx, l_skip));
                                self.branch(Opcode::Goto, label);
                                self.define_label(l_skip);
                            }
                        }
                    }
                    BaseKind::String => unreachable!(),
                }
                Ok(())
            }

            Expr::Not(inner) => self.cond_jump(inner, label, !jump_if),

            Expr::And(a, b) => {
                if jump_if {
                    let l_out = self.new_label();
                    self.cond_jump(a, l_out, false)?;
                    self.cond_jump(b, label, true)?;
                    self.define_label(l_out);
                } else {
                    self.cond_jump(a, label, false)?;
                    self.cond_jump(b, label, false)?;
                }
                Ok(())
            }

            Expr::Or(a, b) => {
                if jump_if {
                    self.cond_jump(a, label, true)?;
                    self.cond_jump(b, label, true)?;
                } else {
                    let l_out = self.new_label();
                    self.cond_jump(a, l_out, true)?;
                    self.cond_jump(b, label, false)?;
                    self.define_label(l_out);
                }
                Ok(())
            }

            // Bare boolean value: compare against 1.
            other => {
                let got = self.eval(other, locus)?;
                if got.base() != BaseKind::Int {
                    return Err(self.err(
                        locus,
                        format!("condition must be boolean-like, found {got}"),
                    ));
                }
                self.emit(Opcode::PushInt as u16, Operand::Int(1));
                let branch_op = if jump_if {
                    Opcode::IfIcmpEq
                } else {
                    Opcode::IfIcmpNe
                };
                self.branch(branch_op, label);
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn check_type(&self, got: Type, want: Type, locus: &str) -> Result<()> {
        if got.compatible(want) {
            Ok(())
        } else {
            Err(self.err(locus, format!("type mismatch: expected {want}, found {got}")))
        }
    }

    /// Static type of an expression, without emitting anything.
    fn static_type(&self, e: &Expr, locus: &str) -> Result<Type> {
        Ok(match e {
            Expr::IntLit { .. } => Type::Int,
            Expr::LongLit(_) => Type::Long,
            Expr::StringLit(_) => Type::String,
            Expr::BoolLit(_) => Type::Boolean,
            Expr::Null => Type::Unknown,
            Expr::Local(name) => self.local(name, locus)?.0,
            Expr::Binary { op, lhs, rhs } => {
                if op.is_comparison() {
                    Type::Boolean
                } else if *op == BinOp::Add
                    && (self.static_type(lhs, locus)?.base() == BaseKind::String
                        || self.static_type(rhs, locus)?.base() == BaseKind::String)
                {
                    Type::String
                } else {
                    Type::Int
                }
            }
            Expr::Not(_) | Expr::And(..) | Expr::Or(..) => Type::Boolean,
            Expr::Call { target, .. } => match self.call_sig(target) {
                Some(sig) => sig.returns.first().copied().unwrap_or(Type::Unknown),
                None => Type::Unknown,
            },
            Expr::ScriptRef(_) => Type::Callback,
        })
    }

    fn call_sig(&self, target: &CallTarget) -> Option<&crate::db::Signature> {
        match target {
            CallTarget::Op { opcode, .. } => self.db.resolve(SigKey::Opcode(*opcode)),
            CallTarget::Script { id, .. } => self.db.resolve(SigKey::Script(*id)),
            CallTarget::Unresolved { .. } => None,
        }
    }

    /// Evaluate an expression that must produce exactly one value.
    fn eval(&mut self, e: &Expr, locus: &str) -> Result<Type> {
        let produced = self.eval_multi(e, locus)?;
        match produced[..] {
            [ty] => Ok(ty),
            [] => Err(self.err(locus, "expression produces no value".into())),
            _ => Err(self.err(
                locus,
                format!(
                    "call produces {} values in a single-value context",
                    produced.len()
                ),
            )),
        }
    }

    /// Evaluate an expression; only calls may produce zero or several values.
    fn eval_multi(&mut self, e: &Expr, locus: &str) -> Result<Vec<Type>> {
        match e {
            Expr::IntLit { value, .. } => {
                self.emit(Opcode::PushInt as u16, Operand::Int(*value));
                Ok(vec![Type::Int])
            }
            Expr::BoolLit(b) => {
                self.emit(Opcode::PushInt as u16, Operand::Int(i32::from(*b)));
                Ok(vec![Type::Boolean])
            }
            Expr::Null => {
                self.emit(Opcode::PushInt as u16, Operand::Int(-1));
                Ok(vec![Type::Unknown])
            }
            Expr::LongLit(v) => {
                self.emit_checked(Opcode::PushLong, Operand::Long(*v), locus)?;
                Ok(vec![Type::Long])
            }
            Expr::StringLit(s) => {
                self.emit(Opcode::PushString as u16, Operand::Str(s.clone()));
                Ok(vec![Type::String])
            }
            Expr::Local(name) => {
                let (ty, slot) = self.local(name, locus)?;
                let load = match ty.base() {
                    BaseKind::Int => Opcode::LoadInt,
                    BaseKind::String => Opcode::LoadString,
                    BaseKind::Long => Opcode::LoadLong,
                };
                self.emit_checked(load, Operand::Int(slot), locus)?;
                Ok(vec![ty])
            }
            Expr::ScriptRef(id) => {
                self.emit(Opcode::PushInt as u16, Operand::Int(*id as i32));
                Ok(vec![Type::Callback])
            }

            Expr::Binary { op, .. } if op.is_comparison() => Err(self.err(
                locus,
                "comparisons are only valid in conditions".into(),
            )),
            Expr::Not(_) | Expr::And(..) | Expr::Or(..) => Err(self.err(
                locus,
                "boolean operators are only valid in conditions".into(),
            )),

            Expr::Binary { op, lhs, rhs } => {
                if *op == BinOp::Add && self.static_type(e, locus)? == Type::String {
                    return self.join_string(e, locus);
                }
                let lt = self.eval(lhs, locus)?;
                let rt = self.eval(rhs, locus)?;
                for ty in [lt, rt] {
                    if ty.base() != BaseKind::Int {
                        return Err(self.err(
                            locus,
                            format!("arithmetic needs int operands, found {ty}"),
                        ));
                    }
                }
                let arith = match op {
                    BinOp::Add => Opcode::Add,
                    BinOp::Sub => Opcode::Sub,
                    BinOp::Mul => Opcode::Mul,
                    BinOp::Div => Opcode::Div,
                    BinOp::Mod => Opcode::Mod,
                    _ => unreachable!(),
                };
                self.emit(arith as u16, Operand::None);
                Ok(vec![Type::Int])
            }

            Expr::Call { target, args, mode } => self.call(target, args, *mode, locus),
        }
    }

    /// Flatten a string `+` chain into one `join_string`.
    fn join_string(&mut self, e: &Expr, locus: &str) -> Result<Vec<Type>> {
        fn collect<'e>(e: &'e Expr, parts: &mut Vec<&'e Expr>) {
            match e {
                Expr::Binary {
                    op: BinOp::Add,
                    lhs,
                    rhs,
                } => {
                    collect(lhs, parts);
                    collect(rhs, parts);
                }
                other => parts.push(other),
            }
        }
        let mut parts = Vec::new();
        collect(e, &mut parts);
        for part in &parts {
            let ty = self.eval(part, locus)?;
            if ty.base() != BaseKind::String {
                return Err(self.err(
                    locus,
                    format!("string concatenation needs string operands, found {ty}"),
                ));
            }
        }
        self.emit(
            Opcode::JoinString as u16,
            Operand::Int(parts.len() as i32),
        );
        Ok(vec![Type::String])
    }

    fn call(
        &mut self,
        target: &CallTarget,
        args: &[Expr],
        mode: u8,
        _outer: &str,
    ) -> Result<Vec<Type>> {
        let locus = format!("call to {}", target.name());
        match target {
            CallTarget::Unresolved { name } => {
                Err(self.err(&locus, format!("unresolved call {name}")))
            }

            CallTarget::Op { opcode, .. } => {
                if *opcode < API_OPCODE_BASE {
                    return Err(self.err(
                        &locus,
                        format!("opcode {opcode} is a core instruction, not a callable"),
                    ));
                }
                let sig = self.db.resolve(SigKey::Opcode(*opcode)).cloned();
                match sig {
                    Some(sig) => {
                        self.check_args(&sig, args, &locus)?;
                        self.emit(*opcode, Operand::Byte(mode));
                        Ok(sig.returns.clone())
                    }
                    None => {
                        // Raw `op_<n>` form: arity comes from the call site;
                        // the result profile stays unknown, so the call is
                        // only usable as a statement.
                        for a in args {
                            self.eval(a, &locus)?;
                        }
                        self.emit(*opcode, Operand::Byte(mode));
                        Ok(Vec::new())
                    }
                }
            }

            CallTarget::Script { id, .. } => {
                let sig = self.db.resolve(SigKey::Script(*id)).cloned();
                match sig {
                    Some(sig) => {
                        self.check_args(&sig, args, &locus)?;
                        self.emit(Opcode::Invoke as u16, Operand::Int(*id as i32));
                        Ok(sig.returns.clone())
                    }
                    None => {
                        for a in args {
                            self.eval(a, &locus)?;
                        }
                        self.emit(Opcode::Invoke as u16, Operand::Int(*id as i32));
                        Ok(Vec::new())
                    }
                }
            }
        }
    }

    fn check_args(
        &mut self,
        sig: &crate::db::Signature,
        args: &[Expr],
        locus: &str,
    ) -> Result<()> {
        if args.len() != sig.params.len() {
            return Err(self.err(
                locus,
                format!("expected {} arguments, found {}", sig.params.len(), args.len()),
            ));
        }
        for (arg, (pname, pty)) in args.iter().zip(&sig.params) {
            let got = self.eval(arg, locus)?;
            if !got.compatible(*pty) {
                return Err(self.err(
                    locus,
                    format!("argument {pname}: expected {pty}, found {got}"),
                ));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Disassembly listing
    // -----------------------------------------------------------------------

    fn write_disasm(&self, sink: &mut String) {
        use std::fmt::Write;
        for (pc, (opcode, operand)) in self.insts.iter().enumerate() {
            let name = match Opcode::from_u16(*opcode) {
                Some(op) => op.mnemonic().to_string(),
                None => match self.db.resolve(SigKey::Opcode(*opcode)) {
                    Some(sig) => sig.name.clone(),
                    None => format!("op_{opcode}"),
                },
            };
            let _ = write!(sink, "{pc:5}  {name}");
            match operand {
                Operand::None => {}
                Operand::Int(v) => {
                    if Opcode::from_u16(*opcode).is_some_and(|op| op.is_branch()) {
                        let _ = write!(sink, " {v:+}");
                    } else {
                        let _ = write!(sink, " {v}");
                    }
                }
                Operand::Long(v) => {
                    let _ = write!(sink, " {v}L");
                }
                Operand::Str(s) => {
                    let _ = write!(sink, " {s:?}");
                }
                Operand::Byte(b) => {
                    if *b != 0 {
                        let _ = write!(sink, " mode={b}");
                    }
                }
                Operand::Table(cases) => {
                    let _ = write!(sink, " [");
                    for (i, c) in cases.iter().enumerate() {
                        if i > 0 {
                            let _ = write!(sink, ", ");
                        }
                        let _ = write!(sink, "{}->{:+}", c.value, c.delta);
                    }
                    let _ = write!(sink, "]");
                }
            }
            sink.push('\n');
        }
    }
}

fn collect_decls(
    stmts: &[Stmt],
    declare: &mut impl FnMut(&str, Type) -> Result<()>,
) -> Result<()> {
    for s in stmts {
        match s {
            Stmt::Decl { ty, name, .. } => declare(name, *ty)?,
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                collect_decls(then_body, declare)?;
                collect_decls(else_body, declare)?;
            }
            Stmt::While { body, .. } | Stmt::DoWhile { body, .. } => {
                collect_decls(body, declare)?;
            }
            Stmt::Switch { arms, default, .. } => {
                for arm in arms {
                    collect_decls(&arm.body, declare)?;
                }
                if let Some(d) = default {
                    collect_decls(d, declare)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn db() -> SignatureDb {
        SignatureDb::with_canonical_table()
    }

    fn compile_src(src: &str, flags: FormatFlags) -> Result<Vec<u8>> {
        let db = db();
        let (func, _) = parse(src, &db).unwrap();
        compile(&func, &db, &ScrambleMap::identity(), flags, None)
    }

    #[test]
    fn empty_void_script_is_a_single_return() {
        let bytes = compile_src("void script_5() {\n    return;\n}\n", FormatFlags::default())
            .unwrap();
        let script = cs2bin::decode_script(
            &bytes,
            5,
            &ScrambleMap::identity(),
            FormatFlags::default(),
        )
        .unwrap();
        assert_eq!(script.instructions.len(), 1);
        assert_eq!(script.instructions[0].opcode, Opcode::Return as u16);
        assert_eq!(script.instructions[0].operand, Operand::None);
    }

    #[test]
    fn while_loop_emits_backward_jump_to_condition() {
        let bytes = compile_src(
            "void script_1(int $i0) {\n    while ($i0 > 0) {\n        $i0 = $i0 - 1;\n    }\n    return;\n}\n",
            FormatFlags::default(),
        )
        .unwrap();
        let script = cs2bin::decode_script(
            &bytes,
            1,
            &ScrambleMap::identity(),
            FormatFlags::default(),
        )
        .unwrap();
        // cond: load, push, if_icmple exit / body / goto cond / return
        let ops: Vec<u16> = script.instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::LoadInt as u16,
                Opcode::PushInt as u16,
                Opcode::IfIcmpLe as u16,
                Opcode::LoadInt as u16,
                Opcode::PushInt as u16,
                Opcode::Sub as u16,
                Opcode::StoreInt as u16,
                Opcode::Goto as u16,
                Opcode::Return as u16,
            ]
        );
        assert_eq!(script.instructions[2].branch_target(), Some(8));
        assert_eq!(script.instructions[7].branch_target(), Some(0));
    }

    #[test]
    fn switch_under_disable_switches_is_unsupported() {
        let err = compile_src(
            "void script_1(int $i0) {\n    switch ($i0) {\n        case 1:\n            return;\n    }\n    return;\n}\n",
            FormatFlags {
                disable_switches: true,
                disable_longs: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedFormat { .. }), "{err}");
    }

    #[test]
    fn long_literal_under_disable_longs_is_unsupported() {
        let err = compile_src(
            "void script_1() {\n    long $l0;\n    $l0 = 5L;\n    return;\n}\n",
            FormatFlags {
                disable_switches: false,
                disable_longs: true,
            },
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedFormat { .. }), "{err}");
    }

    #[test]
    fn unresolved_call_is_a_compile_error() {
        let err = compile_src(
            "void script_1() {\n    frobnicate();\n    return;\n}\n",
            FormatFlags::default(),
        )
        .unwrap_err();
        assert!(
            matches!(&err, CoreError::Compile { locus, .. } if locus.contains("frobnicate")),
            "{err}"
        );
    }

    #[test]
    fn arity_mismatch_is_a_compile_error_with_locus() {
        let err = compile_src(
            "void script_1() {\n    sound_play(1, 2);\n    return;\n}\n",
            FormatFlags::default(),
        )
        .unwrap_err();
        match err {
            CoreError::Compile { locus, message, .. } => {
                assert!(locus.contains("sound_play"), "{locus}");
                assert!(message.contains("expected 1 arguments"), "{message}");
            }
            other => panic!("{other}"),
        }
    }

    #[test]
    fn goto_to_missing_label_fails_backpatching() {
        let err = compile_src(
            "void script_1() {\n    goto label_3;\n    return;\n}\n",
            FormatFlags::default(),
        )
        .unwrap_err();
        assert!(
            matches!(&err, CoreError::Compile { locus, .. } if locus == "back-patching"),
            "{err}"
        );
    }

    #[test]
    fn disasm_is_written_even_when_compilation_fails() {
        let db = db();
        let (func, _) = parse(
            "void script_1() {\n    sound_play(3);\n    frobnicate();\n    return;\n}\n",
            &db,
        )
        .unwrap();
        let mut listing = String::new();
        let result = compile(
            &func,
            &db,
            &ScrambleMap::identity(),
            FormatFlags::default(),
            Some(&mut listing),
        );
        assert!(result.is_err());
        assert!(listing.contains("sound_play"), "{listing}");
    }

    #[test]
    fn string_concat_flattens_to_one_join() {
        let bytes = compile_src(
            "void script_1(string $s0) {\n    $s0 = \"a\" + $s0 + \"b\";\n    return;\n}\n",
            FormatFlags::default(),
        )
        .unwrap();
        let script = cs2bin::decode_script(
            &bytes,
            1,
            &ScrambleMap::identity(),
            FormatFlags::default(),
        )
        .unwrap();
        let joins: Vec<&Instruction> = script
            .instructions
            .iter()
            .filter(|i| i.opcode == Opcode::JoinString as u16)
            .collect();
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].operand, Operand::Int(3));
    }
}
