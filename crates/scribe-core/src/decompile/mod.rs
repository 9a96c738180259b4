//! Control-flow reconstruction: bytecode → structured source form.
//!
//! Two phases. Phase A simulates the three value stacks over the linear
//! instruction stream, folding pushes into expression trees and producing a
//! flat list of pc-tagged statements and raw branches. Phase B
//! (`structure`) classifies branch shapes over instruction-index space into
//! `if`/`while`/`do-while`/`switch`, preserving anything unrecognized as
//! explicit goto/label pairs.
//!
//! Reconstruction never aborts: soft findings (unknown opcodes, stack
//! imbalance, goto fallback) degrade the output and surface as diagnostics.

mod optimize;
mod structure;

pub use optimize::optimize;

use std::collections::{HashMap, HashSet};

use cs2bin::{BaseKind, Opcode, Operand, Script};

use crate::ast::{BinOp, CallTarget, Expr, ScriptFunction, Stmt};
use crate::db::{SigKey, Signature, SignatureDb};
use crate::error::Diagnostic;
use crate::ty::Type;

/// A stack slot during simulation: the expression that produced the value,
/// its static type, and the pc of the earliest instruction folded into it.
#[derive(Debug, Clone)]
struct Value {
    expr: Expr,
    ty: Type,
    first_pc: usize,
}

/// A linearized item: a finished statement or a raw control transfer,
/// tagged with the pc range it covers.
#[derive(Debug, Clone)]
pub(crate) struct Item {
    /// Earliest pc folded into this item.
    pub start_pc: usize,
    /// Pc of the instruction that completed this item.
    pub pc: usize,
    pub kind: ItemKind,
}

#[derive(Debug, Clone)]
pub(crate) enum ItemKind {
    Stmt(Stmt),
    /// `cond: None` is an unconditional jump; `Some` jumps when the
    /// condition is true. Targets are absolute instruction indices.
    Branch { cond: Option<Expr>, target: usize },
    /// Switch dispatch; falls through when no case matches.
    Dispatch { value: Expr, cases: Vec<(i32, usize)> },
}

struct Simulator<'a> {
    script: &'a Script,
    db: &'a SignatureDb,
    ints: Vec<Value>,
    strings: Vec<Value>,
    longs: Vec<Value>,
    items: Vec<Item>,
    diags: Vec<Diagnostic>,
    local_types: HashMap<String, Type>,
    temp_decls: Vec<(String, Type)>,
    return_types: Option<Vec<Type>>,
}

/// Slot-based local name: `$i3`, `$s0`, `$l1`. Parameters occupy the lowest
/// slots of their kind, so the name is stable across decompile/recompile.
fn local_name(kind: BaseKind, slot: i32) -> String {
    match kind {
        BaseKind::Int => format!("$i{slot}"),
        BaseKind::String => format!("$s{slot}"),
        BaseKind::Long => format!("$l{slot}"),
    }
}

impl<'a> Simulator<'a> {
    fn new(script: &'a Script, db: &'a SignatureDb) -> Self {
        let mut local_types = HashMap::new();
        let mut counters = [0i32; 3];
        for &code in &script.param_codes {
            let ty = Type::from_code(code);
            let idx = match ty.base() {
                BaseKind::Int => 0,
                BaseKind::String => 1,
                BaseKind::Long => 2,
            };
            local_types.insert(local_name(ty.base(), counters[idx]), ty);
            counters[idx] += 1;
        }

        Simulator {
            script,
            db,
            ints: Vec::new(),
            strings: Vec::new(),
            longs: Vec::new(),
            items: Vec::new(),
            diags: Vec::new(),
            local_types,
            temp_decls: Vec::new(),
            return_types: None,
        }
    }

    fn stack_mut(&mut self, kind: BaseKind) -> &mut Vec<Value> {
        match kind {
            BaseKind::Int => &mut self.ints,
            BaseKind::String => &mut self.strings,
            BaseKind::Long => &mut self.longs,
        }
    }

    fn push(&mut self, kind: BaseKind, value: Value) {
        self.stack_mut(kind).push(value);
    }

    fn pop(&mut self, kind: BaseKind, pc: usize) -> Value {
        match self.stack_mut(kind).pop() {
            Some(v) => v,
            None => {
                self.diags.push(Diagnostic::StackImbalance { pc });
                let expr = match kind {
                    BaseKind::Int => Expr::int(0),
                    BaseKind::String => Expr::StringLit(String::new()),
                    BaseKind::Long => Expr::LongLit(0),
                };
                Value {
                    expr,
                    ty: Type::of_base(kind),
                    first_pc: pc,
                }
            }
        }
    }

    fn local_type(&self, name: &str) -> Type {
        self.local_types.get(name).copied().unwrap_or_else(|| {
            Type::of_base(match name.as_bytes().get(1) {
                Some(b's') => BaseKind::String,
                Some(b'l') => BaseKind::Long,
                _ => BaseKind::Int,
            })
        })
    }

    fn emit(&mut self, start_pc: usize, pc: usize, kind: ItemKind) {
        self.items.push(Item { start_pc, pc, kind });
    }

    fn emit_stmt(&mut self, start_pc: usize, pc: usize, stmt: Stmt) {
        self.emit(start_pc, pc, ItemKind::Stmt(stmt));
    }

    /// At a branch target, any leftover values are flushed into synthetic
    /// temporaries so the fallthrough path stays correct. Compiled code
    /// always has empty stacks at statement boundaries; hitting this means
    /// foreign bytecode, so it is flagged.
    fn flush_at_label(&mut self, pc: usize) {
        if self.ints.is_empty() && self.strings.is_empty() && self.longs.is_empty() {
            return;
        }
        self.diags.push(Diagnostic::StackImbalance { pc });
        for kind in [BaseKind::Int, BaseKind::String, BaseKind::Long] {
            let values = std::mem::take(self.stack_mut(kind));
            let mut refs = Vec::with_capacity(values.len());
            for v in values {
                let name = format!("$tmp{}", self.temp_decls.len());
                self.temp_decls.push((name.clone(), v.ty));
                let first_pc = v.first_pc;
                self.emit_stmt(
                    first_pc,
                    pc,
                    Stmt::Assign {
                        targets: vec![name.clone()],
                        value: v.expr,
                    },
                );
                refs.push(Value {
                    expr: Expr::Local(name),
                    ty: v.ty,
                    first_pc,
                });
            }
            *self.stack_mut(kind) = refs;
        }
    }

    /// Adapt an argument or return expression to the semantic type of its
    /// position: callbacks render as `&script_<id>`, -1 handles as `null`,
    /// color ints in hex, boolean ints as literals.
    fn adapt(&self, mut expr: Expr, ty: Type) -> Expr {
        match (&mut expr, ty) {
            (Expr::IntLit { value: -1, .. }, Type::Callback) => Expr::Null,
            (Expr::IntLit { value, .. }, Type::Callback) if *value >= 0 => {
                Expr::ScriptRef(*value as u32)
            }
            (Expr::IntLit { value: 0, .. }, Type::Boolean) => Expr::BoolLit(false),
            (Expr::IntLit { value: 1, .. }, Type::Boolean) => Expr::BoolLit(true),
            (Expr::IntLit { hex, .. }, Type::Color) => {
                *hex = true;
                expr
            }
            (Expr::IntLit { value: -1, .. }, ty)
                if ty.base() == BaseKind::Int
                    && !matches!(ty, Type::Int | Type::Boolean | Type::Char | Type::Unknown) =>
            {
                Expr::Null
            }
            _ => expr,
        }
    }

    /// Pop call arguments per signature (right-to-left), returning them in
    /// declaration order along with the earliest pc they cover.
    fn pop_args(&mut self, sig: &Signature, pc: usize) -> (Vec<Expr>, usize) {
        let mut args = Vec::with_capacity(sig.params.len());
        let mut start_pc = pc;
        for (_, ty) in sig.params.iter().rev() {
            let v = self.pop(ty.base(), pc);
            start_pc = start_pc.min(v.first_pc);
            args.push(self.adapt(v.expr, *ty));
        }
        args.reverse();
        (args, start_pc)
    }

    fn sim_call(&mut self, target: CallTarget, sig: Option<&Signature>, mode: u8, pc: usize) {
        let Some(sig) = sig else {
            self.emit_stmt(
                pc,
                pc,
                Stmt::Expr(Expr::Call {
                    target,
                    args: Vec::new(),
                    mode,
                }),
            );
            return;
        };

        let (args, start_pc) = self.pop_args(sig, pc);
        let call = Expr::Call { target, args, mode };

        match sig.returns.len() {
            0 => self.emit_stmt(start_pc, pc, Stmt::Expr(call)),
            1 => {
                let ty = sig.returns[0];
                self.push(
                    ty.base(),
                    Value {
                        expr: call,
                        ty,
                        first_pc: start_pc,
                    },
                );
            }
            _ => {
                // Multiple simultaneous returns materialize as temporaries
                // bound by one multi-assignment.
                let mut targets = Vec::with_capacity(sig.returns.len());
                for &ty in &sig.returns {
                    let name = format!("$tmp{}", self.temp_decls.len());
                    self.temp_decls.push((name.clone(), ty));
                    targets.push(name);
                }
                self.emit_stmt(
                    start_pc,
                    pc,
                    Stmt::Assign {
                        targets: targets.clone(),
                        value: call,
                    },
                );
                for (name, &ty) in targets.iter().zip(&sig.returns) {
                    self.push(
                        ty.base(),
                        Value {
                            expr: Expr::Local(name.clone()),
                            ty,
                            first_pc: pc,
                        },
                    );
                }
            }
        }
    }

    /// Build the raw branch condition (taken-if-true) for a comparison
    /// branch, collapsing the `x == 1` idiom for boolean-typed `x`.
    fn branch_cond(&mut self, cmp: BinOp, kind: BaseKind, pc: usize) -> (Expr, usize) {
        let rhs = self.pop(kind, pc);
        let lhs = self.pop(kind, pc);
        let start_pc = lhs.first_pc.min(rhs.first_pc).min(pc);

        if kind == BaseKind::Int
            && lhs.ty == Type::Boolean
            && matches!(rhs.expr, Expr::IntLit { value: 1, .. })
        {
            let cond = match cmp {
                BinOp::Eq => lhs.expr,
                BinOp::Ne => Expr::Not(Box::new(lhs.expr)),
                _ => Expr::Binary {
                    op: cmp,
                    lhs: Box::new(lhs.expr),
                    rhs: Box::new(rhs.expr),
                },
            };
            return (cond, start_pc);
        }

        (
            Expr::Binary {
                op: cmp,
                lhs: Box::new(lhs.expr),
                rhs: Box::new(rhs.expr),
            },
            start_pc,
        )
    }

    fn sim_return(&mut self, pc: usize) {
        let declared = self
            .db
            .resolve(SigKey::Script(self.script.id))
            .map(|sig| sig.returns.clone());

        let mut values = Vec::new();
        for kind in [BaseKind::Int, BaseKind::String, BaseKind::Long] {
            values.append(&mut std::mem::take(self.stack_mut(kind)));
        }

        let types: Vec<Type> = match &declared {
            Some(declared) if declared.len() == values.len() => declared.clone(),
            _ => values.iter().map(|v| v.ty).collect(),
        };
        if self.return_types.is_none() {
            self.return_types = Some(types.clone());
        }

        let start_pc = values.iter().map(|v| v.first_pc).min().unwrap_or(pc);
        let exprs = values
            .into_iter()
            .zip(types)
            .map(|(v, ty)| self.adapt(v.expr, ty))
            .collect();
        self.emit_stmt(start_pc, pc, Stmt::Return(exprs));
    }

    fn run(&mut self) {
        let script = self.script;
        // Every branch or case target is a statement boundary.
        let mut label_pcs = HashSet::new();
        for inst in &script.instructions {
            if let Some(t) = inst.branch_target() {
                label_pcs.insert(t as usize);
            }
            if let Operand::Table(cases) = &inst.operand {
                for case in cases {
                    label_pcs.insert((inst.pc as i64 + 1 + case.delta as i64) as usize);
                }
            }
        }

        for inst in &script.instructions {
            let pc = inst.pc;
            if label_pcs.contains(&pc) {
                self.flush_at_label(pc);
            }

            let Some(op) = inst.core() else {
                let name = match self.db.resolve(SigKey::Opcode(inst.opcode)) {
                    Some(sig) => sig.name.clone(),
                    None => {
                        self.diags.push(Diagnostic::UnknownOpcode {
                            opcode: inst.opcode,
                            pc,
                        });
                        format!("op_{}", inst.opcode)
                    }
                };
                let mode = match inst.operand {
                    Operand::Byte(b) => b,
                    _ => 0,
                };
                let target = CallTarget::Op {
                    opcode: inst.opcode,
                    name,
                };
                let sig = self.db.resolve(SigKey::Opcode(inst.opcode)).cloned();
                self.sim_call(target, sig.as_ref(), mode, pc);
                continue;
            };

            let int_operand = match inst.operand {
                Operand::Int(v) => v,
                _ => 0,
            };

            match op {
                Opcode::PushInt => self.push(
                    BaseKind::Int,
                    Value {
                        expr: Expr::int(int_operand),
                        ty: Type::Int,
                        first_pc: pc,
                    },
                ),
                Opcode::PushString => {
                    let s = match &inst.operand {
                        Operand::Str(s) => s.clone(),
                        _ => String::new(),
                    };
                    self.push(
                        BaseKind::String,
                        Value {
                            expr: Expr::StringLit(s),
                            ty: Type::String,
                            first_pc: pc,
                        },
                    );
                }
                Opcode::PushLong => {
                    let v = match inst.operand {
                        Operand::Long(v) => v,
                        _ => 0,
                    };
                    self.push(
                        BaseKind::Long,
                        Value {
                            expr: Expr::LongLit(v),
                            ty: Type::Long,
                            first_pc: pc,
                        },
                    );
                }
                Opcode::LoadInt | Opcode::LoadString | Opcode::LoadLong => {
                    let kind = match op {
                        Opcode::LoadInt => BaseKind::Int,
                        Opcode::LoadString => BaseKind::String,
                        _ => BaseKind::Long,
                    };
                    let name = local_name(kind, int_operand);
                    let ty = self.local_type(&name);
                    self.push(
                        kind,
                        Value {
                            expr: Expr::Local(name),
                            ty,
                            first_pc: pc,
                        },
                    );
                }
                Opcode::StoreInt | Opcode::StoreString | Opcode::StoreLong => {
                    let kind = match op {
                        Opcode::StoreInt => BaseKind::Int,
                        Opcode::StoreString => BaseKind::String,
                        _ => BaseKind::Long,
                    };
                    let name = local_name(kind, int_operand);
                    let v = self.pop(kind, pc);
                    let ty = self.local_type(&name);
                    let value = self.adapt(v.expr, ty);
                    self.emit_stmt(
                        v.first_pc.min(pc),
                        pc,
                        Stmt::Assign {
                            targets: vec![name],
                            value,
                        },
                    );
                }
                Opcode::PopInt | Opcode::PopString | Opcode::PopLong => {
                    let kind = match op {
                        Opcode::PopInt => BaseKind::Int,
                        Opcode::PopString => BaseKind::String,
                        _ => BaseKind::Long,
                    };
                    let v = self.pop(kind, pc);
                    if v.expr.has_side_effects() {
                        self.emit_stmt(v.first_pc, pc, Stmt::Expr(v.expr));
                    }
                }
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                    let bin = match op {
                        Opcode::Add => BinOp::Add,
                        Opcode::Sub => BinOp::Sub,
                        Opcode::Mul => BinOp::Mul,
                        Opcode::Div => BinOp::Div,
                        _ => BinOp::Mod,
                    };
                    let rhs = self.pop(BaseKind::Int, pc);
                    let lhs = self.pop(BaseKind::Int, pc);
                    let first_pc = lhs.first_pc.min(rhs.first_pc);
                    self.push(
                        BaseKind::Int,
                        Value {
                            expr: Expr::Binary {
                                op: bin,
                                lhs: Box::new(lhs.expr),
                                rhs: Box::new(rhs.expr),
                            },
                            ty: Type::Int,
                            first_pc,
                        },
                    );
                }
                Opcode::JoinString => {
                    let count = int_operand.max(1) as usize;
                    let mut parts = Vec::with_capacity(count);
                    for _ in 0..count {
                        parts.push(self.pop(BaseKind::String, pc));
                    }
                    parts.reverse();
                    let first_pc = parts.iter().map(|v| v.first_pc).min().unwrap_or(pc);
                    let joined = parts
                        .into_iter()
                        .map(|v| v.expr)
                        .reduce(|lhs, rhs| Expr::Binary {
                            op: BinOp::Add,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        })
                        .unwrap_or_else(|| Expr::StringLit(String::new()));
                    self.push(
                        BaseKind::String,
                        Value {
                            expr: joined,
                            ty: Type::String,
                            first_pc,
                        },
                    );
                }
                Opcode::Goto => {
                    let target = (pc as i64 + 1 + int_operand as i64) as usize;
                    self.emit(pc, pc, ItemKind::Branch { cond: None, target });
                }
                Opcode::IfIcmpEq
                | Opcode::IfIcmpNe
                | Opcode::IfIcmpLt
                | Opcode::IfIcmpGt
                | Opcode::IfIcmpLe
                | Opcode::IfIcmpGe
                | Opcode::IfLcmpEq
                | Opcode::IfLcmpNe
                | Opcode::IfLcmpLt
                | Opcode::IfLcmpGt => {
                    let (cmp, kind) = match op {
                        Opcode::IfIcmpEq => (BinOp::Eq, BaseKind::Int),
                        Opcode::IfIcmpNe => (BinOp::Ne, BaseKind::Int),
                        Opcode::IfIcmpLt => (BinOp::Lt, BaseKind::Int),
                        Opcode::IfIcmpGt => (BinOp::Gt, BaseKind::Int),
                        Opcode::IfIcmpLe => (BinOp::Le, BaseKind::Int),
                        Opcode::IfIcmpGe => (BinOp::Ge, BaseKind::Int),
                        Opcode::IfLcmpEq => (BinOp::Eq, BaseKind::Long),
                        Opcode::IfLcmpNe => (BinOp::Ne, BaseKind::Long),
                        Opcode::IfLcmpLt => (BinOp::Lt, BaseKind::Long),
                        _ => (BinOp::Gt, BaseKind::Long),
                    };
                    let (cond, start_pc) = self.branch_cond(cmp, kind, pc);
                    let target = (pc as i64 + 1 + int_operand as i64) as usize;
                    self.emit(
                        start_pc,
                        pc,
                        ItemKind::Branch {
                            cond: Some(cond),
                            target,
                        },
                    );
                }
                Opcode::Switch => {
                    let cases = match &inst.operand {
                        Operand::Table(table) => table
                            .iter()
                            .map(|c| (c.value, (pc as i64 + 1 + c.delta as i64) as usize))
                            .collect(),
                        _ => Vec::new(),
                    };
                    let v = self.pop(BaseKind::Int, pc);
                    self.emit(
                        v.first_pc,
                        pc,
                        ItemKind::Dispatch {
                            value: v.expr,
                            cases,
                        },
                    );
                }
                Opcode::Return => self.sim_return(pc),
                Opcode::Invoke => {
                    let id = int_operand as u32;
                    let sig = self.db.resolve(SigKey::Script(id)).cloned();
                    if sig.is_none() {
                        self.diags.push(Diagnostic::UnknownScript { id, pc });
                    }
                    let target = CallTarget::Script {
                        id,
                        name: self.db.script_name(id),
                    };
                    self.sim_call(target, sig.as_ref(), 0, pc);
                }
            }
        }
    }
}

/// Fold `branch-if-c over one instruction; goto X` back into a single
/// `branch-if-!c to X`. The pair is how comparisons without a direct
/// branch opcode (long `<=`/`>=`) lower, so folding it keeps the branch
/// topology of a decompile/recompile cycle stable.
fn merge_skip_jumps(items: &mut Vec<Item>) {
    let mut target_pcs = HashSet::new();
    for item in items.iter() {
        match &item.kind {
            ItemKind::Branch { target, .. } => {
                target_pcs.insert(*target);
            }
            ItemKind::Dispatch { cases, .. } => {
                for &(_, t) in cases {
                    target_pcs.insert(t);
                }
            }
            ItemKind::Stmt(_) => {}
        }
    }

    let mut out = Vec::with_capacity(items.len());
    let mut i = 0;
    while i < items.len() {
        if i + 1 < items.len() {
            if let (
                ItemKind::Branch {
                    cond: Some(c),
                    target,
                },
                ItemKind::Branch {
                    cond: None,
                    target: jump_target,
                },
            ) = (&items[i].kind, &items[i + 1].kind)
            {
                let goto_pc = items[i + 1].pc;
                if *target == goto_pc + 1 && !target_pcs.contains(&goto_pc) {
                    out.push(Item {
                        start_pc: items[i].start_pc,
                        pc: goto_pc,
                        kind: ItemKind::Branch {
                            cond: Some(structure::invert(c.clone())),
                            target: *jump_target,
                        },
                    });
                    i += 2;
                    continue;
                }
            }
        }
        out.push(items[i].clone());
        i += 1;
    }
    *items = out;
}

/// Decompile a decoded script into source form.
///
/// Always produces a function; reconstruction failures degrade regions to
/// goto/label form and are reported in the returned diagnostics.
pub fn decompile(script: &Script, db: &SignatureDb) -> (ScriptFunction, Vec<Diagnostic>) {
    let mut sim = Simulator::new(script, db);
    sim.run();

    let Simulator {
        mut items,
        mut diags,
        temp_decls,
        return_types,
        ..
    } = sim;

    merge_skip_jumps(&mut items);
    let body = structure::structure(&items, &mut diags);

    // Parameters: lowest slots of each kind, declaration order.
    let mut counters = [0i32; 3];
    let mut params = Vec::with_capacity(script.param_codes.len());
    for &code in &script.param_codes {
        let ty = Type::from_code(code);
        let idx = match ty.base() {
            BaseKind::Int => 0,
            BaseKind::String => 1,
            BaseKind::Long => 2,
        };
        params.push((local_name(ty.base(), counters[idx]), ty));
        counters[idx] += 1;
    }

    // Declarations for the local slots beyond the parameters, then for the
    // synthetic temporaries phase A materialized.
    let mut decls = Vec::new();
    for (kind, count, used) in [
        (BaseKind::Int, script.int_locals, counters[0]),
        (BaseKind::String, script.string_locals, counters[1]),
        (BaseKind::Long, script.long_locals, counters[2]),
    ] {
        for slot in used..count as i32 {
            decls.push(Stmt::Decl {
                ty: Type::of_base(kind),
                name: local_name(kind, slot),
                init: None,
            });
        }
    }
    for (name, ty) in temp_decls {
        decls.push(Stmt::Decl {
            ty,
            name,
            init: None,
        });
    }
    decls.extend(body);

    let returns = match db.resolve(SigKey::Script(script.id)) {
        Some(sig) => sig.returns.clone(),
        None => return_types.unwrap_or_default(),
    };

    let func = ScriptFunction {
        id: Some(script.id),
        name: db.script_name(script.id),
        params,
        returns,
        body: decls,
    };
    (func, diags)
}
