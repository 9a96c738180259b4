//! Structured source form of a script.
//!
//! One `ScriptFunction` is what the decompiler produces, the parser
//! re-produces from edited text, and the compiler lowers back to bytecode.
//! The statement set mirrors what the bytecode can express structurally;
//! anything the decompiler cannot classify is preserved as `Goto`/`Label`
//! pairs rather than dropped.

use serde::{Deserialize, Serialize};

use crate::ty::Type;

/// Binary operators. Arithmetic operates on ints; `Add` doubles as string
/// concatenation; the comparison group is only valid in conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge
        )
    }

    /// Inverse of a comparison (Eq ↔ Ne, Lt ↔ Ge, ...).
    pub fn inverse(self) -> Option<BinOp> {
        match self {
            BinOp::Eq => Some(BinOp::Ne),
            BinOp::Ne => Some(BinOp::Eq),
            BinOp::Lt => Some(BinOp::Ge),
            BinOp::Ge => Some(BinOp::Lt),
            BinOp::Gt => Some(BinOp::Le),
            BinOp::Le => Some(BinOp::Gt),
            _ => None,
        }
    }
}

/// What a call resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallTarget {
    /// A named API opcode (or a raw `op_<n>` form for opcodes the database
    /// does not know).
    Op { opcode: u16, name: String },
    /// Another script, by id.
    Script { id: u32, name: String },
    /// A name the database could not resolve. Accepted by the parser to
    /// support iterative editing; rejected by the compiler.
    Unresolved { name: String },
}

impl CallTarget {
    pub fn name(&self) -> &str {
        match self {
            CallTarget::Op { name, .. } => name,
            CallTarget::Script { name, .. } => name,
            CallTarget::Unresolved { name } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Int literal; `hex` is a formatting hint (color values).
    IntLit { value: i32, hex: bool },
    LongLit(i64),
    StringLit(String),
    BoolLit(bool),
    /// The null handle, -1 on the wire.
    Null,
    /// A `$`-prefixed local or parameter reference.
    Local(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Call {
        target: CallTarget,
        args: Vec<Expr>,
        /// Call-mode byte of an API opcode (`.mnemonic(...)` form when
        /// nonzero). Always 0 for script calls.
        mode: u8,
    },
    /// `&script_<id>`, a script reference for callback registration.
    ScriptRef(u32),
}

impl Expr {
    pub fn int(value: i32) -> Expr {
        Expr::IntLit { value, hex: false }
    }

    /// Whether evaluating this expression can have an observable effect.
    pub fn has_side_effects(&self) -> bool {
        match self {
            Expr::Call { .. } => true,
            Expr::Binary { lhs, rhs, .. } | Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                lhs.has_side_effects() || rhs.has_side_effects()
            }
            Expr::Not(inner) => inner.has_side_effects(),
            _ => false,
        }
    }

    /// Count syntactic references to a local in this expression.
    pub fn count_local(&self, name: &str) -> usize {
        match self {
            Expr::Local(n) => usize::from(n == name),
            Expr::Binary { lhs, rhs, .. } | Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                lhs.count_local(name) + rhs.count_local(name)
            }
            Expr::Not(inner) => inner.count_local(name),
            Expr::Call { args, .. } => args.iter().map(|a| a.count_local(name)).sum(),
            _ => 0,
        }
    }
}

/// One arm of a switch: the values that dispatch to it and its body.
/// Arms never fall through; each lowers to a jump to the join point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchArm {
    pub values: Vec<i32>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// Typed local declaration, optionally initialized.
    Decl {
        ty: Type,
        name: String,
        init: Option<Expr>,
    },
    /// `$a = e;` or the multi-target `$a, $b = call();` form for calls
    /// with several simultaneous return values.
    Assign { targets: Vec<String>, value: Expr },
    Expr(Expr),
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    While { cond: Expr, body: Vec<Stmt> },
    DoWhile { body: Vec<Stmt>, cond: Expr },
    Switch {
        value: Expr,
        arms: Vec<SwitchArm>,
        default: Option<Vec<Stmt>>,
    },
    Return(Vec<Expr>),
    /// Fallback form for unclassified control flow.
    Label(usize),
    Goto(usize),
}

/// A script in source form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptFunction {
    /// Numeric id, when known (`script_<id>` names carry it; a database
    /// alias resolves to it; otherwise compilation fails).
    pub id: Option<u32>,
    pub name: String,
    pub params: Vec<(String, Type)>,
    pub returns: Vec<Type>,
    pub body: Vec<Stmt>,
}
