use serde::{Deserialize, Serialize};

/// First canonical number reserved for named API call opcodes.
///
/// Everything below this is a core stack-machine opcode and must be listed
/// in [`Opcode`]; everything at or above it is an API call carrying a single
/// mode byte as its operand. The numbering convention is what lets the
/// decoder skip over API opcodes it has never seen.
pub const API_OPCODE_BASE: u16 = 100;

/// Core opcodes of the CS2 stack machine (canonical numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Opcode {
    // Constants
    PushInt = 0,
    PushString = 1,
    PushLong = 2,

    // Locals
    LoadInt = 3,
    StoreInt = 4,
    LoadString = 5,
    StoreString = 6,
    LoadLong = 7,
    StoreLong = 8,

    // Stack
    PopInt = 9,
    PopString = 10,
    PopLong = 11,

    // Control flow (operand = instruction-index delta from the next pc)
    Goto = 12,
    IfIcmpEq = 13,
    IfIcmpNe = 14,
    IfIcmpLt = 15,
    IfIcmpGt = 16,
    IfIcmpLe = 17,
    IfIcmpGe = 18,
    Switch = 19,
    Return = 20,

    // Int arithmetic
    Add = 21,
    Sub = 22,
    Mul = 23,
    Div = 24,
    Mod = 25,

    // Strings
    JoinString = 26,

    // Long comparison branches
    IfLcmpEq = 27,
    IfLcmpNe = 28,
    IfLcmpLt = 29,
    IfLcmpGt = 30,

    // Script-to-script call
    Invoke = 31,
}

/// Operand encoding of an instruction, determined by its canonical opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operand bytes.
    None,
    /// 32-bit signed immediate (constant, local slot, or branch delta).
    Int,
    /// 64-bit signed immediate.
    Long,
    /// Length-prefixed UTF-8 string.
    Str,
    /// Switch case table: u16 count, then count × (i32 value, i32 delta).
    Table,
    /// Single call-mode byte (every API opcode).
    Byte,
}

impl Opcode {
    /// Decode a canonical core opcode number.
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::PushInt),
            1 => Some(Self::PushString),
            2 => Some(Self::PushLong),
            3 => Some(Self::LoadInt),
            4 => Some(Self::StoreInt),
            5 => Some(Self::LoadString),
            6 => Some(Self::StoreString),
            7 => Some(Self::LoadLong),
            8 => Some(Self::StoreLong),
            9 => Some(Self::PopInt),
            10 => Some(Self::PopString),
            11 => Some(Self::PopLong),
            12 => Some(Self::Goto),
            13 => Some(Self::IfIcmpEq),
            14 => Some(Self::IfIcmpNe),
            15 => Some(Self::IfIcmpLt),
            16 => Some(Self::IfIcmpGt),
            17 => Some(Self::IfIcmpLe),
            18 => Some(Self::IfIcmpGe),
            19 => Some(Self::Switch),
            20 => Some(Self::Return),
            21 => Some(Self::Add),
            22 => Some(Self::Sub),
            23 => Some(Self::Mul),
            24 => Some(Self::Div),
            25 => Some(Self::Mod),
            26 => Some(Self::JoinString),
            27 => Some(Self::IfLcmpEq),
            28 => Some(Self::IfLcmpNe),
            29 => Some(Self::IfLcmpLt),
            30 => Some(Self::IfLcmpGt),
            31 => Some(Self::Invoke),
            _ => None,
        }
    }

    /// Canonical mnemonic, as used in source text and signature exports.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::PushInt => "push_int",
            Self::PushString => "push_string",
            Self::PushLong => "push_long",
            Self::LoadInt => "load_int",
            Self::StoreInt => "store_int",
            Self::LoadString => "load_string",
            Self::StoreString => "store_string",
            Self::LoadLong => "load_long",
            Self::StoreLong => "store_long",
            Self::PopInt => "pop_int",
            Self::PopString => "pop_string",
            Self::PopLong => "pop_long",
            Self::Goto => "goto",
            Self::IfIcmpEq => "if_icmpeq",
            Self::IfIcmpNe => "if_icmpne",
            Self::IfIcmpLt => "if_icmplt",
            Self::IfIcmpGt => "if_icmpgt",
            Self::IfIcmpLe => "if_icmple",
            Self::IfIcmpGe => "if_icmpge",
            Self::Switch => "switch",
            Self::Return => "return",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Mod => "mod",
            Self::JoinString => "join_string",
            Self::IfLcmpEq => "if_lcmpeq",
            Self::IfLcmpNe => "if_lcmpne",
            Self::IfLcmpLt => "if_lcmplt",
            Self::IfLcmpGt => "if_lcmpgt",
            Self::Invoke => "invoke",
        }
    }

    /// What operand bytes this opcode carries on the wire.
    pub fn operand_kind(self) -> OperandKind {
        match self {
            Self::PushString => OperandKind::Str,
            Self::PushLong => OperandKind::Long,
            Self::Switch => OperandKind::Table,
            Self::PushInt
            | Self::LoadInt
            | Self::StoreInt
            | Self::LoadString
            | Self::StoreString
            | Self::LoadLong
            | Self::StoreLong
            | Self::Goto
            | Self::IfIcmpEq
            | Self::IfIcmpNe
            | Self::IfIcmpLt
            | Self::IfIcmpGt
            | Self::IfIcmpLe
            | Self::IfIcmpGe
            | Self::JoinString
            | Self::IfLcmpEq
            | Self::IfLcmpNe
            | Self::IfLcmpLt
            | Self::IfLcmpGt
            | Self::Invoke => OperandKind::Int,
            Self::PopInt
            | Self::PopString
            | Self::PopLong
            | Self::Return
            | Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Mod => OperandKind::None,
        }
    }

    /// Whether the operand is an instruction-index branch delta.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Self::Goto
                | Self::IfIcmpEq
                | Self::IfIcmpNe
                | Self::IfIcmpLt
                | Self::IfIcmpGt
                | Self::IfIcmpLe
                | Self::IfIcmpGe
                | Self::IfLcmpEq
                | Self::IfLcmpNe
                | Self::IfLcmpLt
                | Self::IfLcmpGt
        )
    }

    /// Whether this opcode only exists in format variants with longs.
    pub fn needs_longs(self) -> bool {
        matches!(
            self,
            Self::PushLong
                | Self::LoadLong
                | Self::StoreLong
                | Self::PopLong
                | Self::IfLcmpEq
                | Self::IfLcmpNe
                | Self::IfLcmpLt
                | Self::IfLcmpGt
        )
    }

    /// All core opcodes, in canonical order.
    pub fn all() -> impl Iterator<Item = Opcode> {
        (0..API_OPCODE_BASE).filter_map(Opcode::from_u16)
    }
}
