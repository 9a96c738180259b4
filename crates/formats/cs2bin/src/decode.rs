use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::opcode::{Opcode, OperandKind, API_OPCODE_BASE};
use crate::scramble::ScrambleMap;
use crate::types::{base_kind_of_code, BaseKind};
use crate::FormatFlags;

/// One entry of a switch dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub value: i32,
    /// Instruction-index delta from the instruction after the switch.
    pub delta: i32,
}

/// Operand data for an instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// No operand.
    None,
    /// 32-bit immediate: constant, local slot, count, or branch delta.
    Int(i32),
    /// 64-bit immediate.
    Long(i64),
    /// String constant.
    Str(String),
    /// Switch case table.
    Table(Vec<SwitchCase>),
    /// Call-mode byte of an API opcode, preserved verbatim.
    Byte(u8),
}

/// A decoded instruction. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Instruction index within the script.
    pub pc: usize,
    /// Canonical opcode number (post-unscramble).
    pub opcode: u16,
    /// Raw on-disk opcode value.
    pub raw: u16,
    pub operand: Operand,
}

impl Instruction {
    /// The core opcode, if this is one.
    pub fn core(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode)
    }

    /// Absolute branch target for branch instructions.
    pub fn branch_target(&self) -> Option<i64> {
        let op = self.core()?;
        if !op.is_branch() {
            return None;
        }
        match self.operand {
            Operand::Int(delta) => Some(self.pc as i64 + 1 + delta as i64),
            _ => None,
        }
    }
}

/// A decoded script: header information plus the instruction stream.
/// Source of truth before decompilation and after compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub id: u32,
    /// Parameter type codes, declaration order.
    pub param_codes: Vec<u8>,
    /// Local int slots, including int-kind parameters.
    pub int_locals: u16,
    /// Local string slots, including string-kind parameters.
    pub string_locals: u16,
    /// Local long slots, including long-kind parameters.
    pub long_locals: u16,
    pub instructions: Vec<Instruction>,
}

impl Script {
    /// Number of parameters of the given base kind.
    pub fn param_count(&self, kind: BaseKind) -> usize {
        self.param_codes
            .iter()
            .filter(|&&c| base_kind_of_code(c) == kind)
            .count()
    }
}

/// Decode a raw script buffer.
///
/// `scramble` translates on-disk opcode values to canonical numbering;
/// `flags` mark format variants lacking switch tables or 64-bit immediates.
/// Truncated streams, unknown core opcodes, bad local counts, and
/// out-of-range branch targets fail hard; unknown API opcodes decode fine
/// (their operand width is fixed by the numbering convention) and are left
/// for the engine to flag softly.
pub fn decode_script(
    bytes: &[u8],
    id: u32,
    scramble: &ScrambleMap,
    flags: FormatFlags,
) -> Result<Script> {
    let malformed = |message: String| Error::Malformed {
        script: id,
        message,
    };

    let mut cursor = Cursor::new(bytes);

    let param_count = cursor.read_u8()? as usize;
    let mut param_codes = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        param_codes.push(cursor.read_u8()?);
    }
    let int_locals = cursor.read_u16()?;
    let string_locals = cursor.read_u16()?;
    let long_locals = cursor.read_u16()?;

    for (kind, locals) in [
        (BaseKind::Int, int_locals),
        (BaseKind::String, string_locals),
        (BaseKind::Long, long_locals),
    ] {
        let params = param_codes
            .iter()
            .filter(|&&c| base_kind_of_code(c) == kind)
            .count();
        if (locals as usize) < params {
            return Err(malformed(format!(
                "{kind:?} local count {locals} below parameter count {params}"
            )));
        }
    }
    if flags.disable_longs && long_locals > 0 {
        return Err(Error::Unsupported {
            feature: "long locals",
            pc: 0,
        });
    }

    let count = cursor.read_u32()? as usize;
    if count * 2 > cursor.remaining() {
        return Err(malformed(format!(
            "instruction count {count} exceeds buffer ({} bytes remain)",
            cursor.remaining()
        )));
    }

    let mut instructions = Vec::with_capacity(count);
    for pc in 0..count {
        let raw = cursor.read_u16()?;
        let canonical = scramble.unscramble(raw);

        let operand = match Opcode::from_u16(canonical) {
            Some(op) => {
                if op == Opcode::Switch && flags.disable_switches {
                    return Err(Error::Unsupported {
                        feature: "switch",
                        pc,
                    });
                }
                if op.needs_longs() && flags.disable_longs {
                    return Err(Error::Unsupported { feature: "long", pc });
                }
                match op.operand_kind() {
                    OperandKind::None => Operand::None,
                    OperandKind::Int => Operand::Int(cursor.read_i32()?),
                    OperandKind::Long => Operand::Long(cursor.read_i64()?),
                    OperandKind::Str => Operand::Str(cursor.read_string()?),
                    OperandKind::Table => {
                        let cases = cursor.read_u16()? as usize;
                        let mut table = Vec::with_capacity(cases);
                        for _ in 0..cases {
                            let value = cursor.read_i32()?;
                            let delta = cursor.read_i32()?;
                            table.push(SwitchCase { value, delta });
                        }
                        Operand::Table(table)
                    }
                    OperandKind::Byte => Operand::Byte(cursor.read_u8()?),
                }
            }
            None if canonical >= API_OPCODE_BASE => Operand::Byte(cursor.read_u8()?),
            None => {
                return Err(malformed(format!(
                    "unknown core opcode {canonical} at instruction {pc}"
                )));
            }
        };

        instructions.push(Instruction {
            pc,
            opcode: canonical,
            raw,
            operand,
        });
    }

    if !cursor.is_empty() {
        return Err(malformed(format!(
            "{} trailing bytes after instruction stream",
            cursor.remaining()
        )));
    }

    // Every branch and switch case must land inside the instruction range.
    for inst in &instructions {
        if let Some(target) = inst.branch_target() {
            if target < 0 || target >= count as i64 {
                return Err(malformed(format!(
                    "branch at instruction {} targets {target} (range 0..{count})",
                    inst.pc
                )));
            }
        }
        if let Operand::Table(cases) = &inst.operand {
            for case in cases {
                let target = inst.pc as i64 + 1 + case.delta as i64;
                if target < 0 || target >= count as i64 {
                    return Err(malformed(format!(
                        "switch case {} at instruction {} targets {target} (range 0..{count})",
                        case.value, inst.pc
                    )));
                }
            }
        }
    }

    Ok(Script {
        id,
        param_codes,
        int_locals,
        string_locals,
        long_locals,
        instructions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode_script;

    fn inst(pc: usize, op: Opcode, operand: Operand) -> Instruction {
        Instruction {
            pc,
            opcode: op as u16,
            raw: op as u16,
            operand,
        }
    }

    fn empty_script(instructions: Vec<Instruction>) -> Script {
        Script {
            id: 5,
            param_codes: vec![],
            int_locals: 0,
            string_locals: 0,
            long_locals: 0,
            instructions,
        }
    }

    #[test]
    fn truncated_header_is_eof() {
        let err = decode_script(&[2, b'i'], 0, &ScrambleMap::identity(), FormatFlags::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof { .. }));
    }

    #[test]
    fn local_count_below_params_is_malformed() {
        // One int parameter but zero int locals.
        let script = Script {
            id: 9,
            param_codes: vec![b'i'],
            int_locals: 0,
            string_locals: 0,
            long_locals: 0,
            instructions: vec![inst(0, Opcode::Return, Operand::None)],
        };
        let bytes = encode_script(&script, &ScrambleMap::identity(), FormatFlags::default())
            .unwrap();
        let err = decode_script(&bytes, 9, &ScrambleMap::identity(), FormatFlags::default())
            .unwrap_err();
        assert!(matches!(err, Error::Malformed { script: 9, .. }));
    }

    #[test]
    fn out_of_range_branch_is_malformed() {
        let script = empty_script(vec![
            inst(0, Opcode::Goto, Operand::Int(5)),
            inst(1, Opcode::Return, Operand::None),
        ]);
        let bytes = encode_script(&script, &ScrambleMap::identity(), FormatFlags::default())
            .unwrap();
        let err = decode_script(&bytes, 5, &ScrambleMap::identity(), FormatFlags::default())
            .unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
    }

    #[test]
    fn switch_rejected_when_disabled() {
        let script = empty_script(vec![
            inst(0, Opcode::PushInt, Operand::Int(1)),
            inst(
                1,
                Opcode::Switch,
                Operand::Table(vec![SwitchCase { value: 1, delta: 0 }]),
            ),
            inst(2, Opcode::Return, Operand::None),
        ]);
        let bytes = encode_script(&script, &ScrambleMap::identity(), FormatFlags::default())
            .unwrap();
        let flags = FormatFlags {
            disable_switches: true,
            disable_longs: false,
        };
        let err = decode_script(&bytes, 5, &ScrambleMap::identity(), flags).unwrap_err();
        assert!(matches!(err, Error::Unsupported { feature: "switch", pc: 1 }));
    }

    #[test]
    fn long_rejected_when_disabled() {
        let script = empty_script(vec![
            inst(0, Opcode::PushLong, Operand::Long(1)),
            inst(1, Opcode::PopLong, Operand::None),
            inst(2, Opcode::Return, Operand::None),
        ]);
        let bytes = encode_script(&script, &ScrambleMap::identity(), FormatFlags::default())
            .unwrap();
        let flags = FormatFlags {
            disable_switches: false,
            disable_longs: true,
        };
        let err = decode_script(&bytes, 5, &ScrambleMap::identity(), flags).unwrap_err();
        assert!(matches!(err, Error::Unsupported { feature: "long", pc: 0 }));
    }

    #[test]
    fn unknown_api_opcode_still_decodes() {
        let mut w = crate::cursor::Writer::new();
        w.write_u8(0); // params
        w.write_u16(0);
        w.write_u16(0);
        w.write_u16(0);
        w.write_u32(2);
        w.write_u16(4242); // no such descriptor anywhere
        w.write_u8(1);
        w.write_u16(Opcode::Return as u16);
        let script = decode_script(
            &w.into_bytes(),
            7,
            &ScrambleMap::identity(),
            FormatFlags::default(),
        )
        .unwrap();
        assert_eq!(script.instructions[0].opcode, 4242);
        assert_eq!(script.instructions[0].operand, Operand::Byte(1));
    }

    #[test]
    fn unknown_core_opcode_is_malformed() {
        let mut w = crate::cursor::Writer::new();
        w.write_u8(0);
        w.write_u16(0);
        w.write_u16(0);
        w.write_u16(0);
        w.write_u32(1);
        w.write_u16(77); // below API_OPCODE_BASE, not a core opcode
        let err = decode_script(
            &w.into_bytes(),
            7,
            &ScrambleMap::identity(),
            FormatFlags::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Malformed { script: 7, .. }));
    }

    #[test]
    fn scrambled_stream_decodes_to_canonical() {
        let map = ScrambleMap::from_pairs(&[(Opcode::Return as u16, 900), (900, Opcode::Return as u16)])
            .unwrap();
        let script = empty_script(vec![inst(0, Opcode::Return, Operand::None)]);
        let bytes = encode_script(&script, &map, FormatFlags::default()).unwrap();
        let back = decode_script(&bytes, 5, &map, FormatFlags::default()).unwrap();
        assert_eq!(back.instructions[0].opcode, Opcode::Return as u16);
        assert_eq!(back.instructions[0].raw, 900);
    }
}
