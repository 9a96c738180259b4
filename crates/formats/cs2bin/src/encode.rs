use crate::cursor::Writer;
use crate::error::{Error, Result};
use crate::decode::{Operand, Script};
use crate::opcode::{Opcode, OperandKind, API_OPCODE_BASE};
use crate::scramble::ScrambleMap;
use crate::FormatFlags;

/// Encode a script back into a raw buffer.
///
/// This is the inverse of `decode::decode_script`: header first, then each
/// instruction as a u16 opcode (scrambled to on-disk numbering) plus its
/// operand bytes. The same format flags are enforced as on the decode side,
/// so a buffer produced here always decodes under identical flags.
pub fn encode_script(script: &Script, scramble: &ScrambleMap, flags: FormatFlags) -> Result<Vec<u8>> {
    let malformed = |message: String| Error::Malformed {
        script: script.id,
        message,
    };

    if flags.disable_longs && script.long_locals > 0 {
        return Err(Error::Unsupported {
            feature: "long locals",
            pc: 0,
        });
    }

    let mut w = Writer::with_capacity(16 + script.instructions.len() * 6);
    w.write_u8(script.param_codes.len() as u8);
    for &code in &script.param_codes {
        w.write_u8(code);
    }
    w.write_u16(script.int_locals);
    w.write_u16(script.string_locals);
    w.write_u16(script.long_locals);
    w.write_u32(script.instructions.len() as u32);

    for inst in &script.instructions {
        let expected = match Opcode::from_u16(inst.opcode) {
            Some(op) => {
                if op == Opcode::Switch && flags.disable_switches {
                    return Err(Error::Unsupported {
                        feature: "switch",
                        pc: inst.pc,
                    });
                }
                if op.needs_longs() && flags.disable_longs {
                    return Err(Error::Unsupported {
                        feature: "long",
                        pc: inst.pc,
                    });
                }
                op.operand_kind()
            }
            None if inst.opcode >= API_OPCODE_BASE => OperandKind::Byte,
            None => {
                return Err(malformed(format!(
                    "unknown core opcode {} at instruction {}",
                    inst.opcode, inst.pc
                )));
            }
        };

        w.write_u16(scramble.scramble(inst.opcode));
        match (&inst.operand, expected) {
            (Operand::None, OperandKind::None) => {}
            (Operand::Int(v), OperandKind::Int) => w.write_i32(*v),
            (Operand::Long(v), OperandKind::Long) => w.write_i64(*v),
            (Operand::Str(s), OperandKind::Str) => w.write_string(s),
            (Operand::Table(cases), OperandKind::Table) => {
                w.write_u16(cases.len() as u16);
                for case in cases {
                    w.write_i32(case.value);
                    w.write_i32(case.delta);
                }
            }
            (Operand::Byte(v), OperandKind::Byte) => w.write_u8(*v),
            (operand, expected) => {
                return Err(malformed(format!(
                    "instruction {} carries {operand:?} but opcode {} takes {expected:?}",
                    inst.pc, inst.opcode
                )));
            }
        }
    }

    Ok(w.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode_script, Instruction, SwitchCase};

    fn inst(pc: usize, opcode: u16, operand: Operand) -> Instruction {
        Instruction {
            pc,
            opcode,
            raw: opcode,
            operand,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let script = Script {
            id: 12,
            param_codes: vec![b'i', b's'],
            int_locals: 2,
            string_locals: 1,
            long_locals: 0,
            instructions: vec![
                inst(0, Opcode::PushInt as u16, Operand::Int(41)),
                inst(1, Opcode::PushString as u16, Operand::Str("hi".into())),
                inst(2, 101, Operand::Byte(0)),
                inst(3, Opcode::IfIcmpLt as u16, Operand::Int(1)),
                inst(4, Opcode::PushInt as u16, Operand::Int(0)),
                inst(
                    5,
                    Opcode::Switch as u16,
                    Operand::Table(vec![
                        SwitchCase { value: 1, delta: 0 },
                        SwitchCase { value: 2, delta: 0 },
                    ]),
                ),
                inst(6, Opcode::Return as u16, Operand::None),
            ],
        };
        let flags = FormatFlags::default();
        let bytes = encode_script(&script, &ScrambleMap::identity(), flags).unwrap();
        let back = decode_script(&bytes, 12, &ScrambleMap::identity(), flags).unwrap();
        assert_eq!(back, script);
    }

    #[test]
    fn operand_mismatch_is_malformed() {
        let script = Script {
            id: 1,
            param_codes: vec![],
            int_locals: 0,
            string_locals: 0,
            long_locals: 0,
            instructions: vec![inst(0, Opcode::PushInt as u16, Operand::Str("x".into()))],
        };
        let err = encode_script(&script, &ScrambleMap::identity(), FormatFlags::default())
            .unwrap_err();
        assert!(matches!(err, Error::Malformed { script: 1, .. }));
    }

    #[test]
    fn long_emit_rejected_when_disabled() {
        let script = Script {
            id: 1,
            param_codes: vec![],
            int_locals: 0,
            string_locals: 0,
            long_locals: 0,
            instructions: vec![inst(0, Opcode::PushLong as u16, Operand::Long(7))],
        };
        let flags = FormatFlags {
            disable_switches: false,
            disable_longs: true,
        };
        let err = encode_script(&script, &ScrambleMap::identity(), flags).unwrap_err();
        assert!(matches!(err, Error::Unsupported { feature: "long", pc: 0 }));
    }
}
