//! End-to-end properties of the decompile/print/parse/compile cycle.

use std::collections::BTreeMap;

use cs2bin::{
    decode_script, encode_script, FormatFlags, Instruction, Opcode, Operand, ScrambleMap, Script,
    API_OPCODE_BASE,
};
use scribe_core::error::Diagnostic;
use scribe_core::{CoreError, Session};

fn session() -> Session {
    Session::unscrambled(FormatFlags::default())
}

fn compile_src(session: &Session, src: &str) -> Vec<u8> {
    let (func, diags) = session.parse(src).expect("parse");
    assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
    session.compile(&func, None).expect("compile")
}

/// Per-call-site shape of a compiled buffer: the call opcodes in stream
/// order, plus branch/switch counts (the branch topology).
fn shape(bytes: &[u8], id: u32) -> (Vec<u16>, usize, usize) {
    let script = decode_script(bytes, id, &ScrambleMap::identity(), FormatFlags::default())
        .expect("decode");
    let calls = script
        .instructions
        .iter()
        .filter(|i| i.opcode >= API_OPCODE_BASE || i.opcode == Opcode::Invoke as u16)
        .map(|i| i.opcode)
        .collect();
    let branches = script
        .instructions
        .iter()
        .filter(|i| i.core().is_some_and(|op| op.is_branch()))
        .count();
    let switches = script
        .instructions
        .iter()
        .filter(|i| i.opcode == Opcode::Switch as u16)
        .count();
    (calls, branches, switches)
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[test]
fn empty_script_round_trips_to_the_same_source() {
    let s = session();
    let src = "void script_5() {\n    return;\n}\n";
    let bytes = compile_src(&s, src);

    let script = decode_script(&bytes, 5, &ScrambleMap::identity(), FormatFlags::default())
        .unwrap();
    assert_eq!(script.instructions.len(), 1);
    assert_eq!(script.instructions[0].opcode, Opcode::Return as u16);

    let (func, diags) = s.decompile(&bytes, 5).unwrap();
    assert!(diags.is_empty(), "{diags:?}");
    assert_eq!(normalize(&s.print(&func)), normalize(src));
}

#[test]
fn print_parse_print_is_a_fixed_point() {
    let s = session();
    let src = "\
int script_12(int $i0, string $s0) {
    int $i1;
    $i1 = ($i0 + 5) * 2;
    if ($i1 > 10 && !map_members()) {
        widget_set_text(widget_find(548, 3), $s0 + \"!\");
    } else {
        $i1 = $i1 % 3;
    }
    while ($i1 > 0) {
        $i1 = $i1 - 1;
    }
    return($i1);
}
";
    let (func, _) = s.parse(src).unwrap();
    let once = s.print(&func);
    let (reparsed, _) = s.parse(&once).unwrap();
    let twice = s.print(&reparsed);
    assert_eq!(once, twice);
}

#[test]
fn full_cycle_preserves_call_arity_and_branch_topology() {
    let s = session();
    let src = "\
int script_3(int $i0) {
    int $i1;
    $i1 = skill_level(2) + $i0;
    if ($i1 >= 99) {
        sound_play(100);
    }
    do {
        $i1 = $i1 - random(4);
    } while ($i1 > 0);
    return($i1);
}
";
    let original = compile_src(&s, src);

    let (func, diags) = s.decompile(&original, 3).unwrap();
    assert!(diags.is_empty(), "{diags:?}");
    let text = s.print(&func);
    let (reparsed, _) = s.parse(&text).unwrap();
    let recompiled = s.compile(&reparsed, None).unwrap();

    assert_eq!(shape(&original, 3), shape(&recompiled, 3));
}

#[test]
fn raw_loop_stream_reconstructs_as_while_not_goto() {
    // load 0 / push 0 / if_icmple +4 (exit) / load 0 / push 1 / sub /
    // store 0 / goto -8 / return
    let inst = |pc: usize, opcode: u16, operand: Operand| Instruction {
        pc,
        opcode,
        raw: opcode,
        operand,
    };
    let script = Script {
        id: 7,
        param_codes: vec![b'i'],
        int_locals: 1,
        string_locals: 0,
        long_locals: 0,
        instructions: vec![
            inst(0, Opcode::LoadInt as u16, Operand::Int(0)),
            inst(1, Opcode::PushInt as u16, Operand::Int(0)),
            inst(2, Opcode::IfIcmpLe as u16, Operand::Int(5)),
            inst(3, Opcode::LoadInt as u16, Operand::Int(0)),
            inst(4, Opcode::PushInt as u16, Operand::Int(1)),
            inst(5, Opcode::Sub as u16, Operand::None),
            inst(6, Opcode::StoreInt as u16, Operand::Int(0)),
            inst(7, Opcode::Goto as u16, Operand::Int(-8)),
            inst(8, Opcode::Return as u16, Operand::None),
        ],
    };
    let bytes =
        encode_script(&script, &ScrambleMap::identity(), FormatFlags::default()).unwrap();

    let s = session();
    let (func, diags) = s.decompile(&bytes, 7).unwrap();
    assert!(
        !diags
            .iter()
            .any(|d| matches!(d, Diagnostic::GotoFallback { .. })),
        "{diags:?}"
    );
    let text = s.print(&func);
    assert!(text.contains("while ($i0 > 0) {"), "{text}");
    assert!(!text.contains("goto"), "{text}");
}

#[test]
fn switch_survives_the_full_cycle() {
    let s = session();
    let src = "\
void script_20(int $i0) {
    switch ($i0) {
        case 1, 2:
            sound_play(10);
        case 3:
            sound_play(20);
        default:
            sound_play(30);
    }
    return;
}
";
    let original = compile_src(&s, src);
    let (func, diags) = s.decompile(&original, 20).unwrap();
    assert!(diags.is_empty(), "{diags:?}");
    let text = s.print(&func);
    assert!(text.contains("switch ($i0) {"), "{text}");
    assert!(text.contains("case 1, 2:"), "{text}");
    assert!(text.contains("default:"), "{text}");

    let (reparsed, _) = s.parse(&text).unwrap();
    let recompiled = s.compile(&reparsed, None).unwrap();
    assert_eq!(shape(&original, 20), shape(&recompiled, 20));
}

#[test]
fn multi_return_calls_materialize_and_survive() {
    let s = session();
    let src = "\
void script_9() {
    int $i0;
    string $s0;
    $i0, $s0 = item_info(4151);
    widget_set_text(widget_find(548, 3), $s0);
    return;
}
";
    let original = compile_src(&s, src);
    let (func, diags) = s.decompile(&original, 9).unwrap();
    assert!(diags.is_empty(), "{diags:?}");
    let text = s.print(&func);
    assert!(text.contains("= item_info(4151);"), "{text}");

    let (reparsed, _) = s.parse(&text).unwrap();
    let recompiled = s.compile(&reparsed, None).unwrap();
    assert_eq!(shape(&original, 9).0, shape(&recompiled, 9).0);
}

#[test]
fn callbacks_and_colors_render_in_their_semantic_forms() {
    let s = session();
    let src = "\
void script_11(widget $i0) {
    timer_set(50, &script_4);
    timer_set(51, null);
    $i0 = color_blend(0xff0000, 0xff00, 128);
    return;
}
";
    let original = compile_src(&s, src);
    let (func, diags) = s.decompile(&original, 11).unwrap();
    assert!(diags.is_empty(), "{diags:?}");
    let text = s.print(&func);
    assert!(text.contains("timer_set(50, &script_4);"), "{text}");
    assert!(text.contains("timer_set(51, null);"), "{text}");
    assert!(text.contains("color_blend(0xff0000, 0xff00, 128)"), "{text}");
}

#[test]
fn longs_round_trip_when_the_variant_allows_them() {
    let s = session();
    let src = "\
void script_14() {
    long $l0;
    $l0 = long_time();
    if ($l0 > 1000000L) {
        sound_play(5);
    }
    return;
}
";
    let original = compile_src(&s, src);
    let (func, diags) = s.decompile(&original, 14).unwrap();
    assert!(diags.is_empty(), "{diags:?}");
    let text = s.print(&func);
    assert!(text.contains("1000000L"), "{text}");

    let (reparsed, _) = s.parse(&text).unwrap();
    let recompiled = s.compile(&reparsed, None).unwrap();
    assert_eq!(shape(&original, 14), shape(&recompiled, 14));
}

#[test]
fn unknown_api_opcode_degrades_softly() {
    let inst = |pc: usize, opcode: u16, operand: Operand| Instruction {
        pc,
        opcode,
        raw: opcode,
        operand,
    };
    let script = Script {
        id: 30,
        param_codes: vec![],
        int_locals: 0,
        string_locals: 0,
        long_locals: 0,
        instructions: vec![
            inst(0, 4242, Operand::Byte(0)),
            inst(1, Opcode::Return as u16, Operand::None),
        ],
    };
    let bytes =
        encode_script(&script, &ScrambleMap::identity(), FormatFlags::default()).unwrap();

    let s = session();
    let (func, diags) = s.decompile(&bytes, 30).unwrap();
    assert!(
        diags
            .iter()
            .any(|d| matches!(d, Diagnostic::UnknownOpcode { opcode: 4242, pc: 0 })),
        "{diags:?}"
    );
    let text = s.print(&func);
    assert!(text.contains("op_4242();"), "{text}");

    // The raw form parses and compiles back to the same opcode.
    let (reparsed, _) = s.parse(&text).unwrap();
    let recompiled = s.compile(&reparsed, None).unwrap();
    let back = decode_script(
        &recompiled,
        30,
        &ScrambleMap::identity(),
        FormatFlags::default(),
    )
    .unwrap();
    assert!(back.instructions.iter().any(|i| i.opcode == 4242));
}

#[test]
fn scrambled_sessions_interoperate_with_themselves_only() {
    let pairs: Vec<(u16, u16)> = (0..32u16).map(|c| (c, 1000 + c)).collect();
    let scramble = ScrambleMap::from_pairs(&pairs).unwrap();
    for op in Opcode::all() {
        assert_eq!(
            scramble.unscramble(scramble.scramble(op as u16)),
            op as u16
        );
    }

    let scrambled = Session::new(
        scribe_core::SignatureDb::with_canonical_table(),
        scramble,
        FormatFlags::default(),
    );
    let src = "void script_2() {\n    sound_play(1);\n    return;\n}\n";
    let bytes = compile_src(&scrambled, src);

    // The scrambled session reads its own output fine.
    let (func, _) = scrambled.decompile(&bytes, 2).unwrap();
    assert_eq!(normalize(&scrambled.print(&func)), normalize(src));

    // An unscrambled session sees opcode 1020 where return should be and
    // rejects the stream as malformed.
    let plain = session();
    assert!(matches!(
        plain.decompile(&bytes, 2),
        Err(CoreError::MalformedScript { .. })
    ));
}

#[test]
fn ast_survives_json_serialization() {
    let s = session();
    let (func, _) = s
        .parse("int script_8(int $i0) {\n    return($i0 + 1);\n}\n")
        .unwrap();
    let json = serde_json::to_string(&func).unwrap();
    let back: scribe_core::ScriptFunction = serde_json::from_str(&json).unwrap();
    assert_eq!(back, func);
    assert_eq!(s.print(&back), s.print(&func));
}

#[test]
fn truncated_buffer_is_malformed() {
    let s = session();
    let bytes = compile_src(&s, "void script_5() {\n    return;\n}\n");
    let err = s.decompile(&bytes[..bytes.len() - 1], 5).unwrap_err();
    assert!(matches!(err, CoreError::MalformedScript { .. }), "{err}");
}

#[test]
fn signature_regeneration_is_deterministic_through_the_session() {
    let base = session();
    let mut corpus = BTreeMap::new();
    corpus.insert(
        1,
        compile_src(&base, "void script_1() {\n    op_700(1, 2);\n    return;\n}\n"),
    );
    corpus.insert(
        2,
        compile_src(&base, "void script_2() {\n    op_700(3, 4);\n    return;\n}\n"),
    );

    let mut s1 = session();
    let mut s2 = session();
    s1.generate_signatures(&corpus, 5);
    s2.generate_signatures(&corpus, 5);
    assert_eq!(s1.db.export(), s2.db.export());
    assert!(s1.db.export().contains("700 op_700"), "{}", s1.db.export());
}
