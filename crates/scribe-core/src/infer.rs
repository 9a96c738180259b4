//! Heuristic signature inference over a script corpus.
//!
//! Iterative fixed point: each pass walks every script in ascending id
//! order with a depth-only stack simulation driven by the current table,
//! and refines entries for unknown callables from call-site evidence:
//!
//! - argument counts are bounded by the values pushed since the last stack
//!   barrier (label, branch, store, pop, call, or function entry) still
//!   live immediately before the call;
//! - return arity is attributed from the stack deficit at the first
//!   consumer after the call.
//!
//! The pass ends at the iteration cap or as soon as a pass changes no
//! entry. Traversal order and all aggregation maps are ordered, so two
//! runs over the same corpus export identical text.

use std::collections::BTreeMap;

use cs2bin::{decode_script, FormatFlags, Opcode, Operand, ScrambleMap, Script, API_OPCODE_BASE};

use crate::db::{placeholder_params, Provenance, SigKey, Signature, SignatureDb};
use crate::ty::Type;

/// What a fixed-point run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceReport {
    /// Passes actually run (may stop early at the fixed point).
    pub passes: usize,
    /// Entries written with inferred provenance.
    pub inferred: usize,
    /// Scripts that failed to decode and were skipped.
    pub skipped: Vec<u32>,
}

/// Per-kind counts: (int, string, long).
type Counts = [u32; 3];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Profile {
    args: Counts,
    returns: Counts,
}

/// Refine the database from a corpus of raw script buffers.
pub fn generate(
    db: &mut SignatureDb,
    corpus: &BTreeMap<u32, Vec<u8>>,
    scramble: &ScrambleMap,
    flags: FormatFlags,
    iterations: usize,
) -> InferenceReport {
    let mut scripts = Vec::new();
    let mut skipped = Vec::new();
    for (&id, bytes) in corpus {
        match decode_script(bytes, id, scramble, flags) {
            Ok(script) => scripts.push(script),
            Err(_) => skipped.push(id),
        }
    }

    // Working profiles for everything refinable, seeded from prior
    // inferred entries. Authoritative entries never move.
    let mut working: BTreeMap<SigKey, Profile> = BTreeMap::new();
    for (key, sig) in db.iter() {
        if sig.provenance == Provenance::Inferred {
            working.insert(key, profile_of(sig));
        }
    }

    let mut passes = 0;
    for _ in 0..iterations {
        passes += 1;
        let mut args_bound: BTreeMap<SigKey, Counts> = BTreeMap::new();
        let mut returns_need: BTreeMap<SigKey, Counts> = BTreeMap::new();

        for script in &scripts {
            observe_script(script, db, &working, &mut args_bound, &mut returns_need);
        }

        let mut changed = false;
        for (key, bound) in &args_bound {
            let need = returns_need.get(key).copied().unwrap_or_default();
            let next = Profile {
                args: *bound,
                returns: need,
            };
            if working.get(key) != Some(&next) {
                working.insert(*key, next);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    for (&key, profile) in &working {
        db.insert(key, signature_for(key, profile, db));
    }

    InferenceReport {
        passes,
        inferred: working.len(),
        skipped,
    }
}

fn profile_of(sig: &Signature) -> Profile {
    let mut p = Profile::default();
    for (_, ty) in &sig.params {
        p.args[kind_index(*ty)] += 1;
    }
    for ty in &sig.returns {
        p.returns[kind_index(*ty)] += 1;
    }
    p
}

fn kind_index(ty: Type) -> usize {
    match ty.base() {
        cs2bin::BaseKind::Int => 0,
        cs2bin::BaseKind::String => 1,
        cs2bin::BaseKind::Long => 2,
    }
}

fn types_of(counts: Counts) -> Vec<Type> {
    let mut out = Vec::new();
    out.extend(std::iter::repeat(Type::Int).take(counts[0] as usize));
    out.extend(std::iter::repeat(Type::String).take(counts[1] as usize));
    out.extend(std::iter::repeat(Type::Long).take(counts[2] as usize));
    out
}

fn signature_for(key: SigKey, profile: &Profile, db: &SignatureDb) -> Signature {
    let name = match (key, db.resolve(key)) {
        (_, Some(existing)) => existing.name.clone(),
        (SigKey::Opcode(op), None) => format!("op_{op}"),
        (SigKey::Script(id), None) => format!("script_{id}"),
    };
    Signature {
        name,
        params: placeholder_params(&types_of(profile.args)),
        returns: types_of(profile.returns),
        provenance: Provenance::Inferred,
    }
}

/// The call key of an instruction, if it is a call.
fn call_key(script_op: u16, operand: &Operand) -> Option<SigKey> {
    if script_op == Opcode::Invoke as u16 {
        if let Operand::Int(id) = operand {
            return Some(SigKey::Script(*id as u32));
        }
    }
    if script_op >= API_OPCODE_BASE {
        return Some(SigKey::Opcode(script_op));
    }
    None
}

/// How a call behaves under the current knowledge: fixed (authoritative),
/// or a refinable working guess.
fn effect_of(
    key: SigKey,
    db: &SignatureDb,
    working: &BTreeMap<SigKey, Profile>,
) -> (Profile, bool) {
    if let Some(sig) = db.resolve(key) {
        if sig.provenance == Provenance::Authoritative {
            return (profile_of(sig), false);
        }
    }
    (working.get(&key).copied().unwrap_or_default(), true)
}

fn observe_script(
    script: &Script,
    db: &SignatureDb,
    working: &BTreeMap<SigKey, Profile>,
    args_bound: &mut BTreeMap<SigKey, Counts>,
    returns_need: &mut BTreeMap<SigKey, Counts>,
) {
    let mut label_pcs = vec![false; script.instructions.len()];
    for inst in &script.instructions {
        if let Some(t) = inst.branch_target() {
            label_pcs[t as usize] = true;
        }
        if let Operand::Table(cases) = &inst.operand {
            for case in cases {
                let t = inst.pc as i64 + 1 + case.delta as i64;
                label_pcs[t as usize] = true;
            }
        }
    }

    let mut depth: Counts = [0; 3];
    let mut barrier: Counts = [0; 3];

    for (idx, inst) in script.instructions.iter().enumerate() {
        if label_pcs[idx] {
            barrier = depth;
        }

        if let Some(key) = call_key(inst.opcode, &inst.operand) {
            let (guess, refinable) = effect_of(key, db, working);
            if refinable {
                // Argument bound: values pushed since the barrier, still
                // live now. The minimum across all sites wins.
                let avail = [
                    depth[0].saturating_sub(barrier[0]),
                    depth[1].saturating_sub(barrier[1]),
                    depth[2].saturating_sub(barrier[2]),
                ];
                let bound = args_bound.entry(key).or_insert(avail);
                for k in 0..3 {
                    bound[k] = bound[k].min(avail[k]);
                }

                // Return attribution: whatever the next consumer is short
                // of, under the current guess, must come from this call.
                let mut after = depth;
                for k in 0..3 {
                    after[k] = after[k].saturating_sub(guess.args[k]) + guess.returns[k];
                }
                let consume = next_consumption(script, idx + 1, db, working);
                let need = returns_need.entry(key).or_default();
                for k in 0..3 {
                    let deficit = consume[k].saturating_sub(after[k]);
                    need[k] = need[k].max(guess.returns[k]).max(deficit.min(2));
                }
            }
            apply_call(&mut depth, &effect_of(key, db, working).0);
            barrier = depth;
            continue;
        }

        step(inst, &mut depth, &mut barrier);
    }
}

fn apply_call(depth: &mut Counts, profile: &Profile) {
    for k in 0..3 {
        depth[k] = depth[k].saturating_sub(profile.args[k]) + profile.returns[k];
    }
}

/// What the instruction at `idx` pops, per kind.
fn next_consumption(
    script: &Script,
    idx: usize,
    db: &SignatureDb,
    working: &BTreeMap<SigKey, Profile>,
) -> Counts {
    let Some(inst) = script.instructions.get(idx) else {
        return [0; 3];
    };
    if let Some(key) = call_key(inst.opcode, &inst.operand) {
        return effect_of(key, db, working).0.args;
    }
    match inst.core() {
        Some(Opcode::StoreInt) | Some(Opcode::PopInt) | Some(Opcode::Switch) => [1, 0, 0],
        Some(Opcode::StoreString) | Some(Opcode::PopString) => [0, 1, 0],
        Some(Opcode::StoreLong) | Some(Opcode::PopLong) => [0, 0, 1],
        Some(
            Opcode::IfIcmpEq
            | Opcode::IfIcmpNe
            | Opcode::IfIcmpLt
            | Opcode::IfIcmpGt
            | Opcode::IfIcmpLe
            | Opcode::IfIcmpGe,
        ) => [2, 0, 0],
        Some(Opcode::IfLcmpEq | Opcode::IfLcmpNe | Opcode::IfLcmpLt | Opcode::IfLcmpGt) => {
            [0, 0, 2]
        }
        Some(Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod) => [2, 0, 0],
        Some(Opcode::JoinString) => match inst.operand {
            Operand::Int(n) => [0, n.max(0) as u32, 0],
            _ => [0, 0, 0],
        },
        _ => [0; 3],
    }
}

/// Depth effect of a non-call instruction.
fn step(inst: &cs2bin::Instruction, depth: &mut Counts, barrier: &mut Counts) {
    let Some(op) = inst.core() else {
        return;
    };
    match op {
        Opcode::PushInt | Opcode::LoadInt => depth[0] += 1,
        Opcode::PushString | Opcode::LoadString => depth[1] += 1,
        Opcode::PushLong | Opcode::LoadLong => depth[2] += 1,
        Opcode::StoreInt | Opcode::PopInt => {
            depth[0] = depth[0].saturating_sub(1);
            *barrier = *depth;
        }
        Opcode::StoreString | Opcode::PopString => {
            depth[1] = depth[1].saturating_sub(1);
            *barrier = *depth;
        }
        Opcode::StoreLong | Opcode::PopLong => {
            depth[2] = depth[2].saturating_sub(1);
            *barrier = *depth;
        }
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
            depth[0] = depth[0].saturating_sub(1);
        }
        Opcode::JoinString => {
            if let Operand::Int(n) = inst.operand {
                depth[1] = depth[1].saturating_sub((n.max(1) - 1) as u32);
            }
        }
        Opcode::Goto
        | Opcode::IfIcmpEq
        | Opcode::IfIcmpNe
        | Opcode::IfIcmpLt
        | Opcode::IfIcmpGt
        | Opcode::IfIcmpLe
        | Opcode::IfIcmpGe
        | Opcode::IfLcmpEq
        | Opcode::IfLcmpNe
        | Opcode::IfLcmpLt
        | Opcode::IfLcmpGt => {
            match op {
                Opcode::Goto => {}
                Opcode::IfLcmpEq | Opcode::IfLcmpNe | Opcode::IfLcmpLt | Opcode::IfLcmpGt => {
                    depth[2] = depth[2].saturating_sub(2);
                }
                _ => depth[0] = depth[0].saturating_sub(2),
            }
            *barrier = *depth;
        }
        Opcode::Switch => {
            depth[0] = depth[0].saturating_sub(1);
            *barrier = *depth;
        }
        Opcode::Return => {
            *depth = [0; 3];
            *barrier = [0; 3];
        }
        Opcode::Invoke => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ScriptFunction;
    use crate::compile::compile;
    use crate::parser::parse;

    fn build(db: &SignatureDb, src: &str) -> Vec<u8> {
        let (func, _): (ScriptFunction, _) = parse(src, db).unwrap();
        compile(&func, db, &ScrambleMap::identity(), FormatFlags::default(), None).unwrap()
    }

    /// A corpus where opcode 900 is called with two ints pushed right
    /// before it and its result is stored immediately after.
    fn corpus(db: &SignatureDb) -> BTreeMap<u32, Vec<u8>> {
        let mut corpus = BTreeMap::new();
        corpus.insert(
            1,
            build(
                db,
                "void script_1() {\n    int $i0;\n    op_900(3, 4);\n    $i0 = clock();\n    return;\n}\n",
            ),
        );
        corpus.insert(
            2,
            build(db, "void script_2() {\n    op_900(1, 2);\n    return;\n}\n"),
        );
        corpus
    }

    #[test]
    fn argument_count_is_bounded_by_pushes_before_the_call() {
        let mut db = SignatureDb::with_canonical_table();
        let corpus = corpus(&db);
        let report = generate(
            &mut db,
            &corpus,
            &ScrambleMap::identity(),
            FormatFlags::default(),
            8,
        );
        assert!(report.skipped.is_empty());

        let sig = db.resolve(SigKey::Opcode(900)).unwrap();
        assert_eq!(sig.provenance, Provenance::Inferred);
        assert_eq!(sig.params.len(), 2);
        assert!(sig.params.iter().all(|(_, ty)| *ty == Type::Int));
        assert!(sig.returns.is_empty());
    }

    #[test]
    fn return_arity_is_attributed_from_the_next_consumer() {
        use cs2bin::{encode_script, Instruction, Script};

        // push_int 5 / op_901 / store_int 0 / return. The store's operand
        // can only come from op_901 once the push is claimed as its
        // argument, which takes a couple of passes to settle.
        let inst = |pc: usize, opcode: u16, operand: Operand| Instruction {
            pc,
            opcode,
            raw: opcode,
            operand,
        };
        let script = Script {
            id: 3,
            param_codes: vec![],
            int_locals: 1,
            string_locals: 0,
            long_locals: 0,
            instructions: vec![
                inst(0, Opcode::PushInt as u16, Operand::Int(5)),
                inst(1, 901, Operand::Byte(0)),
                inst(2, Opcode::StoreInt as u16, Operand::Int(0)),
                inst(3, Opcode::Return as u16, Operand::None),
            ],
        };
        let mut corpus = BTreeMap::new();
        corpus.insert(
            3,
            encode_script(&script, &ScrambleMap::identity(), FormatFlags::default()).unwrap(),
        );

        let mut db = SignatureDb::with_canonical_table();
        generate(
            &mut db,
            &corpus,
            &ScrambleMap::identity(),
            FormatFlags::default(),
            6,
        );
        let sig = db.resolve(SigKey::Opcode(901)).unwrap();
        assert_eq!(sig.params.len(), 1);
        assert_eq!(sig.returns, vec![Type::Int]);
    }

    #[test]
    fn generation_is_deterministic() {
        let base = SignatureDb::with_canonical_table();
        let corpus = corpus(&base);

        let mut db1 = SignatureDb::with_canonical_table();
        let mut db2 = SignatureDb::with_canonical_table();
        let r1 = generate(
            &mut db1,
            &corpus,
            &ScrambleMap::identity(),
            FormatFlags::default(),
            6,
        );
        let r2 = generate(
            &mut db2,
            &corpus,
            &ScrambleMap::identity(),
            FormatFlags::default(),
            6,
        );
        assert_eq!(r1, r2);
        assert_eq!(db1.export(), db2.export());
    }

    #[test]
    fn authoritative_entries_never_move() {
        let mut db = SignatureDb::with_canonical_table();
        let before = db.resolve(SigKey::Opcode(106)).unwrap().clone();
        let corpus = corpus(&db);
        generate(
            &mut db,
            &corpus,
            &ScrambleMap::identity(),
            FormatFlags::default(),
            4,
        );
        assert_eq!(*db.resolve(SigKey::Opcode(106)).unwrap(), before);
    }
}
