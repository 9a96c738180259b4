//! Session state: the explicit, caller-owned context for every operation.
//!
//! The scramble map, signature database, and format flags live here and
//! are passed by reference into each call, never held in process-wide
//! globals, so several sessions over different caches coexist safely. All calls
//! are synchronous and atomic per script; the database is read-mostly and
//! regeneration takes `&mut self`, leaving snapshot-and-swap (or a
//! single-writer lock) to the caller.

use std::collections::BTreeMap;

use cs2bin::{decode_script, FormatFlags, ScrambleMap};

use crate::ast::ScriptFunction;
use crate::compile;
use crate::db::SignatureDb;
use crate::decompile;
use crate::error::{CoreError, Diagnostic, Result};
use crate::infer::{self, InferenceReport};
use crate::parser;
use crate::printer;

pub struct Session {
    pub db: SignatureDb,
    pub scramble: ScrambleMap,
    pub flags: FormatFlags,
}

impl Session {
    pub fn new(db: SignatureDb, scramble: ScrambleMap, flags: FormatFlags) -> Self {
        Session {
            db,
            scramble,
            flags,
        }
    }

    /// A session over the unscrambled format with the bundled static table.
    pub fn unscrambled(flags: FormatFlags) -> Self {
        Session::new(
            SignatureDb::with_canonical_table(),
            ScrambleMap::identity(),
            flags,
        )
    }

    /// Decode and decompile one script buffer, then run the peephole pass.
    pub fn decompile(
        &self,
        bytes: &[u8],
        id: u32,
    ) -> Result<(ScriptFunction, Vec<Diagnostic>)> {
        let script = decode_script(bytes, id, &self.scramble, self.flags)
            .map_err(|e| CoreError::from_format(id, e))?;
        let (mut func, diags) = decompile::decompile(&script, &self.db);
        decompile::optimize(&mut func);
        Ok((func, diags))
    }

    /// Parse edited source text back into a function.
    pub fn parse(&self, src: &str) -> Result<(ScriptFunction, Vec<Diagnostic>)> {
        parser::parse(src, &self.db)
    }

    /// Render a function to canonical source text.
    pub fn print(&self, func: &ScriptFunction) -> String {
        printer::print(func)
    }

    /// Compile a function to a script buffer, optionally emitting a
    /// disassembly listing of everything emitted.
    pub fn compile(
        &self,
        func: &ScriptFunction,
        disasm: Option<&mut String>,
    ) -> Result<Vec<u8>> {
        compile::compile(func, &self.db, &self.scramble, self.flags, disasm)
    }

    /// Regenerate inferred signatures from a corpus of raw buffers keyed by
    /// script id. Exclusive: holds `&mut self` for the whole fixed point.
    pub fn generate_signatures(
        &mut self,
        corpus: &BTreeMap<u32, Vec<u8>>,
        iterations: usize,
    ) -> InferenceReport {
        infer::generate(&mut self.db, corpus, &self.scramble, self.flags, iterations)
    }
}
