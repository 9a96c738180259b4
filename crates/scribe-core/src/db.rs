//! Opcode and signature database.
//!
//! Maps opcodes and script ids to `{name, parameter types, return types}`.
//! Entries are either authoritative (the static table bundled below, or a
//! table loaded from disk) or inferred by the corpus pass in `infer`. The
//! line-oriented export is the same format the static loader consumes, so
//! a generated database can be re-bundled as the next static table.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use cs2bin::API_OPCODE_BASE;

use crate::error::{CoreError, Result};
use crate::ty::Type;

/// Key of a database entry: a canonical opcode or a script id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SigKey {
    Opcode(u16),
    Script(u32),
}

/// Where an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// From the static table.
    Authoritative,
    /// Guessed by the corpus inference pass; may stay partially unknown.
    Inferred,
}

/// Parameter/return profile of a callable opcode or script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub params: Vec<(String, Type)>,
    pub returns: Vec<Type>,
    pub provenance: Provenance,
}

/// The signature database. Read-mostly; regeneration happens on `&mut`
/// through `infer::generate` and must be serialized by the caller against
/// concurrent readers.
#[derive(Debug, Clone, Default)]
pub struct SignatureDb {
    entries: BTreeMap<SigKey, Signature>,
    /// Call-name resolution for the parser. Core opcodes are structural and
    /// deliberately not name-resolvable as calls.
    by_name: HashMap<String, SigKey>,
}

impl SignatureDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the database from the bundled static descriptor set: the core
    /// stack-machine opcodes plus the base named API calls.
    pub fn with_canonical_table() -> Self {
        let mut db = Self::new();
        db.import(CANONICAL_TABLE)
            .expect("bundled canonical table must parse");
        db
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolve(&self, key: SigKey) -> Option<&Signature> {
        self.entries.get(&key)
    }

    /// Resolve a call name (API opcode or script alias).
    pub fn resolve_name(&self, name: &str) -> Option<(SigKey, &Signature)> {
        let key = *self.by_name.get(name)?;
        Some((key, &self.entries[&key]))
    }

    /// Printable name for a script id.
    pub fn script_name(&self, id: u32) -> String {
        match self.entries.get(&SigKey::Script(id)) {
            Some(sig) => sig.name.clone(),
            None => format!("script_{id}"),
        }
    }

    /// Insert or replace an entry, keeping name resolution in sync.
    pub fn insert(&mut self, key: SigKey, sig: Signature) {
        let resolvable = match key {
            SigKey::Opcode(op) => op >= API_OPCODE_BASE,
            SigKey::Script(_) => true,
        };
        if let Some(old) = self.entries.get(&key) {
            self.by_name.remove(&old.name);
        }
        if resolvable {
            self.by_name.insert(sig.name.clone(), key);
        }
        self.entries.insert(key, sig);
    }

    pub fn iter(&self) -> impl Iterator<Item = (SigKey, &Signature)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    /// Export the whole table, one descriptor per line:
    /// `<key> <name> <ret[|ret...]> (<arg-type> <arg-name>)*`.
    /// Keys are bare opcode numbers or `script_<id>`; order is ascending
    /// opcode then ascending script id, so equal databases export equal text.
    pub fn export(&self) -> String {
        let mut out = String::new();
        for (key, sig) in &self.entries {
            match key {
                SigKey::Opcode(op) => out.push_str(&op.to_string()),
                SigKey::Script(id) => out.push_str(&format!("script_{id}")),
            }
            out.push(' ');
            out.push_str(&sig.name);
            out.push(' ');
            if sig.returns.is_empty() {
                out.push_str("void");
            } else {
                for (i, ret) in sig.returns.iter().enumerate() {
                    if i > 0 {
                        out.push('|');
                    }
                    out.push_str(ret.keyword());
                }
            }
            for (name, ty) in &sig.params {
                out.push_str(&format!(" ({} {})", ty.keyword(), name));
            }
            out.push('\n');
        }
        out
    }

    /// Import descriptors in the export format, replacing existing keys.
    /// Imported entries are authoritative; this is the static-table loader.
    pub fn import(&mut self, text: &str) -> Result<()> {
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, sig) = parse_descriptor_line(line).map_err(|message| CoreError::Syntax {
                line: lineno as u32 + 1,
                col: 1,
                message,
            })?;
            self.insert(key, sig);
        }
        Ok(())
    }
}

fn parse_descriptor_line(line: &str) -> std::result::Result<(SigKey, Signature), String> {
    // Split off the parenthesized argument groups first.
    let head_end = line.find('(').unwrap_or(line.len());
    let mut head = line[..head_end].split_whitespace();
    let (Some(key), Some(name), Some(returns), None) =
        (head.next(), head.next(), head.next(), head.next())
    else {
        return Err(format!("expected `<key> <name> <returns>`, found {line:?}"));
    };

    let key = if let Some(id) = key.strip_prefix("script_") {
        SigKey::Script(id.parse().map_err(|_| format!("bad script id {key:?}"))?)
    } else {
        SigKey::Opcode(key.parse().map_err(|_| format!("bad opcode {key:?}"))?)
    };

    let returns = if returns == "void" {
        Vec::new()
    } else {
        returns
            .split('|')
            .map(|r| Type::from_keyword(r).ok_or_else(|| format!("unknown return type {r:?}")))
            .collect::<std::result::Result<_, _>>()?
    };

    let mut params = Vec::new();
    let mut rest = line[head_end..].trim();
    while !rest.is_empty() {
        let Some(stripped) = rest.strip_prefix('(') else {
            return Err(format!("expected `(` in argument list, found {rest:?}"));
        };
        let Some(close) = stripped.find(')') else {
            return Err("unclosed argument group".to_string());
        };
        let group = &stripped[..close];
        let mut parts = group.split_whitespace();
        let (Some(ty), Some(arg_name), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("expected `<type> <name>` in {group:?}"));
        };
        let ty = Type::from_keyword(ty).ok_or_else(|| format!("unknown arg type {ty:?}"))?;
        params.push((arg_name.to_string(), ty));
        rest = stripped[close + 1..].trim();
    }

    Ok((
        key,
        Signature {
            name: name.to_string(),
            params,
            returns,
            provenance: Provenance::Authoritative,
        },
    ))
}

/// Argument names for an inferred signature: `arg0`, `arg1`, ...
pub fn placeholder_params(types: &[Type]) -> Vec<(String, Type)> {
    types
        .iter()
        .enumerate()
        .map(|(i, &ty)| (format!("arg{i}"), ty))
        .collect()
}

/// The bundled static descriptor set. Core stack-machine opcodes are listed
/// for completeness of the export; named API calls drive call resolution.
const CANONICAL_TABLE: &str = "\
# core
0 push_int void
1 push_string void
2 push_long void
3 load_int void
4 store_int void
5 load_string void
6 store_string void
7 load_long void
8 store_long void
9 pop_int void
10 pop_string void
11 pop_long void
12 goto void
13 if_icmpeq void
14 if_icmpne void
15 if_icmplt void
16 if_icmpgt void
17 if_icmple void
18 if_icmpge void
19 switch void
20 return void
21 add void
22 sub void
23 mul void
24 div void
25 mod void
26 join_string void
27 if_lcmpeq void
28 if_lcmpne void
29 if_lcmplt void
30 if_lcmpgt void
31 invoke void
# api
100 cc_create void (widget parent) (int cctype) (int slot)
101 cc_delete void
102 widget_get_text string (widget target)
103 widget_set_text void (widget target) (string text)
104 widget_find widget (int iface) (int comp)
105 widget_hidden boolean (widget target)
106 sound_play void (sound effect)
107 item_name string (item id)
108 npc_name string (npc id)
109 skill_level int (skill stat)
110 color_blend color (color from) (color to) (int t)
111 clock int
112 random int (int range)
113 db_lookup dbrow (dbtable table) (int row)
114 db_field_int int (dbrow row) (dbcolumn column)
115 timer_set void (int ticks) (callback handler)
116 long_time long
117 format_long string (long value)
118 enum_value int (enum source) (int key)
119 map_members boolean
120 item_info int|string (item id)
";

#[cfg(test)]
mod tests {
    use super::*;
    use cs2bin::Opcode;

    #[test]
    fn canonical_table_covers_every_core_opcode() {
        let db = SignatureDb::with_canonical_table();
        for op in Opcode::all() {
            let sig = db.resolve(SigKey::Opcode(op as u16)).unwrap();
            assert_eq!(sig.name, op.mnemonic());
        }
    }

    #[test]
    fn core_opcodes_do_not_resolve_as_calls() {
        let db = SignatureDb::with_canonical_table();
        assert!(db.resolve_name("add").is_none());
        assert!(db.resolve_name("widget_get_text").is_some());
    }

    #[test]
    fn export_import_round_trips() {
        let mut db = SignatureDb::with_canonical_table();
        db.insert(
            SigKey::Script(42),
            Signature {
                name: "script_42".to_string(),
                params: placeholder_params(&[Type::Int, Type::String]),
                returns: vec![Type::Int, Type::String],
                provenance: Provenance::Inferred,
            },
        );
        let text = db.export();

        let mut again = SignatureDb::new();
        again.import(&text).unwrap();
        assert_eq!(again.export(), text);

        let sig = again.resolve(SigKey::Script(42)).unwrap();
        assert_eq!(sig.returns, vec![Type::Int, Type::String]);
        assert_eq!(sig.params.len(), 2);
    }

    #[test]
    fn multi_return_line_parses() {
        let mut db = SignatureDb::new();
        db.import("200 split int|string (string source) (int at)\n")
            .unwrap();
        let sig = db.resolve(SigKey::Opcode(200)).unwrap();
        assert_eq!(sig.returns, vec![Type::Int, Type::String]);
        assert_eq!(sig.params[1], ("at".to_string(), Type::Int));
    }

    #[test]
    fn bad_line_is_a_syntax_error() {
        let mut db = SignatureDb::new();
        let err = db.import("not-a-key name void\n").unwrap_err();
        assert!(matches!(err, CoreError::Syntax { line: 1, .. }));
    }
}
