//! Source text frontend: lexer and recursive-descent parser for `.cs2`
//! files. Grammar violations are hard `SyntaxError`s with line/column;
//! unresolved names are accepted untyped and surface as soft diagnostics
//! so edited sources can be round-tripped before every signature is known.

mod lexer;
mod parse;

pub use parse::parse;
