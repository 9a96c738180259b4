//! The CS2 script transformation engine.
//!
//! Bidirectional: `bytes → decompile → AST → print → text` and
//! `text → parse → AST → compile → bytes`, with a shared opcode and
//! signature database consulted by every stage. The surrounding
//! application supplies raw buffers and format flags; this crate never
//! performs cache I/O of its own.

pub mod ast;
pub mod compile;
pub mod db;
pub mod decompile;
pub mod error;
pub mod infer;
pub mod parser;
pub mod printer;
pub mod session;
pub mod ty;

pub use ast::ScriptFunction;
pub use db::{SigKey, Signature, SignatureDb};
pub use error::{CoreError, Diagnostic, Result};
pub use session::Session;
pub use ty::Type;
