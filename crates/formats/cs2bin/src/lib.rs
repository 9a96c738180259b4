//! Reader/writer for compiled CS2 script buffers.
//!
//! Three-layer architecture:
//! - **Layer 1** (`cursor`): Raw big-endian byte I/O over a script buffer
//! - **Layer 2** (`opcode`/`scramble`/`types`): The canonical instruction
//!   set, the on-disk opcode permutation, and wire-level type codes
//! - **Layer 3** (`decode`/`encode`): Header + instruction stream codec
//!
//! This crate only consumes and produces byte buffers plus explicit format
//! flags; it never touches the cache container the buffers come from.

pub mod cursor;
pub mod decode;
pub mod encode;
pub mod error;
pub mod opcode;
pub mod scramble;
pub mod types;

pub use decode::{decode_script, Instruction, Operand, Script, SwitchCase};
pub use encode::encode_script;
pub use error::{Error, Result};
pub use opcode::{Opcode, OperandKind, API_OPCODE_BASE};
pub use scramble::ScrambleMap;
pub use types::{base_kind_of_code, BaseKind};

/// Format variant flags, always supplied by the caller: the on-disk
/// instruction set varies by target build and is never auto-detected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FormatFlags {
    /// Target build has no switch dispatch opcode or case tables.
    pub disable_switches: bool,
    /// Target build has no 64-bit immediates, long locals, or long branches.
    pub disable_longs: bool,
}
