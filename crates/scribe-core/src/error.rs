use serde::Serialize;
use thiserror::Error;

/// Hard failures. Each aborts exactly one operation, never leaves
/// partially-written output, and never takes the session down.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed script {script}: {message}")]
    MalformedScript { script: u32, message: String },

    #[error("unsupported format: {feature} (instruction {pc})")]
    UnsupportedFormat { feature: String, pc: usize },

    #[error("syntax error at {line}:{col}: {message}")]
    Syntax { line: u32, col: u32, message: String },

    #[error("compile error in {script}, {locus}: {message}")]
    Compile {
        script: String,
        locus: String,
        message: String,
    },
}

impl CoreError {
    /// Lift a format-layer error into the hard taxonomy, attributing
    /// cursor-level failures to the script being processed.
    pub fn from_format(script: u32, err: cs2bin::Error) -> Self {
        match err {
            cs2bin::Error::Unsupported { feature, pc } => CoreError::UnsupportedFormat {
                feature: feature.to_string(),
                pc,
            },
            cs2bin::Error::Malformed { script, message } => {
                CoreError::MalformedScript { script, message }
            }
            other => CoreError::MalformedScript {
                script,
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Soft findings. These never abort an operation; they degrade the output
/// (goto fallback, unchecked call, placeholder value) and surface here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Diagnostic {
    /// An API opcode with no signature database entry.
    UnknownOpcode { opcode: u16, pc: usize },
    /// An `invoke` of a script with no signature database entry.
    UnknownScript { id: u32, pc: usize },
    /// A call or reference in source text that the database cannot resolve.
    UnresolvedSymbol { name: String, line: u32, col: u32 },
    /// A resolved call whose arguments disagree with the database entry.
    /// Soft at parse time; the compiler rejects it hard.
    SignatureMismatch {
        name: String,
        message: String,
        line: u32,
        col: u32,
    },
    /// An instruction region that did not match any recognized control-flow
    /// shape and was preserved as explicit goto/label pairs.
    GotoFallback { start: usize, end: usize },
    /// Stack simulation hit an underflow or a non-empty stack at a join;
    /// the surrounding expressions are best-effort.
    StackImbalance { pc: usize },
}
