use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unexpected end of data at offset {offset:#x} (need {need} bytes, have {have})")]
    UnexpectedEof {
        offset: usize,
        need: usize,
        have: usize,
    },

    #[error("malformed script {script}: {message}")]
    Malformed { script: u32, message: String },

    #[error("unsupported format: {feature} at instruction {pc} but the format flag disables it")]
    Unsupported { feature: &'static str, pc: usize },

    #[error("scramble map collision: {side} opcode {opcode} mapped twice")]
    ScrambleCollision { side: &'static str, opcode: u16 },

    #[error("string at offset {offset:#x} is not valid UTF-8: {source}")]
    InvalidString {
        offset: usize,
        source: std::string::FromUtf8Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
