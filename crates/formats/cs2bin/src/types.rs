use serde::{Deserialize, Serialize};

/// Underlying stack representation of a value. The VM keeps one stack per
/// base kind; every semantic type in the source language maps onto one of
/// these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseKind {
    Int,
    String,
    Long,
}

/// Wire type code for strings in script headers.
pub const CODE_STRING: u8 = b's';
/// Wire type code for longs in script headers.
pub const CODE_LONG: u8 = 0xA7;

/// Classify a header type code by base kind.
///
/// Every code other than the string and long codes is int-backed; the full
/// semantic meaning of the code (widget, item, color, ...) belongs to the
/// engine's type table, not the wire format.
pub fn base_kind_of_code(code: u8) -> BaseKind {
    match code {
        CODE_STRING => BaseKind::String,
        CODE_LONG => BaseKind::Long,
        _ => BaseKind::Int,
    }
}
