use thiserror::Error;

/// Decoding failures for bencoded input.
///
/// Encoding never fails: every [`Value`](super::Value) has exactly one
/// canonical byte representation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("input ended in the middle of a value")]
    Truncated,

    #[error("malformed integer")]
    BadInteger,

    #[error("malformed string length")]
    BadLength,

    #[error("unexpected byte 0x{0:02x}")]
    UnexpectedByte(u8),

    #[error("dictionary key is not a byte string")]
    NonStringKey,

    #[error("data after the end of the outermost value")]
    TrailingData,

    #[error("nesting too deep")]
    TooDeep,
}
