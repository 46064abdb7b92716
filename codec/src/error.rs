use thiserror::Error;

/// Failures produced while decoding a byte buffer written by [crate::Write].
///
/// These always describe malformed wire input, never a programmer error -
/// the caller is expected to treat any `Error` here as "discard this update".
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of buffer")]
    EndOfBuffer,

    #[error("variable-length integer is longer than 64 bits")]
    VarIntTooLong,

    #[error("buffer does not contain valid UTF-8")]
    InvalidUtf8,

    #[error("unknown struct info tag: {0}")]
    UnknownStructTag(u8),
}

pub type Result<T> = std::result::Result<T, Error>;
