use crate::id::ID;
use thiserror::Error;

/// Errors the engine can report. Per spec.md §7: integrity violations are
/// programmer errors (the caller broke a precondition), malformed wire input
/// is fatal only for the update it was found in, and pending dependencies are
/// *not* an error at all - they are represented out of band (the struct is
/// parked, not rejected).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("struct store integrity violation: client {client} expected next clock {expected}, got {actual}")]
    Contiguity {
        client: u64,
        expected: u32,
        actual: u32,
    },

    #[error("id {0} is outside of the known state of its client")]
    UnknownId(ID),

    #[error("malformed update: {0}")]
    Decode(#[from] codec::Error),

    #[error("a transaction is already open on this document")]
    TransactionAlreadyOpen,
}

pub type Result<T> = std::result::Result<T, Error>;
