//! Module containing the universal error type for this crate
use thiserror::Error;

/// Universal error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("node is not present in this `Context`")]
    BadNode,

    #[error("variable is not present in this tape")]
    BadVar,

    #[error("`Context` is empty")]
    EmptyContext,

    #[error("slice lengths are mismatched")]
    MismatchedSlices,

    #[error("var slice length ({0}) does not match var count ({1})")]
    BadVarSlice(usize, usize),

    #[error("this name is reserved for coordinate axes")]
    ReservedName,

    #[error("this name has already been used")]
    DuplicateName,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
