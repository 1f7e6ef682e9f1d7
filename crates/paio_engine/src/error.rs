use paio_comm::CommError;
use paio_var::VarError;

use crate::request::RequestId;

/// Everything that can go wrong while posting, cancelling or committing
/// nonblocking requests.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("no pending request with id {0}")]
    InvalidRequest(RequestId),

    #[error("independent wait while the dataset is in collective mode")]
    NotIndependent,

    #[error("collective wait while the dataset is in independent mode")]
    Independent,

    #[error("request region of {bytes} bytes exceeds 32-bit block addressing")]
    Overflow { bytes: i64 },

    #[error("value(s) out of range for the variable's external type")]
    Range,

    #[error("caller buffer holds {got} bytes but the access needs {expected}")]
    BufferSize { expected: usize, got: usize },

    #[error("no buffer pool attached")]
    NoPool,

    #[error("pool allocation of {needed} bytes exceeds the {avail} bytes left")]
    InsufficientBuffer { needed: i64, avail: i64 },

    #[error("buffer pool still holds pending request data")]
    PoolInUse,

    #[error("physical read failed: {0}")]
    Read(String),

    #[error("physical write failed: {0}")]
    Write(String),

    #[error(transparent)]
    Var(#[from] VarError),

    #[error(transparent)]
    Comm(#[from] CommError),
}

impl Error {
    /// Stable negative code for this error.
    ///
    /// Collective waits agree on an error across processes by max-reducing
    /// the negated code, so the mapping must be identical on every process.
    pub fn code(&self) -> i64 {
        match self {
            Error::InvalidRequest(_) => -501,
            Error::NotIndependent => -502,
            Error::Independent => -503,
            Error::Overflow { .. } => -504,
            Error::Range => -505,
            Error::BufferSize { .. } => -506,
            Error::NoPool => -507,
            Error::InsufficientBuffer { .. } => -508,
            Error::PoolInUse => -509,
            Error::Read(_) => -510,
            Error::Write(_) => -511,
            Error::Var(_) => -512,
            Error::Comm(_) => -513,
        }
    }
}

/// Per-request outcome recorded in a [`Completion`](crate::Completion) slot.
pub type Status = Result<(), Error>;
