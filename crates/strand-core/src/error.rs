use strand_abi::{BackendError, SeqId, Token};
use thiserror::Error;

/// Everything the session engine can fail with.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed sequence id, capacity or range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid sequence set: {0}")]
    InvalidSequenceSet(String),

    /// Batch or cache is full.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("context overflow: sequence {seq} would need {needed} cells, n_ctx = {n_ctx}")]
    ContextOverflow {
        seq: SeqId,
        needed: usize,
        n_ctx: usize,
    },

    #[error("decode aborted")]
    Aborted,

    #[error("backend failure: {0}")]
    BackendFailure(#[source] BackendError),

    #[error("incompatible state: {0}")]
    IncompatibleState(String),

    #[error("grammar rejected token {0:?}")]
    GrammarReject(Token),

    #[error("grammar parse error: {0}")]
    GrammarParse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Aborted => Error::Aborted,
            other => Error::BackendFailure(other),
        }
    }
}

impl Error {
    /// The generation loop may retry or stop cleanly.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::BackendFailure(_)
                | Error::Aborted
                | Error::ContextOverflow { .. }
                | Error::CapacityExceeded(_)
                | Error::Io(_)
        )
    }

    /// The caller passed something it should not have.
    pub fn is_caller_bug(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_)
                | Error::InvalidSequenceSet(_)
                | Error::GrammarReject(_)
                | Error::GrammarParse(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
