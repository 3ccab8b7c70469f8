use thiserror::Error;

/// Failures reported by collaborators (model store, vocabulary, compute backend).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("model load failed: {0}")]
    Load(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("compute failed: {0}")]
    Compute(String),

    /// The abort hook asked the backend to stop mid-decode.
    #[error("decode aborted by caller")]
    Aborted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
