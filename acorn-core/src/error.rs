use std::fmt::Display;

pub type AcornResult<T> = Result<T, AcornError>;

/// Error taxonomy shared across the workspace.
///
/// Reads of a missing id are `Ok(None)`, never an error. Sync-layer failures
/// live in `acorn-sync`'s own error type.
#[derive(Debug, thiserror::Error)]
pub enum AcornError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("operation not supported by this trunk: {0}")]
    Unsupported(&'static str),
    #[error("writer path re-entered on the same thread")]
    Reentrant,
    #[error("configuration error: {0}")]
    Config(String),
}

/// Decode-side pipeline failures, specific enough to tell a reconfigured
/// pipeline apart from tampered or corrupt bytes.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline root with sequence {sequence} is not configured")]
    MissingRoot { sequence: u32 },
    #[error("authentication tag verification failed")]
    AuthenticationFailed,
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl AcornError {
    pub fn storage(err: impl Display) -> Self {
        AcornError::Storage(err.to_string())
    }

    pub fn serialization(err: impl Display) -> Self {
        AcornError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AcornError {
    fn from(err: std::io::Error) -> Self {
        AcornError::Storage(err.to_string())
    }
}
