use acorn_core::AcornError;

pub type SyncResult<T> = Result<T, SyncError>;

/// Failures on the replication path. Local trunk/engine failures keep their
/// [`AcornError`] identity; everything else distinguishes "the wire broke"
/// from "the remote said no".
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync operation timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error(transparent)]
    Storage(#[from] AcornError),
}
