//! Session failure taxonomy.

use crate::channel::ChannelError;
use crate::pow::PowError;

/// Why an upload session ended without a link. Every variant is fatal for the session; the
/// caller restarts from scratch.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("connection failed: {0}")]
    Connection(#[source] ChannelError),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("upload rejected: {0}")]
    UploadRejected(String),
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("upload cancelled")]
    Cancelled,
    #[error("no upload token configured")]
    MissingToken,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// True when the caller stopped the upload, as opposed to it breaking.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }
}

impl From<ChannelError> for UploadError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Connect(_) => UploadError::Connection(e),
            other => UploadError::Protocol(other.to_string()),
        }
    }
}

impl From<PowError> for UploadError {
    fn from(e: PowError) -> Self {
        match e {
            PowError::Cancelled => UploadError::Cancelled,
            other => UploadError::Protocol(other.to_string()),
        }
    }
}
