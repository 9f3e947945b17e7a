use std::path::PathBuf;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failures surfaced by the pipeline core.
///
/// Partial cleanup is deliberately absent: a failed best-effort step is
/// recorded in a [`crate::supervisor::CleanupReport`] instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A referenced record, file or peer does not exist.
    #[error("{what} not found: {path}")]
    NotFound { what: &'static str, path: PathBuf },

    /// The target pid or record is not a recognized pipeline job.
    #[error("{0}")]
    NotOurs(String),

    /// Any network failure talking to a peer.
    #[error("peer {peer} is currently unavailable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    /// The peer answered, but refused the request.
    #[error("peer {peer} rejected request ({status}): {message}")]
    PeerRejected {
        peer: String,
        status: u16,
        message: String,
    },

    /// Malformed input rejected before any action was taken.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The record's stage has no cancellation entry.
    #[error("unknown or non-cancellable state: {0}")]
    NotCancellable(String),

    #[error("failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn not_found(what: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::NotFound {
            what,
            path: path.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
