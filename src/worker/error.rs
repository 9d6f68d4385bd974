//! Worker-specific error types.

use std::io;
use thiserror::Error;

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors that can occur while driving the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Failed to spawn the worker process.
    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(#[source] io::Error),

    /// Failed to write to worker stdin.
    #[error("failed to write to worker: {0}")]
    WriteFailed(#[source] io::Error),

    /// Failed to serialize a request frame to JSON.
    #[error("failed to serialize request: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// Failed to fetch the data file for the open action.
    #[error("failed to fetch data file '{url}': {source}")]
    Fetch {
        /// Location the data source was asked for.
        url: String,
        /// Underlying read failure.
        #[source]
        source: io::Error,
    },

    /// The worker rejected the open action.
    #[error("failed to open data source: {0}")]
    OpenFailed(String),

    /// Request timed out waiting for a reply.
    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    /// Worker process exited while requests were outstanding.
    #[error("worker process exited unexpectedly")]
    WorkerExited,

    /// Channel to the worker is closed (internal error).
    #[error("worker channel closed unexpectedly")]
    ChannelClosed,

    /// Operation arrived after termination had begun.
    #[error("worker unavailable: terminating or terminated")]
    Unavailable,

    /// `terminate` called while a terminate is already running.
    #[error("already terminating")]
    AlreadyTerminating,

    /// `terminate` called after the worker was torn down.
    #[error("already terminated")]
    AlreadyTerminated,

    /// `init` called while another init is still in flight.
    #[error("initialization already in progress")]
    InitInProgress,

    /// Shared initialization failed; carries the original failure text.
    #[error("initialization failed: {0}")]
    InitFailed(String),
}

impl WorkerError {
    /// Check if this error indicates the worker is gone.
    pub fn is_worker_exited(&self) -> bool {
        matches!(self, Self::WorkerExited | Self::ChannelClosed)
    }

    /// Check if this error reports a call made in an invalid lifecycle
    /// state, as opposed to a failure of the call itself.
    pub fn is_lifecycle_misuse(&self) -> bool {
        matches!(
            self,
            Self::Unavailable
                | Self::AlreadyTerminating
                | Self::AlreadyTerminated
                | Self::InitInProgress
        )
    }

    /// Check if this error is retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::WorkerExited | Self::ChannelClosed
        )
    }
}

impl From<io::Error> for WorkerError {
    fn from(err: io::Error) -> Self {
        Self::WriteFailed(err)
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializeFailed(err)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for WorkerError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}
