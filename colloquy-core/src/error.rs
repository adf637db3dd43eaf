//! ABOUTME: Error types for the replay engine covering transcript invariants and replay divergence
//! ABOUTME: Provides the crate-wide Result alias used by state, cursor and engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the replay engine and its transcript
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The procedure emitted a different op than the transcript recorded
    /// at the same position. The instance is no longer replayable.
    #[error("replay diverged at op {index}: transcript recorded key {expected:?}, procedure presented {found:?}")]
    BadReplay {
        /// Position in the send log where the divergence occurred
        index: usize,
        /// Collation key recorded in the transcript
        expected: String,
        /// Collation key the procedure presented on this run
        found: String,
    },

    /// A completion referenced an op index that was never emitted
    #[error("completion references op {index} but only {len} ops were emitted")]
    CompletionOutOfRange {
        /// The op index the completion referenced
        index: usize,
        /// Number of ops in the send log
        len: usize,
    },

    /// An op was completed twice
    #[error("op {index} already has a completion")]
    DuplicateCompletion {
        /// The op index that was completed twice
        index: usize,
    },

    /// A checkpoint pointed past the end of the transcript
    #[error("checkpoint ({send}, {receive}) is ahead of the transcript ({send_len}, {receive_len})")]
    InvalidCheckpoint {
        /// Send length recorded in the checkpoint
        send: usize,
        /// Receive length recorded in the checkpoint
        receive: usize,
        /// Actual send length
        send_len: usize,
        /// Actual receive length
        receive_len: usize,
    },

    /// A control operation was invoked after the run was finalized
    #[error("engine is locked: {operation} was called after the run finished (missing await?)")]
    Locked {
        /// The control operation that was attempted
        operation: &'static str,
    },
}
