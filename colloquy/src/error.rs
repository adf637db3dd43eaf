//! ABOUTME: Error types for the conversation plugin covering usage errors and engine fatalities
//! ABOUTME: Provides the crate-wide Result alias used by the handle, manager and storage facade

use colloquy_core::EngineError;
use thiserror::Error;

/// Result type alias for conversation plugin operations
pub type Result<T> = std::result::Result<T, ConversationError>;

/// Errors surfaced by the conversation plugin.
///
/// Usage errors are programmer mistakes and fail immediately; engine
/// errors mean the instance's transcript can no longer be replayed and the
/// instance is discarded; builder errors carry whatever the user procedure
/// failed with.
#[derive(Debug, Error)]
pub enum ConversationError {
    /// The conversations plugin was installed twice on one chain
    #[error("the conversations plugin is already installed on this context")]
    AlreadyInstalled,

    /// The conversations plugin was installed on a context created inside
    /// a conversation
    #[error("the conversations plugin cannot be installed inside a conversation")]
    InsideConversation,

    /// A conversation primitive was used without the plugin installed
    #[error("the conversations plugin is not installed (install conversations() upstream)")]
    NotInstalled,

    /// A conversation was registered without a name
    #[error("conversation has no name (set an id on the conversation spec)")]
    MissingName,

    /// Two conversations were registered under one name
    #[error("a conversation named {0:?} is already registered")]
    DuplicateName(String),

    /// `enter` was called for a name that was never registered
    #[error("unknown conversation {0:?}")]
    UnknownConversation(String),

    /// `enter` would create a second instance of a non-parallel conversation
    #[error("cannot enter {0:?}: another conversation is already active in this chat")]
    AlreadyActive(String),

    /// `enter` or `exit` was called after downstream middleware finished,
    /// so the mutation would never be persisted
    #[error("conversation control used after the middleware completed")]
    AfterCompletion,

    /// No storage key could be derived for the current update
    #[error("no storage key could be derived for this update")]
    MissingStorageKey,

    /// The transcript can no longer be replayed
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The user procedure failed
    #[error("conversation builder failed: {0}")]
    Builder(#[source] anyhow::Error),

    /// The storage backend failed
    #[error("storage backend error: {0}")]
    Storage(#[source] anyhow::Error),

    /// Persisted data could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
