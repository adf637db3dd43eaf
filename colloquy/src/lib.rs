// ABOUTME: Main entry point for the colloquy crate providing durable chat-bot conversations
// ABOUTME: Exports the middleware constructors, the conversation handle and the storage facade

//! # colloquy
//!
//! Durable multi-turn conversations for event-driven chat bots.
//!
//! A conversation is a plain async procedure written as straight-line
//! code. It may suspend on incoming events for arbitrarily long real time,
//! across process restarts, because every observation it makes is logged
//! into a per-chat transcript and replayed on resumption (see
//! [`colloquy_core`]).
//!
//! ## Example
//!
//! ```rust,no_run
//! use colloquy::{
//!     conversation_fn, conversations, create_conversation, ConversationsOptions,
//! };
//! use serde_json::json;
//!
//! let order = conversation_fn(|convo, ctx, _args| async move {
//!     ctx.api()
//!         .call("sendMessage", json!({ "text": "what would you like?" }))
//!         .await?;
//!     let answer = convo.wait().await?;
//!     answer
//!         .api()
//!         .call("sendMessage", json!({ "text": "coming right up" }))
//!         .await?;
//!     Ok(())
//! });
//!
//! // Install in the host framework's chain, upstream middleware first:
//! let _plugin = conversations(ConversationsOptions::new());
//! let _order = create_conversation("order", order);
//! ```

pub mod error;
pub mod framework;
pub mod handle;
pub mod manager;
pub mod registry;
pub mod storage;
pub mod types;

pub use error::{ConversationError, Result};
pub use framework::{
    make_context, run_chain, Api, ApiTransport, BotInfo, ChatId, Context, ContextPlugin,
    Middleware, Next, TransportError, UpdateEvent,
};
pub use handle::{conversation_fn, ConversationBuilder, ConversationHandle, ExternalOp};
pub use manager::{
    conversations, create_conversation, create_conversation_with, ConversationControls,
    Conversations, ConversationsOptions, CreateConversation, LifecycleHook,
};
pub use registry::ConversationSpec;
pub use storage::{
    ContextStorage, KeyExtractor, KeyStorage, MemoryStorage, StorageConfig, VersionedStorage,
};
pub use types::{ConversationData, InstanceState};

// Re-export the engine surface for advanced embeddings.
pub use colloquy_core::{Checkpoint, Controls, ReplayEngine, ReplayState, RunOutcome, RunStatus};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
