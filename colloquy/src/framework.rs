//! ABOUTME: The thin seam towards the host chat framework: events, outbound API, contexts, middleware
//! ABOUTME: The framework itself is an external collaborator; only these interfaces touch the core

use crate::error::ConversationError;
use crate::manager::ConversationControls;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Marker set by `conversations()` to refuse double installation.
pub const INSTALLED_TAG: &str = "colloquy.installed";
/// Marker carried by every context rehydrated inside a conversation.
pub const INSIDE_TAG: &str = "colloquy.inside";
/// Marker set once downstream middleware finished; later mutations of the
/// conversation data would be lost and are refused.
pub const COMPLETE_TAG: &str = "colloquy.complete";

/// Identifier of the chat an update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One incoming update. The payload is opaque to the plugin: it only has
/// to be deep-cloneable and JSON-serializable so it can live in a
/// transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    /// Chat the update belongs to
    pub chat: ChatId,
    /// Framework-defined payload
    pub payload: Value,
}

impl UpdateEvent {
    /// Build an update event.
    pub fn new(chat: ChatId, payload: Value) -> Self {
        Self { chat, payload }
    }
}

/// Structured failure of an outbound API call.
///
/// Carries plain data only, so it can be dismantled into a transcript
/// record and rebuilt after load.
#[derive(Debug, Clone, Error)]
#[error("api call failed: {message}")]
pub struct TransportError {
    /// Human-readable failure description
    pub message: String,
    /// Structured payload the framework attached to the failure
    pub payload: Value,
}

impl TransportError {
    /// Build a transport error.
    pub fn new(message: impl Into<String>, payload: Value) -> Self {
        Self {
            message: message.into(),
            payload,
        }
    }
}

/// The outbound-call driver supplied by the host framework.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// Perform one outbound call.
    async fn invoke(&self, method: &str, params: Value)
        -> std::result::Result<Value, TransportError>;
}

/// Cloneable handle over an [`ApiTransport`].
#[derive(Clone)]
pub struct Api {
    transport: Arc<dyn ApiTransport>,
}

impl Api {
    /// Wrap a transport.
    pub fn new(transport: Arc<dyn ApiTransport>) -> Self {
        Self { transport }
    }

    /// Perform one outbound call.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, TransportError> {
        self.transport.invoke(method, params).await
    }

    /// The underlying transport.
    pub fn transport(&self) -> Arc<dyn ApiTransport> {
        Arc::clone(&self.transport)
    }
}

/// Identity of the bot the framework is running as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotInfo {
    /// Bot account id
    pub id: i64,
    /// Bot account username
    pub username: String,
}

/// Per-update context object handed through the middleware chain.
///
/// Interior-mutable so it can be shared as `Arc<Context>` across the
/// chain: markers live in a tag set keyed by static module constants, and
/// the conversation control surface is installed once by the plugin.
pub struct Context {
    event: UpdateEvent,
    api: Api,
    me: BotInfo,
    tags: Mutex<HashSet<&'static str>>,
    conversation: OnceLock<ConversationControls>,
}

impl Context {
    /// The update this context was created for.
    pub fn event(&self) -> &UpdateEvent {
        &self.event
    }

    /// The outbound API handle.
    pub fn api(&self) -> &Api {
        &self.api
    }

    /// The bot identity.
    pub fn me(&self) -> &BotInfo {
        &self.me
    }

    /// Whether `key` was marked on this context.
    pub fn has_tag(&self, key: &'static str) -> bool {
        self.tags.lock().contains(key)
    }

    /// Mark `key` on this context.
    pub fn mark(&self, key: &'static str) {
        self.tags.lock().insert(key);
    }

    /// The conversation control surface, once `conversations()` ran.
    pub fn conversation(&self) -> std::result::Result<ConversationControls, ConversationError> {
        self.conversation
            .get()
            .cloned()
            .ok_or(ConversationError::NotInstalled)
    }

    pub(crate) fn install_conversation(
        &self,
        controls: ConversationControls,
    ) -> std::result::Result<(), ConversationError> {
        self.conversation
            .set(controls)
            .map_err(|_| ConversationError::AlreadyInstalled)
    }
}

/// The context factory: how the plugin rebuilds a context object from a
/// stored event payload on replay, and how hosts build the outer one.
pub fn make_context(event: UpdateEvent, api: Api, me: BotInfo) -> Arc<Context> {
    Arc::new(Context {
        event,
        api,
        me,
        tags: Mutex::new(HashSet::new()),
        conversation: OnceLock::new(),
    })
}

/// Decorator applied to every context created inside a conversation.
pub type ContextPlugin = Arc<dyn Fn(&Context) + Send + Sync>;

/// Continuation of the middleware chain.
pub type Next = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// One middleware in the host framework's chain.
///
/// Composition itself belongs to the host framework; this trait is only
/// the seam the plugin plugs into.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Handle the update, optionally passing it on via `next`.
    async fn handle(&self, ctx: Arc<Context>, next: Next) -> anyhow::Result<()>;
}

/// Minimal sequential composition, enough to run a chain in tests and
/// small embeddings.
pub async fn run_chain(stack: Vec<Arc<dyn Middleware>>, ctx: Arc<Context>) -> anyhow::Result<()> {
    dispatch(stack, 0, ctx).await
}

fn dispatch(
    stack: Vec<Arc<dyn Middleware>>,
    index: usize,
    ctx: Arc<Context>,
) -> BoxFuture<'static, anyhow::Result<()>> {
    Box::pin(async move {
        match stack.get(index).cloned() {
            None => Ok(()),
            Some(middleware) => {
                let next_ctx = Arc::clone(&ctx);
                let next: Next = Box::new(move || dispatch(stack, index + 1, next_ctx));
                middleware.handle(ctx, next).await
            }
        }
    })
}
