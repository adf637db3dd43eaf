//! ABOUTME: The user-facing conversation handle: wait, skip, halt, external and friends
//! ABOUTME: Rehydrates stored events into contexts whose outbound calls are logged once

use crate::error::Result;
use crate::framework::{
    make_context, Api, ApiTransport, BotInfo, Context, ContextPlugin, TransportError, UpdateEvent,
    INSIDE_TAG,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colloquy_core::{BuilderFn, Checkpoint, Controls};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cancel tags the manager understands.
pub(crate) const SKIP: &str = "skip";
pub(crate) const DROP: &str = "drop";
pub(crate) const HALT: &str = "halt";
pub(crate) const KILL: &str = "kill";
const REWIND: &str = "rewind";

/// Parsed cancel payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CancelDirective {
    Skip,
    Drop,
    Halt,
    Kill,
    Rewind(Checkpoint),
}

impl CancelDirective {
    pub(crate) fn parse(message: &Value) -> Option<Self> {
        match message {
            Value::String(tag) => match tag.as_str() {
                SKIP => Some(Self::Skip),
                DROP => Some(Self::Drop),
                HALT => Some(Self::Halt),
                KILL => Some(Self::Kill),
                _ => None,
            },
            Value::Object(map) => map
                .get(REWIND)
                .and_then(|checkpoint| serde_json::from_value(checkpoint.clone()).ok())
                .map(Self::Rewind),
            _ => None,
        }
    }
}

/// A user-authored conversation procedure.
///
/// Receives the handle, the context that entered the conversation and the
/// packed `enter` arguments.
pub type ConversationBuilder = Arc<
    dyn Fn(ConversationHandle, Arc<Context>, Value) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// Wrap a plain async closure into a [`ConversationBuilder`].
pub fn conversation_fn<F, Fut>(builder: F) -> ConversationBuilder
where
    F: Fn(ConversationHandle, Arc<Context>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |handle, ctx, args| Box::pin(builder(handle, ctx, args)))
}

/// Everything a handle needs besides its [`Controls`].
pub(crate) struct HandleConfig {
    pub transport: Arc<dyn ApiTransport>,
    pub me: BotInfo,
    pub plugins: Vec<ContextPlugin>,
    pub max_wait: Option<Duration>,
}

/// Adapt a [`ConversationBuilder`] into the engine's builder shape.
///
/// The wrapper performs the initial wait itself, consuming the seeded
/// interrupt every fresh instance starts with, and hands the resulting
/// context to the user procedure.
pub(crate) fn engine_builder(
    builder: ConversationBuilder,
    config: HandleConfig,
    args: Value,
) -> BuilderFn {
    let config = Arc::new(config);
    Arc::new(move |controls| {
        let handle = ConversationHandle::new(controls, Arc::clone(&config));
        let builder = Arc::clone(&builder);
        let args = args.clone();
        Box::pin(async move {
            let entry_ctx = handle.wait().await.map_err(anyhow::Error::from)?;
            builder(handle.clone(), entry_ctx, args).await?;
            Ok(Value::Null)
        })
    })
}

/// The facade a conversation procedure talks to.
///
/// Lives exactly for one engine run; all its operations route through the
/// run's [`Controls`], so everything observable lands in the transcript.
#[derive(Clone)]
pub struct ConversationHandle {
    controls: Controls,
    config: Arc<HandleConfig>,
    first_wait: Arc<AtomicBool>,
}

impl ConversationHandle {
    pub(crate) fn new(controls: Controls, config: Arc<HandleConfig>) -> Self {
        Self {
            controls,
            config,
            first_wait: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Suspend until the next event targeted at this conversation arrives,
    /// rehydrated into a fresh context.
    ///
    /// Outbound calls on the returned context are intercepted so each call
    /// result is logged once and replayed afterwards. When the
    /// conversation declares a maximum wait, the suspension is bracketed
    /// with recorded timestamps and the instance halts when the gap
    /// between arming and the event exceeds the limit.
    pub async fn wait(&self) -> Result<Arc<Context>> {
        let first = !self.first_wait.swap(true, Ordering::SeqCst);
        // The initial wait consumes the seeded interrupt of a fresh
        // instance; there is nothing to time out, the entering event is
        // already here.
        let armed = match (first, self.config.max_wait) {
            (false, Some(_)) => Some(self.now_millis().await?),
            _ => None,
        };
        let payload = self.controls.interrupt("wait").await?;
        if let (Some(armed), Some(max_wait)) = (armed, self.config.max_wait) {
            let resumed = self.now_millis().await?;
            let elapsed = resumed.saturating_sub(armed);
            let limit = i64::try_from(max_wait.as_millis()).unwrap_or(i64::MAX);
            if elapsed > limit {
                warn!(elapsed, limit, "wait exceeded the configured maximum, halting");
                return Err(self.controls.cancel(Value::String(HALT.into())).await.into());
            }
        }
        self.rehydrate(payload)
    }

    /// Abort handling: roll back to before this event was supplied and let
    /// the remaining pending waits (and then the rest of the bot) see it.
    ///
    /// Never resolves; the run ends here.
    pub async fn skip(&self) -> Result<()> {
        Err(self.controls.cancel(Value::String(SKIP.into())).await.into())
    }

    /// Like [`skip`](Self::skip), but the event counts as consumed and is
    /// not handed on. Never resolves; the run ends here.
    pub async fn drop_event(&self) -> Result<()> {
        Err(self.controls.cancel(Value::String(DROP.into())).await.into())
    }

    /// End this conversation instance for good, consuming the event.
    /// Never resolves; the run ends here.
    pub async fn halt(&self) -> Result<()> {
        Err(self.controls.cancel(Value::String(HALT.into())).await.into())
    }

    /// End this conversation instance for good but let the rest of the bot
    /// see the event. Never resolves; the run ends here.
    pub async fn kill(&self) -> Result<()> {
        Err(self.controls.cancel(Value::String(KILL.into())).await.into())
    }

    /// A marker for the current position in the conversation, for
    /// [`rewind`](Self::rewind).
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        Ok(self.controls.checkpoint()?)
    }

    /// Forget everything that happened since `checkpoint` and continue
    /// from there. Never resolves; the manager re-runs the rolled-back
    /// instance immediately.
    pub async fn rewind(&self, checkpoint: Checkpoint) -> Result<()> {
        let message = json!({ REWIND: checkpoint });
        Err(self.controls.cancel(message).await.into())
    }

    /// Run a side-effecting task exactly once per instance lifetime.
    ///
    /// The result is recorded in the transcript; replays return the
    /// recorded value without running `task` again. Errors are recorded as
    /// their message and rethrown on replay; use
    /// [`external_with`](Self::external_with) for typed error roundtrips.
    pub async fn external<T, F, Fut>(&self, task: F) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.external_with(ExternalOp::new(task)).await
    }

    /// [`external`](Self::external) with custom store/load converters.
    pub async fn external_with<T, F, Fut>(&self, op: ExternalOp<T, F>) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let ExternalOp {
            task,
            key,
            before_store,
            after_load,
            before_store_error,
            after_load_error,
        } = op;
        let store_value = Arc::clone(&before_store);
        let store_error = Arc::clone(&before_store_error);
        let recorded = self
            .controls
            .action(&key, move || async move {
                match task().await {
                    Ok(value) => match store_value(&value) {
                        Ok(stored) => json!({ "ok": true, "value": stored }),
                        Err(error) => json!({ "ok": false, "error": store_error(&error) }),
                    },
                    Err(error) => json!({ "ok": false, "error": store_error(&error) }),
                }
            })
            .await?;
        if recorded.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            let stored = recorded.get("value").cloned().unwrap_or(Value::Null);
            after_load(stored)
        } else {
            let stored = recorded.get("error").cloned().unwrap_or(Value::Null);
            Err(after_load_error(stored))
        }
    }

    /// The current wall-clock time, recorded once.
    pub async fn now(&self) -> anyhow::Result<DateTime<Utc>> {
        let millis = self
            .external_with(
                ExternalOp::new(|| async { Ok(Utc::now().timestamp_millis()) }).with_key("now"),
            )
            .await?;
        DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| anyhow::anyhow!("recorded timestamp {millis} is out of range"))
    }

    /// Sleep for `duration`. Replays skip the delay.
    pub async fn sleep(&self, duration: Duration) -> anyhow::Result<()> {
        self.external_with(
            ExternalOp::new(move || async move {
                tokio::time::sleep(duration).await;
                Ok(())
            })
            .with_key("sleep"),
        )
        .await
    }

    /// A random float in `[0, 1)`, recorded once.
    pub async fn random(&self) -> anyhow::Result<f64> {
        self.external_with(ExternalOp::new(|| async { Ok(rand::random::<f64>()) }).with_key("random"))
            .await
    }

    /// Log `message` once per instance lifetime (replays stay silent).
    pub async fn log(&self, message: impl Into<String>) -> anyhow::Result<()> {
        let message = message.into();
        self.external_with(
            ExternalOp::new(move || async move {
                tracing::info!(target: "colloquy::conversation", "{message}");
                Ok(())
            })
            .with_key("log"),
        )
        .await
    }

    async fn now_millis(&self) -> Result<i64> {
        let value = self
            .controls
            .action("now", || async { Value::from(Utc::now().timestamp_millis()) })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    fn rehydrate(&self, payload: Value) -> Result<Arc<Context>> {
        let event: UpdateEvent = serde_json::from_value(payload)?;
        debug!(chat = %event.chat, "rehydrating context");
        let transport: Arc<dyn ApiTransport> = Arc::new(ReplayTransport {
            controls: self.controls.clone(),
            real: Arc::clone(&self.config.transport),
        });
        let ctx = make_context(event, Api::new(transport), self.config.me.clone());
        ctx.mark(INSIDE_TAG);
        for plugin in &self.config.plugins {
            plugin(&ctx);
        }
        Ok(ctx)
    }
}

/// Configuration for one [`external`](ConversationHandle::external) call.
///
/// The success path stores `before_store(value)` and returns
/// `after_load(stored)`; the error path stores `before_store_error(error)`
/// and rethrows `after_load_error(stored)` on every replay.
pub struct ExternalOp<T, F> {
    task: F,
    key: String,
    before_store: Arc<dyn Fn(&T) -> anyhow::Result<Value> + Send + Sync>,
    after_load: Arc<dyn Fn(Value) -> anyhow::Result<T> + Send + Sync>,
    before_store_error: Arc<dyn Fn(&anyhow::Error) -> Value + Send + Sync>,
    after_load_error: Arc<dyn Fn(Value) -> anyhow::Error + Send + Sync>,
}

impl<T, F> ExternalOp<T, F>
where
    T: Serialize + DeserializeOwned,
{
    /// Wrap `task` with serde-based value conversion and message-string
    /// error conversion.
    pub fn new(task: F) -> Self {
        Self {
            task,
            key: "external".to_string(),
            before_store: Arc::new(|value: &T| {
                serde_json::to_value(value).map_err(anyhow::Error::from)
            }),
            after_load: Arc::new(|stored: Value| {
                serde_json::from_value(stored).map_err(anyhow::Error::from)
            }),
            before_store_error: Arc::new(|error: &anyhow::Error| Value::String(error.to_string())),
            after_load_error: Arc::new(|stored: Value| match stored {
                Value::String(message) => anyhow::anyhow!(message),
                other => anyhow::anyhow!(other.to_string()),
            }),
        }
    }
}

impl<T, F> ExternalOp<T, F> {
    /// Override the collation key (defaults to `"external"`).
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Override how successful values are converted before storing.
    pub fn with_before_store(
        mut self,
        convert: impl Fn(&T) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.before_store = Arc::new(convert);
        self
    }

    /// Override how stored values are converted back on load.
    pub fn with_after_load(
        mut self,
        convert: impl Fn(Value) -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> Self {
        self.after_load = Arc::new(convert);
        self
    }

    /// Override how errors are converted before storing.
    pub fn with_before_store_error(
        mut self,
        convert: impl Fn(&anyhow::Error) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.before_store_error = Arc::new(convert);
        self
    }

    /// Override how stored errors are rebuilt on load.
    pub fn with_after_load_error(
        mut self,
        convert: impl Fn(Value) -> anyhow::Error + Send + Sync + 'static,
    ) -> Self {
        self.after_load_error = Arc::new(convert);
        self
    }
}

/// Transport wrapper routing every outbound call through an action op.
///
/// What lands in the transcript is the call's result, never the call
/// itself: successes as plain values, failures dismantled into
/// `{ message, payload }` and rebuilt into [`TransportError`] after load.
struct ReplayTransport {
    controls: Controls,
    real: Arc<dyn ApiTransport>,
}

#[async_trait]
impl ApiTransport for ReplayTransport {
    async fn invoke(
        &self,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, TransportError> {
        let real = Arc::clone(&self.real);
        let method_owned = method.to_string();
        let recorded = self
            .controls
            .action(method, move || async move {
                match real.invoke(&method_owned, params).await {
                    Ok(value) => json!({ "ok": true, "value": value }),
                    Err(error) => json!({
                        "ok": false,
                        "error": { "message": error.message, "payload": error.payload },
                    }),
                }
            })
            .await
            .map_err(|error| {
                // A replay divergence is fatal to the instance; it surfaces
                // through the builder as a failed call.
                TransportError::new(error.to_string(), Value::Null)
            })?;
        if recorded.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            Ok(recorded.get("value").cloned().unwrap_or(Value::Null))
        } else {
            let stored = recorded.get("error").cloned().unwrap_or(Value::Null);
            let message = stored
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("api call failed")
                .to_string();
            let payload = stored.get("payload").cloned().unwrap_or(Value::Null);
            Err(TransportError { message, payload })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_directive_parses_tags() {
        assert_eq!(
            CancelDirective::parse(&json!("skip")),
            Some(CancelDirective::Skip)
        );
        assert_eq!(
            CancelDirective::parse(&json!("drop")),
            Some(CancelDirective::Drop)
        );
        assert_eq!(
            CancelDirective::parse(&json!("halt")),
            Some(CancelDirective::Halt)
        );
        assert_eq!(
            CancelDirective::parse(&json!("kill")),
            Some(CancelDirective::Kill)
        );
        assert_eq!(CancelDirective::parse(&json!("other")), None);
        assert_eq!(CancelDirective::parse(&Value::Null), None);
    }

    #[test]
    fn test_cancel_directive_parses_rewind() {
        let checkpoint = Checkpoint::new(3, 2);
        let message = json!({ "rewind": checkpoint });
        assert_eq!(
            CancelDirective::parse(&message),
            Some(CancelDirective::Rewind(checkpoint))
        );
    }
}
