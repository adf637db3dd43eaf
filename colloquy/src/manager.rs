//! ABOUTME: Conversation manager middleware: loads transcripts per chat, dispatches events to
//! ABOUTME: suspended instances with skip/drop/halt/kill/rewind semantics, and persists mutations

use crate::error::{ConversationError, Result};
use crate::framework::{
    ApiTransport, BotInfo, Context, ContextPlugin, Middleware, Next, UpdateEvent, COMPLETE_TAG,
    INSIDE_TAG, INSTALLED_TAG,
};
use crate::handle::{engine_builder, CancelDirective, ConversationBuilder, HandleConfig};
use crate::registry::{ConversationSpec, Registry, RegistryEntry};
use crate::storage::VersionedStorage;
use crate::types::{ConversationData, InstanceState};
use async_trait::async_trait;
use colloquy_core::{ReplayEngine, RunStatus};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info_span, Instrument};

/// Callback fired with the conversation name on enter and exit.
pub type LifecycleHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Options for the outer [`conversations`] middleware.
#[derive(Clone)]
pub struct ConversationsOptions {
    storage: VersionedStorage,
    plugins: Vec<ContextPlugin>,
    on_enter: Option<LifecycleHook>,
    on_exit: Option<LifecycleHook>,
}

impl Default for ConversationsOptions {
    fn default() -> Self {
        Self {
            storage: VersionedStorage::in_memory(),
            plugins: Vec::new(),
            on_enter: None,
            on_exit: None,
        }
    }
}

impl ConversationsOptions {
    /// Options with the in-memory default storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this storage facade instead of the in-memory default.
    pub fn with_storage(mut self, storage: VersionedStorage) -> Self {
        self.storage = storage;
        self
    }

    /// Decorate every context created inside any conversation.
    pub fn with_plugin(mut self, plugin: ContextPlugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Fire this callback whenever a conversation is entered.
    pub fn on_enter(mut self, hook: LifecycleHook) -> Self {
        self.on_enter = Some(hook);
        self
    }

    /// Fire this callback once per instance removed by an `exit` call.
    pub fn on_exit(mut self, hook: LifecycleHook) -> Self {
        self.on_exit = Some(hook);
        self
    }
}

/// Build the outer conversations middleware. Install it upstream of every
/// [`create_conversation`] middleware.
pub fn conversations(options: ConversationsOptions) -> Arc<Conversations> {
    Arc::new(Conversations {
        options: Arc::new(options),
    })
}

/// The outer plugin middleware. See [`conversations`].
pub struct Conversations {
    options: Arc<ConversationsOptions>,
}

#[async_trait]
impl Middleware for Conversations {
    async fn handle(&self, ctx: Arc<Context>, next: Next) -> anyhow::Result<()> {
        if ctx.has_tag(INSIDE_TAG) {
            return Err(ConversationError::InsideConversation.into());
        }
        if ctx.has_tag(INSTALLED_TAG) {
            return Err(ConversationError::AlreadyInstalled.into());
        }
        ctx.mark(INSTALLED_TAG);

        let storage = self.options.storage.clone();
        if !storage.available(&ctx) {
            debug!("no storage key for this update, conversations unavailable");
            return next().await;
        }

        let loaded = storage.read(&ctx).await?;
        let loaded_nonempty = loaded.as_ref().is_some_and(|data| !data.is_empty());
        let state = Arc::new(PluginState {
            registry: Registry::new(),
            data: Mutex::new(loaded.unwrap_or_default()),
            loaded_nonempty,
            completed: AtomicBool::new(false),
            event: ctx.event().clone(),
            transport: ctx.api().transport(),
            me: ctx.me().clone(),
            plugins: self.options.plugins.clone(),
            on_enter: self.options.on_enter.clone(),
            on_exit: self.options.on_exit.clone(),
        });
        ctx.install_conversation(ConversationControls {
            state: Arc::clone(&state),
        })?;

        let result = next().await;

        // Later enter/exit calls would mutate data that is never written
        // back; refuse them from here on.
        state.completed.store(true, Ordering::SeqCst);
        ctx.mark(COMPLETE_TAG);

        let data = {
            let mut data = state.data.lock();
            data.prune();
            data.clone()
        };
        if data.is_empty() {
            if state.loaded_nonempty {
                storage.delete(&ctx).await?;
            }
        } else {
            storage.write(&ctx, &data).await?;
        }

        result
    }
}

/// Register a named conversation and dispatch events to its stored
/// instances. Must run downstream of [`conversations`].
pub fn create_conversation(
    name: impl Into<String>,
    builder: ConversationBuilder,
) -> Arc<CreateConversation> {
    create_conversation_with(ConversationSpec::new().with_id(name), builder)
}

/// [`create_conversation`] with a full [`ConversationSpec`].
pub fn create_conversation_with(
    spec: ConversationSpec,
    builder: ConversationBuilder,
) -> Arc<CreateConversation> {
    Arc::new(CreateConversation { spec, builder })
}

/// Middleware for one named conversation. See [`create_conversation`].
pub struct CreateConversation {
    spec: ConversationSpec,
    builder: ConversationBuilder,
}

#[async_trait]
impl Middleware for CreateConversation {
    async fn handle(&self, ctx: Arc<Context>, next: Next) -> anyhow::Result<()> {
        let controls = ctx.conversation()?;
        let name = self
            .spec
            .id()
            .cloned()
            .ok_or(ConversationError::MissingName)?;
        controls.register(
            &name,
            RegistryEntry {
                builder: Arc::clone(&self.builder),
                plugins: self.spec.plugins().to_vec(),
                max_wait: self.spec.max_wait_duration(),
                parallel: self.spec.is_parallel(),
            },
        )?;
        let consumed = controls
            .resume_for(&name)
            .instrument(info_span!("resume_conversation", %name))
            .await?;
        if consumed {
            Ok(())
        } else {
            next().await
        }
    }
}

struct PluginState {
    registry: Registry,
    data: Mutex<ConversationData>,
    loaded_nonempty: bool,
    completed: AtomicBool,
    event: UpdateEvent,
    transport: Arc<dyn ApiTransport>,
    me: BotInfo,
    plugins: Vec<ContextPlugin>,
    on_enter: Option<LifecycleHook>,
    on_exit: Option<LifecycleHook>,
}

enum InstanceOutcome {
    /// Instance finished; `next` says whether the event should travel on.
    Complete { next: bool },
    /// Instance consumed the event and suspended again.
    Handled { instance: InstanceState },
    /// Instance did not handle the event and is unchanged.
    Skipped { next: bool },
    /// The procedure failed; the instance is discarded and the error
    /// rethrown.
    Failed(anyhow::Error),
}

impl PluginState {
    /// Drive one instance with the current event, per pending interrupt.
    async fn resume_instance(
        &self,
        entry: &RegistryEntry,
        instance: &InstanceState,
    ) -> Result<InstanceOutcome> {
        let args = instance.unpack_args()?;
        let engine = ReplayEngine::new(engine_builder(
            Arc::clone(&entry.builder),
            HandleConfig {
                transport: Arc::clone(&self.transport),
                me: self.me.clone(),
                plugins: self
                    .plugins
                    .iter()
                    .chain(entry.plugins.iter())
                    .cloned()
                    .collect(),
                max_wait: entry.max_wait,
            },
            args,
        ));
        let event_payload = serde_json::to_value(&self.event)?;

        let mut state = instance.replay.clone();
        let mut next = false;
        for &interrupt in &instance.interrupts {
            let checkpoint = ReplayEngine::supply(&mut state, interrupt, event_payload.clone())?;
            loop {
                let run = engine.replay(std::mem::take(&mut state)).await;
                state = run.state;
                match run.status {
                    RunStatus::Returned(_) => return Ok(InstanceOutcome::Complete { next: false }),
                    RunStatus::Thrown(error) => return Ok(InstanceOutcome::Failed(error)),
                    RunStatus::Interrupted(interrupts) => {
                        return Ok(InstanceOutcome::Handled {
                            instance: InstanceState::new(instance.args.clone(), state, interrupts),
                        });
                    }
                    RunStatus::Canceled(message) => match CancelDirective::parse(&message) {
                        Some(CancelDirective::Skip) => {
                            ReplayEngine::reset(&mut state, checkpoint)?;
                            next = true;
                            break;
                        }
                        Some(CancelDirective::Drop) => {
                            ReplayEngine::reset(&mut state, checkpoint)?;
                            return Ok(InstanceOutcome::Skipped { next: false });
                        }
                        Some(CancelDirective::Halt) => {
                            return Ok(InstanceOutcome::Complete { next: false });
                        }
                        Some(CancelDirective::Kill) => {
                            return Ok(InstanceOutcome::Complete { next: true });
                        }
                        Some(CancelDirective::Rewind(to)) => {
                            debug!(?to, "rewinding instance");
                            ReplayEngine::reset(&mut state, to)?;
                        }
                        None => {
                            return Ok(InstanceOutcome::Failed(anyhow::anyhow!(
                                "unrecognized cancel payload: {message}"
                            )));
                        }
                    },
                }
            }
        }
        Ok(InstanceOutcome::Skipped { next })
    }
}

/// The control surface exposed on the context as `ctx.conversation()`.
#[derive(Clone)]
pub struct ConversationControls {
    state: Arc<PluginState>,
}

impl ConversationControls {
    pub(crate) fn register(&self, name: &str, entry: RegistryEntry) -> Result<()> {
        self.state.registry.register(name, entry)
    }

    /// Enter the conversation `name`, driving it with the current event.
    ///
    /// `args` are packed into the instance and handed to the builder on
    /// every run; pass `Value::Null` for none.
    pub async fn enter(&self, name: &str, args: Value) -> Result<()> {
        self.ensure_open()?;
        let entry = self
            .state
            .registry
            .get(name)
            .ok_or_else(|| ConversationError::UnknownConversation(name.to_string()))?;
        if !entry.parallel && self.state.data.lock().total_active() > 0 {
            return Err(ConversationError::AlreadyActive(name.to_string()));
        }
        if let Some(hook) = &self.state.on_enter {
            hook(name);
        }
        debug!(name, "entering conversation");

        let (seed, first) = ReplayEngine::open("wait");
        let packed = if args.is_null() {
            None
        } else {
            Some(serde_json::to_string(&args)?)
        };
        let instance = InstanceState::new(packed, seed, vec![first]);
        match self.state.resume_instance(&entry, &instance).await? {
            InstanceOutcome::Complete { .. } => Ok(()),
            InstanceOutcome::Failed(error) => Err(ConversationError::Builder(error)),
            InstanceOutcome::Handled { instance } => {
                self.push_instance(name, instance);
                Ok(())
            }
            InstanceOutcome::Skipped { .. } => {
                self.push_instance(name, instance);
                Ok(())
            }
        }
    }

    /// Remove every instance of `name`, firing `on_exit` per instance.
    pub fn exit(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let removed = self
            .state
            .data
            .lock()
            .0
            .remove(name)
            .map_or(0, |instances| instances.len());
        self.fire_exit(name, removed);
        Ok(())
    }

    /// Remove every instance of every conversation.
    pub fn exit_all(&self) -> Result<()> {
        self.ensure_open()?;
        let drained: Vec<(String, usize)> = self
            .state
            .data
            .lock()
            .0
            .drain()
            .map(|(name, instances)| (name, instances.len()))
            .collect();
        for (name, count) in drained {
            self.fire_exit(&name, count);
        }
        Ok(())
    }

    /// Remove the instance of `name` at `index`, if it exists.
    pub fn exit_one(&self, name: &str, index: usize) -> Result<()> {
        self.ensure_open()?;
        let removed = {
            let mut data = self.state.data.lock();
            match data.0.get_mut(name) {
                Some(instances) if index < instances.len() => {
                    instances.remove(index);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.fire_exit(name, 1);
        }
        Ok(())
    }

    /// Number of live instances of `name` in this chat.
    pub fn active(&self, name: &str) -> usize {
        self.state.data.lock().active(name)
    }

    /// Live instance counts per conversation name.
    pub fn active_counts(&self) -> HashMap<String, usize> {
        self.state.data.lock().active_counts()
    }

    /// Resume the stored instances of `name` in order until one handles
    /// the current event. Returns whether the event was consumed.
    pub(crate) async fn resume_for(&self, name: &str) -> Result<bool> {
        let Some(entry) = self.state.registry.get(name) else {
            return Ok(false);
        };
        let instances: Vec<InstanceState> = self
            .state
            .data
            .lock()
            .0
            .get(name)
            .cloned()
            .unwrap_or_default();
        if instances.is_empty() {
            return Ok(false);
        }

        let mut replacements: Vec<Option<InstanceState>> =
            instances.iter().cloned().map(Some).collect();
        let mut consumed = false;
        let mut failure = None;
        for (slot, instance) in instances.iter().enumerate() {
            match self.state.resume_instance(&entry, instance).await? {
                InstanceOutcome::Complete { next } => {
                    debug!(name, slot, "instance completed");
                    replacements[slot] = None;
                    if !next {
                        consumed = true;
                        break;
                    }
                }
                InstanceOutcome::Failed(error) => {
                    replacements[slot] = None;
                    failure = Some(error);
                    break;
                }
                InstanceOutcome::Handled { instance } => {
                    debug!(name, slot, "instance handled the event");
                    replacements[slot] = Some(instance);
                    consumed = true;
                    break;
                }
                InstanceOutcome::Skipped { next } => {
                    debug!(name, slot, next, "instance skipped the event");
                    if !next {
                        consumed = true;
                        break;
                    }
                }
            }
        }

        {
            let mut data = self.state.data.lock();
            let survivors: Vec<InstanceState> = replacements.into_iter().flatten().collect();
            if survivors.is_empty() {
                data.0.remove(name);
            } else {
                data.0.insert(name.to_string(), survivors);
            }
        }

        match failure {
            Some(error) => Err(ConversationError::Builder(error)),
            None => Ok(consumed),
        }
    }

    fn push_instance(&self, name: &str, instance: InstanceState) {
        self.state
            .data
            .lock()
            .0
            .entry(name.to_string())
            .or_default()
            .push(instance);
    }

    fn fire_exit(&self, name: &str, count: usize) {
        if let Some(hook) = &self.state.on_exit {
            for _ in 0..count {
                hook(name);
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.completed.load(Ordering::SeqCst) {
            return Err(ConversationError::AfterCompletion);
        }
        Ok(())
    }
}
