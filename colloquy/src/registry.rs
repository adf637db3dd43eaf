//! ABOUTME: Per-invocation registry of named conversations and their specs
//! ABOUTME: Registration guards against nameless and duplicate conversations

use crate::error::{ConversationError, Result};
use crate::framework::ContextPlugin;
use crate::handle::ConversationBuilder;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Configuration of one named conversation.
#[derive(Default, Clone)]
pub struct ConversationSpec {
    id: Option<String>,
    plugins: Vec<ContextPlugin>,
    max_wait: Option<Duration>,
    parallel: bool,
}

impl ConversationSpec {
    /// An unnamed spec; set an id before registering.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the conversation name.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Add a decorator applied to every context inside the conversation.
    pub fn with_plugin(mut self, plugin: ContextPlugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Halt the instance when more than this much real time passes between
    /// arming a wait and the next event.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Allow multiple simultaneous instances per chat.
    ///
    /// Note that two parallel instances reacting to the same event each run
    /// their own `external` tasks; the plugin does not deduplicate them.
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub(crate) fn id(&self) -> Option<&String> {
        self.id.as_ref()
    }

    pub(crate) fn plugins(&self) -> &[ContextPlugin] {
        &self.plugins
    }

    pub(crate) fn max_wait_duration(&self) -> Option<Duration> {
        self.max_wait
    }

    pub(crate) fn is_parallel(&self) -> bool {
        self.parallel
    }
}

/// A registered conversation: its builder plus the spec-derived flags.
pub(crate) struct RegistryEntry {
    pub builder: ConversationBuilder,
    pub plugins: Vec<ContextPlugin>,
    pub max_wait: Option<Duration>,
    pub parallel: bool,
}

/// Registry of conversations known to the current middleware invocation.
#[derive(Default)]
pub(crate) struct Registry {
    entries: Mutex<HashMap<String, Arc<RegistryEntry>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, name: &str, entry: RegistryEntry) -> Result<()> {
        if name.is_empty() {
            return Err(ConversationError::MissingName);
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(name) {
            return Err(ConversationError::DuplicateName(name.to_string()));
        }
        entries.insert(name.to_string(), Arc::new(entry));
        debug!(name, "conversation registered");
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.lock().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::conversation_fn;

    fn noop_builder() -> ConversationBuilder {
        conversation_fn(|_handle, _ctx, _args| async move { Ok(()) })
    }

    fn entry() -> RegistryEntry {
        RegistryEntry {
            builder: noop_builder(),
            plugins: Vec::new(),
            max_wait: None,
            parallel: false,
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = Registry::new();
        registry.register("order", entry()).unwrap();
        assert!(registry.get("order").is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = Registry::new();
        registry.register("order", entry()).unwrap();
        assert!(matches!(
            registry.register("order", entry()),
            Err(ConversationError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = Registry::new();
        assert!(matches!(
            registry.register("", entry()),
            Err(ConversationError::MissingName)
        ));
    }
}
