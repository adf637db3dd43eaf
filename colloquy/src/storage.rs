//! ABOUTME: Versioned storage facade normalizing the accepted backend shapes into read/write/delete
//! ABOUTME: Tags stored values with a plugin and user version; mismatches read as empty

use crate::error::{ConversationError, Result};
use crate::framework::Context;
use crate::types::ConversationData;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Version of the envelope layout itself.
// TODO: add a migration hook here once this is bumped past 0.
pub const PLUGIN_DATA_VERSION: u32 = 0;

/// Raw key-based storage backend supplied by the user.
#[async_trait]
pub trait KeyStorage: Send + Sync {
    /// Read the value stored under `key`.
    async fn read(&self, key: &str) -> anyhow::Result<Option<Value>>;
    /// Write `value` under `key`.
    async fn write(&self, key: &str, value: Value) -> anyhow::Result<()>;
    /// Delete the value stored under `key`.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Context-based storage backend supplied by the user.
#[async_trait]
pub trait ContextStorage: Send + Sync {
    /// Read the value stored for this context.
    async fn read(&self, ctx: &Context) -> anyhow::Result<Option<Value>>;
    /// Write `value` for this context.
    async fn write(&self, ctx: &Context, value: Value) -> anyhow::Result<()>;
    /// Delete the value stored for this context.
    async fn delete(&self, ctx: &Context) -> anyhow::Result<()>;
}

/// Derives the storage key from a context; `None` means the update cannot
/// be attributed to a chat and conversations are unavailable for it.
pub type KeyExtractor = Arc<dyn Fn(&Context) -> Option<String> + Send + Sync>;

/// The accepted storage shapes.
#[derive(Clone)]
pub enum StorageConfig {
    /// Key-based backend, optionally with a custom key extractor. Without
    /// one, the chat identifier rendered as a string is the key.
    Key {
        /// The backend itself
        backend: Arc<dyn KeyStorage>,
        /// Optional custom key derivation
        key: Option<KeyExtractor>,
    },
    /// Backend that works on the context directly.
    Context {
        /// The backend itself
        backend: Arc<dyn ContextStorage>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    plugin_version: u32,
    version: Value,
    data: Value,
}

/// Uniform read/write/delete over any accepted storage shape, with
/// version tagging.
#[derive(Clone)]
pub struct VersionedStorage {
    config: StorageConfig,
    version: Value,
}

impl VersionedStorage {
    /// Wrap a storage config with a user-configurable data version.
    pub fn new(config: StorageConfig, version: Value) -> Self {
        Self { config, version }
    }

    /// The default storage: in-memory, keyed by chat id, version 0.
    pub fn in_memory() -> Self {
        Self::new(
            StorageConfig::Key {
                backend: Arc::new(MemoryStorage::new()),
                key: None,
            },
            Value::from(0),
        )
    }

    /// Whether a storage key can be derived for this context at all.
    pub fn available(&self, ctx: &Context) -> bool {
        match &self.config {
            StorageConfig::Key { key: Some(key), .. } => key(ctx).is_some(),
            _ => true,
        }
    }

    fn key_for(&self, ctx: &Context, extractor: &Option<KeyExtractor>) -> Result<String> {
        match extractor {
            Some(key) => key(ctx).ok_or(ConversationError::MissingStorageKey),
            None => Ok(ctx.event().chat.to_string()),
        }
    }

    /// Read this chat's conversation data. Missing records and version
    /// mismatches both read as empty; mismatched data is left in place.
    pub async fn read(&self, ctx: &Context) -> Result<Option<ConversationData>> {
        let raw = match &self.config {
            StorageConfig::Key { backend, key } => {
                let storage_key = self.key_for(ctx, key)?;
                backend
                    .read(&storage_key)
                    .await
                    .map_err(ConversationError::Storage)?
            }
            StorageConfig::Context { backend } => backend
                .read(ctx)
                .await
                .map_err(ConversationError::Storage)?,
        };
        let Some(raw) = raw else {
            return Ok(None);
        };
        let envelope: Envelope = match serde_json::from_value(raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "stored conversation data is malformed, reading as empty");
                return Ok(None);
            }
        };
        if envelope.plugin_version != PLUGIN_DATA_VERSION || envelope.version != self.version {
            debug!(
                plugin_version = envelope.plugin_version,
                "stored conversation data has a different version, reading as empty"
            );
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(envelope.data)?))
    }

    /// Write this chat's conversation data inside a version envelope.
    pub async fn write(&self, ctx: &Context, data: &ConversationData) -> Result<()> {
        let envelope = Envelope {
            plugin_version: PLUGIN_DATA_VERSION,
            version: self.version.clone(),
            data: serde_json::to_value(data)?,
        };
        let value = serde_json::to_value(&envelope)?;
        match &self.config {
            StorageConfig::Key { backend, key } => {
                let storage_key = self.key_for(ctx, key)?;
                backend
                    .write(&storage_key, value)
                    .await
                    .map_err(ConversationError::Storage)
            }
            StorageConfig::Context { backend } => backend
                .write(ctx, value)
                .await
                .map_err(ConversationError::Storage),
        }
    }

    /// Delete this chat's conversation data.
    pub async fn delete(&self, ctx: &Context) -> Result<()> {
        match &self.config {
            StorageConfig::Key { backend, key } => {
                let storage_key = self.key_for(ctx, key)?;
                backend
                    .delete(&storage_key)
                    .await
                    .map_err(ConversationError::Storage)
            }
            StorageConfig::Context { backend } => backend
                .delete(ctx)
                .await
                .map_err(ConversationError::Storage),
        }
    }
}

/// In-memory key-based backend, the default for development and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, Value>,
}

impl MemoryStorage {
    /// An empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyStorage for MemoryStorage {
    async fn read(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn write(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
