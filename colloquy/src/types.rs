//! ABOUTME: Persisted conversation data types: per-chat instance lists keyed by conversation name
//! ABOUTME: Everything here is JSON-serializable; the storage facade wraps it in a version envelope

use colloquy_core::ReplayState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One suspended conversation instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Packed JSON string of the arguments `enter` was called with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    /// The instance's transcript
    pub replay: ReplayState,
    /// Op indices of the interrupts left unresolved at the last suspension;
    /// any of these could consume the next event
    pub interrupts: Vec<usize>,
}

impl InstanceState {
    /// Pack `args` into a fresh instance around `replay`.
    pub fn new(args: Option<String>, replay: ReplayState, interrupts: Vec<usize>) -> Self {
        Self {
            args,
            replay,
            interrupts,
        }
    }

    /// The unpacked arguments, `Value::Null` when none were given.
    pub fn unpack_args(&self) -> serde_json::Result<Value> {
        match &self.args {
            Some(packed) => serde_json::from_str(packed),
            None => Ok(Value::Null),
        }
    }
}

/// Everything persisted for one chat: conversation name to the ordered
/// list of its live instances. Lists longer than one only occur for
/// conversations marked parallel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationData(pub HashMap<String, Vec<InstanceState>>);

impl ConversationData {
    /// Whether no instance is stored at all.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Drop names whose instance list emptied out. Keeps the persisted
    /// record free of leftover empty arrays.
    pub fn prune(&mut self) {
        self.0.retain(|_, instances| !instances.is_empty());
    }

    /// Number of live instances of `name`.
    pub fn active(&self, name: &str) -> usize {
        self.0.get(name).map_or(0, Vec::len)
    }

    /// Live instance counts for every conversation name.
    pub fn active_counts(&self) -> HashMap<String, usize> {
        self.0
            .iter()
            .filter(|(_, instances)| !instances.is_empty())
            .map(|(name, instances)| (name.clone(), instances.len()))
            .collect()
    }

    /// Total number of live instances across all names.
    pub fn total_active(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}
