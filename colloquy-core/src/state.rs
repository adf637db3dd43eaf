//! ABOUTME: Append-only transcript of ops and completions with checkpoint semantics
//! ABOUTME: The persisted replay state every conversation instance is rebuilt from

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An emitted op. Carries only its collation key; whether it was an
/// interrupt or an action is decided by how it completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOp {
    /// Collation key presented by the procedure when it emitted the op
    pub payload: String,
}

/// A recorded completion referencing an op in the send log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveOp {
    /// Index of the completed op in the send log
    pub send: usize,
    /// The produced or supplied result
    pub return_value: Value,
}

/// A transcript length pair used to roll the state back atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    send: usize,
    receive: usize,
}

impl Checkpoint {
    /// Build a checkpoint from explicit lengths.
    pub fn new(send: usize, receive: usize) -> Self {
        Self { send, receive }
    }

    /// Send length at the moment the checkpoint was taken.
    pub fn send(&self) -> usize {
        self.send
    }

    /// Receive length at the moment the checkpoint was taken.
    pub fn receive(&self) -> usize {
        self.receive
    }
}

/// The transcript: everything a conversation instance observably did.
///
/// Two append-only sequences. `send` holds the ops the procedure emitted in
/// emission order; `receive` holds completions in the order they actually
/// resolved, each referencing an op index. Completion order may differ from
/// emission order; replay re-serializes completions into the recorded order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayState {
    send: Vec<SendOp>,
    receive: Vec<ReceiveOp>,
}

impl ReplayState {
    /// An empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an op and return its index.
    pub fn op(&mut self, payload: impl Into<String>) -> usize {
        self.send.push(SendOp {
            payload: payload.into(),
        });
        self.send.len() - 1
    }

    /// Record a completion for the op at `index`.
    ///
    /// Fails when `index` was never emitted or already completed; both are
    /// transcript invariant violations.
    pub fn done(&mut self, index: usize, return_value: Value) -> Result<()> {
        if index >= self.send.len() {
            return Err(EngineError::CompletionOutOfRange {
                index,
                len: self.send.len(),
            });
        }
        if self.receive.iter().any(|entry| entry.send == index) {
            return Err(EngineError::DuplicateCompletion { index });
        }
        self.receive.push(ReceiveOp {
            send: index,
            return_value,
        });
        Ok(())
    }

    /// Number of emitted ops.
    pub fn send_len(&self) -> usize {
        self.send.len()
    }

    /// Number of recorded completions.
    pub fn receive_len(&self) -> usize {
        self.receive.len()
    }

    /// Collation key of the op at `index`, if emitted.
    pub fn payload(&self, index: usize) -> Option<&str> {
        self.send.get(index).map(|op| op.payload.as_str())
    }

    /// The emitted ops in emission order.
    pub fn send_ops(&self) -> &[SendOp] {
        &self.send
    }

    /// The recorded completions in resolution order.
    pub fn receive_ops(&self) -> &[ReceiveOp] {
        &self.receive
    }

    /// Op indices that were emitted but never completed.
    ///
    /// Actions are always recorded before a run freezes, so after a run
    /// these are exactly the pending interrupts.
    pub fn pending_ops(&self) -> Vec<usize> {
        (0..self.send.len())
            .filter(|index| !self.receive.iter().any(|entry| entry.send == *index))
            .collect()
    }

    /// The current transcript lengths.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            send: self.send.len(),
            receive: self.receive.len(),
        }
    }

    /// Truncate both sequences back to `checkpoint`, atomically undoing
    /// every op and completion recorded since it was taken.
    pub fn reset(&mut self, checkpoint: Checkpoint) -> Result<()> {
        if checkpoint.send > self.send.len() || checkpoint.receive > self.receive.len() {
            return Err(EngineError::InvalidCheckpoint {
                send: checkpoint.send,
                receive: checkpoint.receive,
                send_len: self.send.len(),
                receive_len: self.receive.len(),
            });
        }
        self.send.truncate(checkpoint.send);
        self.receive.truncate(checkpoint.receive);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_op_appends_in_order() {
        let mut state = ReplayState::new();
        assert_eq!(state.op("a"), 0);
        assert_eq!(state.op("b"), 1);
        assert_eq!(state.payload(0), Some("a"));
        assert_eq!(state.payload(1), Some("b"));
        assert_eq!(state.send_len(), 2);
    }

    #[test]
    fn test_done_records_out_of_order() {
        let mut state = ReplayState::new();
        state.op("a");
        state.op("b");
        state.done(1, json!("second")).unwrap();
        state.done(0, json!("first")).unwrap();
        assert_eq!(state.receive_ops()[0].send, 1);
        assert_eq!(state.receive_ops()[1].send, 0);
    }

    #[test]
    fn test_done_rejects_unknown_index() {
        let mut state = ReplayState::new();
        state.op("a");
        let err = state.done(3, Value::Null).unwrap_err();
        assert!(matches!(
            err,
            EngineError::CompletionOutOfRange { index: 3, len: 1 }
        ));
    }

    #[test]
    fn test_done_rejects_duplicate_completion() {
        let mut state = ReplayState::new();
        state.op("a");
        state.done(0, Value::Null).unwrap();
        let err = state.done(0, Value::Null).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateCompletion { index: 0 }));
    }

    #[test]
    fn test_checkpoint_roundtrip_is_noop() {
        let mut state = ReplayState::new();
        state.op("a");
        state.done(0, json!(1)).unwrap();
        let checkpoint = state.checkpoint();
        let before = state.clone();
        state.reset(checkpoint).unwrap();
        assert_eq!(state, before);
    }

    #[test]
    fn test_reset_truncates_both_sequences() {
        let mut state = ReplayState::new();
        state.op("a");
        let checkpoint = state.checkpoint();
        state.op("b");
        state.done(1, json!("x")).unwrap();
        state.reset(checkpoint).unwrap();
        assert_eq!(state.send_len(), 1);
        assert_eq!(state.receive_len(), 0);
        assert_eq!(state.pending_ops(), vec![0]);
    }

    #[test]
    fn test_reset_rejects_forward_checkpoint() {
        let mut state = ReplayState::new();
        state.op("a");
        let err = state.reset(Checkpoint::new(4, 0)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidCheckpoint { .. }));
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut state = ReplayState::new();
        state.op("wait");
        state.done(0, json!({"chat": 7})).unwrap();
        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: ReplayState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, state);
    }
}
