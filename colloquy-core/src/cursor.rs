//! ABOUTME: Reading/writing pointer over a replay state merging replay-from-log with live execution
//! ABOUTME: Serializes concurrent op completions into the recorded order on replay

use crate::error::{EngineError, Result};
use crate::state::{Checkpoint, ReplayState};
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::trace;

struct Fields {
    state: ReplayState,
    send_pos: usize,
    recv_pos: usize,
}

struct Inner {
    fields: Mutex<Fields>,
    notify: Notify,
}

/// Cursor over one [`ReplayState`].
///
/// Carries two read positions, `send_pos` and `recv_pos`. While a position
/// is inside the recorded log the cursor replays; past the end it executes
/// live and appends. Waiters are woken whenever either position advances,
/// which is what serializes concurrent completions into the recorded order.
#[derive(Clone)]
pub struct Cursor {
    inner: Arc<Inner>,
}

impl Cursor {
    /// Wrap a replay state. Both positions start at zero.
    pub fn new(state: ReplayState) -> Self {
        Self {
            inner: Arc::new(Inner {
                fields: Mutex::new(Fields {
                    state,
                    send_pos: 0,
                    recv_pos: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Step over the next op.
    ///
    /// During replay the presented key must equal the recorded one at the
    /// same position; a mismatch is a fatal bad-replay error. Past the log
    /// the op is appended. Returns the op index either way.
    pub fn op(&self, payload: &str) -> Result<usize> {
        let index = {
            let mut fields = self.inner.fields.lock();
            let index = if fields.send_pos < fields.state.send_len() {
                let recorded = &fields.state.send_ops()[fields.send_pos].payload;
                if recorded != payload {
                    return Err(EngineError::BadReplay {
                        index: fields.send_pos,
                        expected: recorded.clone(),
                        found: payload.to_string(),
                    });
                }
                fields.send_pos
            } else {
                fields.state.op(payload)
            };
            fields.send_pos = index + 1;
            index
        };
        self.inner.notify.notify_waiters();
        trace!(index, key = payload, "op stepped");
        Ok(index)
    }

    /// Resolve the op at `index` and return its value together with the
    /// receive position the completion holds in the transcript.
    ///
    /// While recorded completions remain, the caller waits for the entry at
    /// `recv_pos` to reference its own index, yielding to other cursor users
    /// in between. Once the recorded completions are exhausted, `produce` is
    /// polled live and its result appended. `produce` is lazy: an op whose
    /// completion was recorded never runs it, and an op that is never
    /// resolved parks here forever (its `produce` never resolves).
    pub async fn done(
        &self,
        index: usize,
        produce: impl Future<Output = Value>,
    ) -> Result<(Value, usize)> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut fields = self.inner.fields.lock();
                if fields.recv_pos < fields.state.receive_len() {
                    let entry = &fields.state.receive_ops()[fields.recv_pos];
                    if entry.send == index {
                        let value = entry.return_value.clone();
                        let position = fields.recv_pos;
                        fields.recv_pos += 1;
                        drop(fields);
                        self.inner.notify.notify_waiters();
                        trace!(index, position, "completion replayed");
                        return Ok((value, position));
                    }
                    // not our turn yet
                } else {
                    break;
                }
            }
            notified.await;
        }

        let value = produce.await;
        let position = {
            let mut fields = self.inner.fields.lock();
            fields.state.done(index, value.clone())?;
            fields.recv_pos = fields.state.receive_len();
            fields.recv_pos - 1
        };
        self.inner.notify.notify_waiters();
        trace!(index, position, "completion recorded live");
        Ok((value, position))
    }

    /// Step over an op and resolve it in one go, discarding the position.
    pub async fn perform(
        &self,
        payload: &str,
        produce: impl Future<Output = Value>,
    ) -> Result<Value> {
        let index = self.op(payload)?;
        let (value, _position) = self.done(index, produce).await?;
        Ok(value)
    }

    /// The cursor positions as a checkpoint.
    pub fn checkpoint(&self) -> Checkpoint {
        let fields = self.inner.fields.lock();
        Checkpoint::new(fields.send_pos, fields.recv_pos)
    }

    /// Clone out the current state.
    pub fn snapshot(&self) -> ReplayState {
        self.inner.fields.lock().state.clone()
    }
}
