//! ABOUTME: Replay engine running a user procedure under a Controls facade with a typed outcome
//! ABOUTME: Races the procedure against the boundary and tracks floating work until recorded

use crate::cursor::Cursor;
use crate::error::{EngineError, Result};
use crate::resolver::Resolver;
use crate::state::{Checkpoint, ReplayState};
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Notify;
use tracing::{debug, Instrument};
use uuid::Uuid;

/// The retained user procedure. It receives the run's [`Controls`] and its
/// eventual return value is recorded in the outcome.
pub type BuilderFn =
    Arc<dyn Fn(Controls) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// How a single engine run ended.
#[derive(Debug)]
pub enum RunStatus {
    /// The procedure ran to completion with this return value.
    Returned(Value),
    /// The procedure canceled itself; the payload is the cancel message.
    Canceled(Value),
    /// The run froze on unresolved interrupts; these op indices can each
    /// be supplied with a value to resume.
    Interrupted(Vec<usize>),
    /// The procedure failed.
    Thrown(anyhow::Error),
}

/// Outcome of one run: the updated transcript plus how the run ended.
#[derive(Debug)]
pub struct RunOutcome {
    /// The transcript after the run, including everything recorded by it
    pub state: ReplayState,
    /// How the run ended
    pub status: RunStatus,
}

#[derive(Default)]
struct Flow {
    /// Parked interrupt op indices in registration order
    pending: Vec<usize>,
    /// Latched cancel payload; once set, no further interrupts are recognized
    canceled: Option<Value>,
    /// Emitted action ops whose results are not recorded yet
    in_flight: usize,
    /// Set once the run has an outcome; late control calls are refused
    finalized: bool,
    /// Next receive position to hand to a consumer
    gate_next: usize,
    /// Recorded completions (position -> op index) not yet handed out
    gate_settled: BTreeMap<usize, usize>,
    /// Op indices with a consumer currently awaiting the result
    interested: HashSet<usize>,
}

struct ControlsInner {
    cursor: Cursor,
    flow: Mutex<Flow>,
    notify: Notify,
}

impl ControlsInner {
    /// Hand out completions strictly in recorded receive order.
    ///
    /// A consumer whose completion sits at `position` waits until every
    /// earlier completion was either handed to its own awaiting consumer or
    /// skipped because nobody is awaiting it. This reproduces the recorded
    /// interleaving of continuations on replay: the consumer of completion
    /// n runs up to its next suspension before the consumer of n + 1 is
    /// released.
    async fn observe(&self, position: usize) {
        loop {
            let notified = self.notify.notified();
            let (delivered, advanced) = {
                let mut flow = self.flow.lock();
                let mut advanced = false;
                loop {
                    let head = flow.gate_settled.first_key_value().map(|(p, i)| (*p, *i));
                    match head {
                        Some((pos, index))
                            if pos == flow.gate_next && !flow.interested.contains(&index) =>
                        {
                            flow.gate_settled.remove(&pos);
                            flow.gate_next += 1;
                            advanced = true;
                        }
                        _ => break,
                    }
                }
                if flow.gate_next > position {
                    // Skipped while we were not yet awaiting; pick up late.
                    (true, advanced)
                } else if flow.gate_next == position {
                    flow.gate_settled.remove(&position);
                    flow.gate_next += 1;
                    (true, true)
                } else {
                    (false, advanced)
                }
            };
            if advanced {
                self.notify.notify_waiters();
            }
            if delivered {
                return;
            }
            notified.await;
        }
    }

    fn settle_gate(&self, position: usize, index: usize) {
        self.flow.lock().gate_settled.insert(position, index);
        self.notify.notify_waiters();
    }

    fn end_flight(&self) {
        self.flow.lock().in_flight -= 1;
        self.notify.notify_waiters();
    }
}

/// Marks an op index as having an active consumer for the lifetime of the
/// awaiting future. Registered on first poll, dropped with the future.
struct Interest {
    inner: Arc<ControlsInner>,
    index: usize,
}

impl Interest {
    fn register(inner: Arc<ControlsInner>, index: usize) -> Self {
        inner.flow.lock().interested.insert(index);
        inner.notify.notify_waiters();
        Self { inner, index }
    }
}

impl Drop for Interest {
    fn drop(&mut self) {
        self.inner.flow.lock().interested.remove(&self.index);
        self.inner.notify.notify_waiters();
    }
}

/// A parked interrupt. Registers itself as pending on first poll (that is,
/// the moment replay ran out without a recorded completion) and never
/// resolves; dropping it unregisters the pending entry.
struct Park {
    inner: Arc<ControlsInner>,
    index: usize,
    registered: bool,
}

impl Future for Park {
    type Output = Value;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Value> {
        let this = self.get_mut();
        if !this.registered {
            this.registered = true;
            {
                this.inner.flow.lock().pending.push(this.index);
            }
            this.inner.notify.notify_waiters();
            debug!(index = this.index, "interrupt parked");
        }
        Poll::Pending
    }
}

impl Drop for Park {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        let mut flow = self.inner.flow.lock();
        if let Some(position) = flow.pending.iter().position(|&i| i == self.index) {
            flow.pending.remove(position);
        }
    }
}

/// The control facade handed to the user procedure.
///
/// All non-determinism must flow through these operations: `interrupt` for
/// externally supplied values, `action` for record-once side effects,
/// `cancel` to abandon the run. Everything else the procedure does must be
/// a pure function of what these return.
#[derive(Clone)]
pub struct Controls {
    inner: Arc<ControlsInner>,
}

impl Controls {
    fn new(cursor: Cursor) -> Self {
        Self {
            inner: Arc::new(ControlsInner {
                cursor,
                flow: Mutex::new(Flow::default()),
                notify: Notify::new(),
            }),
        }
    }

    fn locked(&self) -> bool {
        self.inner.flow.lock().finalized
    }

    /// Emit an interrupt op and suspend until a supplied value resolves it.
    ///
    /// A completion already in the transcript resolves during replay, in
    /// recorded order relative to every other completion. Otherwise the
    /// call registers itself as pending and parks forever; the engine
    /// freezes the run once no action is in flight. Dropping the parked
    /// future (a lost `select!` branch, or awaiting it only after the
    /// procedure returned) discards the pending entry.
    pub async fn interrupt(&self, key: &str) -> Result<Value> {
        if self.locked() {
            // A late interrupt parks silently instead of failing: the run
            // is over and nobody can observe the result anyway.
            future::pending::<()>().await;
        }
        let index = self.inner.cursor.op(key)?;
        let _interest = Interest::register(Arc::clone(&self.inner), index);
        let park = Park {
            inner: Arc::clone(&self.inner),
            index,
            registered: false,
        };
        let (value, position) = self.inner.cursor.done(index, park).await?;
        // Registering the position makes it skippable should this future be
        // dropped before the gate hands the value out.
        self.inner.settle_gate(position, index);
        self.inner.observe(position).await;
        Ok(value)
    }

    /// Emit an action op and run `task` exactly once, recording its result.
    ///
    /// The op is emitted synchronously (emission order is call order) and
    /// the recording task is spawned immediately, so an unawaited action
    /// still runs to completion and lands in the transcript before the run
    /// can freeze. The returned future can be awaited or dropped; awaited
    /// results are handed out in recorded completion order. During replay
    /// the recorded result is returned and `task` is never invoked.
    pub fn action<F, Fut>(
        &self,
        key: &str,
        task: F,
    ) -> impl Future<Output = Result<Value>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        enum Setup {
            Failed(EngineError),
            Spawned {
                index: usize,
                resolver: Resolver<Result<(Value, usize)>>,
            },
        }

        let setup = if self.locked() {
            Setup::Failed(EngineError::Locked {
                operation: "action",
            })
        } else {
            match self.inner.cursor.op(key) {
                Err(err) => Setup::Failed(err),
                Ok(index) => {
                    let resolver: Resolver<Result<(Value, usize)>> = Resolver::new();
                    {
                        self.inner.flow.lock().in_flight += 1;
                    }
                    self.inner.notify.notify_waiters();
                    let inner = Arc::clone(&self.inner);
                    let settle = resolver.clone();
                    tokio::spawn(async move {
                        let outcome = inner.cursor.done(index, async move { task().await }).await;
                        if let Ok((_, position)) = &outcome {
                            inner.settle_gate(*position, index);
                        }
                        inner.end_flight();
                        settle.settle(outcome);
                    });
                    Setup::Spawned { index, resolver }
                }
            }
        };

        let inner = Arc::clone(&self.inner);
        async move {
            match setup {
                Setup::Failed(err) => Err(err),
                Setup::Spawned { index, resolver } => {
                    let _interest = Interest::register(Arc::clone(&inner), index);
                    let (value, position) = resolver.future().await?;
                    inner.observe(position).await;
                    Ok(value)
                }
            }
        }
    }

    /// Flag the run as canceled with `message` and park forever.
    ///
    /// Returns only when called after finalization, in which case the
    /// returned value is the lock error for the caller to propagate.
    pub async fn cancel(&self, message: Value) -> EngineError {
        {
            let mut flow = self.inner.flow.lock();
            if flow.finalized {
                return EngineError::Locked {
                    operation: "cancel",
                };
            }
            if flow.canceled.is_none() {
                flow.canceled = Some(message);
            }
        }
        self.inner.notify.notify_waiters();
        future::pending().await
    }

    /// The cursor positions, for transactional rewind.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        if self.locked() {
            return Err(EngineError::Locked {
                operation: "checkpoint",
            });
        }
        Ok(self.inner.cursor.checkpoint())
    }

    /// Resolves once the run must freeze: an interrupt is parked or cancel
    /// was latched, and no action result remains unrecorded.
    async fn boundary(&self) {
        loop {
            let notified = self.inner.notify.notified();
            {
                let flow = self.inner.flow.lock();
                let triggered = flow.canceled.is_some() || !flow.pending.is_empty();
                if triggered && flow.in_flight == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Wait for every in-flight action to be recorded.
    async fn drain(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.flow.lock().in_flight == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Lock the controls and take the final flags.
    fn finalize(&self) -> (Option<Value>, Vec<usize>) {
        let mut flow = self.inner.flow.lock();
        flow.finalized = true;
        (flow.canceled.take(), std::mem::take(&mut flow.pending))
    }
}

/// Deterministic replay engine for one user procedure.
///
/// Running is always a full re-execution: the procedure starts from its
/// first line and the cursor feeds it recorded values until it catches up
/// with the transcript, after which it executes live.
pub struct ReplayEngine {
    builder: BuilderFn,
}

impl ReplayEngine {
    /// Retain the procedure to run.
    pub fn new(builder: BuilderFn) -> Self {
        Self { builder }
    }

    /// Convenience constructor for plain async closures.
    pub fn from_fn<F, Fut>(builder: F) -> Self
    where
        F: Fn(Controls) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(Arc::new(move |controls| Box::pin(builder(controls))))
    }

    /// Run from an empty transcript.
    pub async fn play(&self) -> RunOutcome {
        self.run(ReplayState::new()).await
    }

    /// Resume from an existing transcript.
    pub async fn replay(&self, state: ReplayState) -> RunOutcome {
        self.run(state).await
    }

    /// Seed a transcript that already carries one unresolved interrupt with
    /// the given key. Returns the state and the interrupt's op index.
    pub fn open(first_key: &str) -> (ReplayState, usize) {
        let mut state = ReplayState::new();
        let index = state.op(first_key);
        (state, index)
    }

    /// Record a completion for a pending interrupt. Returns the checkpoint
    /// taken before the mutation so the caller can roll back.
    pub fn supply(state: &mut ReplayState, interrupt: usize, value: Value) -> Result<Checkpoint> {
        let checkpoint = state.checkpoint();
        state.done(interrupt, value)?;
        Ok(checkpoint)
    }

    /// Roll the transcript back to `checkpoint`.
    pub fn reset(state: &mut ReplayState, checkpoint: Checkpoint) -> Result<()> {
        state.reset(checkpoint)
    }

    async fn run(&self, state: ReplayState) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("replay_run", %run_id);
        self.run_inner(state).instrument(span).await
    }

    async fn run_inner(&self, state: ReplayState) -> RunOutcome {
        let cursor = Cursor::new(state);
        let controls = Controls::new(cursor.clone());
        let mut procedure = (self.builder)(controls.clone());

        let finished = tokio::select! {
            biased;
            result = &mut procedure => Some(result),
            () = controls.boundary() => None,
        };

        let status = match finished {
            Some(result) => {
                // The procedure returned (or failed). Floating actions may
                // still be recording; the transcript is not frozen until
                // the in-flight count drains to zero.
                controls.drain().await;
                let (canceled, pending) = controls.finalize();
                match canceled {
                    Some(message) => RunStatus::Canceled(message),
                    None if !pending.is_empty() => RunStatus::Interrupted(pending),
                    None => match result {
                        Ok(value) => RunStatus::Returned(value),
                        Err(error) => RunStatus::Thrown(error),
                    },
                }
            }
            None => {
                // Capture flags before dropping the procedure: dropping
                // unwinds the parked interrupts and clears the pending list.
                let (canceled, pending) = controls.finalize();
                drop(procedure);
                match canceled {
                    Some(message) => RunStatus::Canceled(message),
                    None => RunStatus::Interrupted(pending),
                }
            }
        };

        match &status {
            RunStatus::Returned(_) => debug!("run returned"),
            RunStatus::Canceled(message) => debug!(%message, "run canceled"),
            RunStatus::Interrupted(interrupts) => {
                debug!(count = interrupts.len(), "run interrupted");
            }
            RunStatus::Thrown(error) => debug!(%error, "run threw"),
        }

        RunOutcome {
            state: cursor.snapshot(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wait_once() -> ReplayEngine {
        ReplayEngine::from_fn(|controls| async move {
            let value = controls.interrupt("wait").await?;
            Ok(value)
        })
    }

    #[tokio::test]
    async fn test_single_wait_round_trip() {
        let engine = wait_once();

        let outcome = engine.play().await;
        let RunStatus::Interrupted(interrupts) = outcome.status else {
            panic!("expected interrupted outcome");
        };
        assert_eq!(interrupts.len(), 1);

        let mut state = outcome.state;
        ReplayEngine::supply(&mut state, interrupts[0], json!("event")).unwrap();
        let outcome = engine.replay(state).await;
        let RunStatus::Returned(value) = outcome.status else {
            panic!("expected returned outcome");
        };
        assert_eq!(value, json!("event"));
    }

    #[tokio::test]
    async fn test_parallel_interrupts_either_supply_order() {
        let engine = ReplayEngine::from_fn(|controls| async move {
            let (a, b) = tokio::join!(controls.interrupt("a"), controls.interrupt("b"));
            Ok(json!([a?, b?]))
        });

        let seed = engine.play().await;
        let RunStatus::Interrupted(interrupts) = seed.status else {
            panic!("expected interrupted outcome");
        };
        assert_eq!(interrupts.len(), 2);

        let mut results = Vec::new();
        for order in [[0, 1], [1, 0]] {
            let mut state = seed.state.clone();
            let values = [json!("x"), json!("y")];
            let mut outcome = None;
            for position in order {
                let index = interrupts[position];
                ReplayEngine::supply(&mut state, index, values[position].clone()).unwrap();
                let run = engine.replay(std::mem::take(&mut state)).await;
                state = run.state;
                outcome = Some(run.status);
            }
            let Some(RunStatus::Returned(value)) = outcome else {
                panic!("expected returned outcome");
            };
            results.push((value, state));
        }

        // Same values observed and same send log in either supply order.
        assert_eq!(results[0].0, json!(["x", "y"]));
        assert_eq!(results[1].0, json!(["x", "y"]));
        assert_eq!(results[0].1.send_ops(), results[1].1.send_ops());
    }

    #[tokio::test]
    async fn test_bad_replay_becomes_thrown() {
        let keys = Arc::new(Mutex::new(vec!["a", "b"]));
        let source = Arc::clone(&keys);
        let engine = ReplayEngine::from_fn(move |controls| {
            let key = source.lock().remove(0);
            async move {
                controls.interrupt(key).await?;
                Ok(Value::Null)
            }
        });

        let outcome = engine.play().await;
        let RunStatus::Interrupted(interrupts) = outcome.status else {
            panic!("expected interrupted outcome");
        };

        let mut state = outcome.state;
        ReplayEngine::supply(&mut state, interrupts[0], Value::Null).unwrap();
        // Second invocation presents key "b" where the transcript says "a".
        let outcome = engine.replay(state).await;
        let RunStatus::Thrown(error) = outcome.status else {
            panic!("expected thrown outcome");
        };
        let engine_error = error.downcast::<EngineError>().unwrap();
        assert!(matches!(engine_error, EngineError::BadReplay { .. }));
    }

    #[tokio::test]
    async fn test_floating_action_recorded_before_freeze() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let engine = ReplayEngine::from_fn(move |controls| {
            let counter = Arc::clone(&counter);
            async move {
                // Floating: started, never awaited.
                let _unawaited = controls.action("side-effect", move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    json!("done")
                });
                controls.interrupt("wait").await?;
                Ok(Value::Null)
            }
        });

        let outcome = engine.play().await;
        let RunStatus::Interrupted(interrupts) = outcome.status else {
            panic!("expected interrupted outcome");
        };
        // The action result was recorded before the run froze.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.state.receive_len(), 1);

        let mut state = outcome.state;
        ReplayEngine::supply(&mut state, interrupts[0], Value::Null).unwrap();
        let outcome = engine.replay(state).await;
        assert!(matches!(outcome.status, RunStatus::Returned(_)));
        // Replay did not execute the task again.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_action_results_delivered_in_recorded_order() {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&observed);
        let engine = ReplayEngine::from_fn(move |controls| {
            let log = Arc::clone(&log);
            async move {
                let slow = controls.action("slow", || async {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    json!("slow")
                });
                let fast = controls.action("fast", || async { json!("fast") });
                let slow_log = Arc::clone(&log);
                let fast_log = Arc::clone(&log);
                tokio::join!(
                    async move {
                        let value = slow.await.expect("slow action");
                        slow_log.lock().push(value);
                    },
                    async move {
                        let value = fast.await.expect("fast action");
                        fast_log.lock().push(value);
                    }
                );
                controls.interrupt("wait").await?;
                Ok(Value::Null)
            }
        });

        let outcome = engine.play().await;
        // Emission order slow, fast; completion order fast, slow.
        assert_eq!(outcome.state.payload(0), Some("slow"));
        assert_eq!(outcome.state.payload(1), Some("fast"));
        assert_eq!(outcome.state.receive_ops()[0].send, 1);
        assert_eq!(outcome.state.receive_ops()[1].send, 0);
        let live_order = observed.lock().clone();
        assert_eq!(live_order, vec![json!("fast"), json!("slow")]);

        // Replay hands the results out in the recorded order even though
        // both are instantly available.
        observed.lock().clear();
        let RunStatus::Interrupted(interrupts) = outcome.status else {
            panic!("expected interrupted outcome");
        };
        let mut state = outcome.state;
        ReplayEngine::supply(&mut state, interrupts[0], Value::Null).unwrap();
        let outcome = engine.replay(state).await;
        assert!(matches!(outcome.status, RunStatus::Returned(_)));
        assert_eq!(*observed.lock(), vec![json!("fast"), json!("slow")]);
    }

    #[tokio::test]
    async fn test_cancel_wins_over_interrupts() {
        let engine = ReplayEngine::from_fn(|controls| async move {
            let err = controls.cancel(json!("halt")).await;
            Err(err.into())
        });

        let outcome = engine.play().await;
        let RunStatus::Canceled(message) = outcome.status else {
            panic!("expected canceled outcome");
        };
        assert_eq!(message, json!("halt"));
    }

    #[tokio::test]
    async fn test_builder_error_becomes_thrown() {
        let engine =
            ReplayEngine::from_fn(|_controls| async move { Err(anyhow::anyhow!("boom")) });
        let outcome = engine.play().await;
        let RunStatus::Thrown(error) = outcome.status else {
            panic!("expected thrown outcome");
        };
        assert_eq!(error.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_returned_builder_yields_value() {
        let engine = ReplayEngine::from_fn(|_controls| async move { Ok(json!({"ok": true})) });
        let outcome = engine.play().await;
        let RunStatus::Returned(value) = outcome.status else {
            panic!("expected returned outcome");
        };
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(outcome.state.send_len(), 0);
    }

    #[tokio::test]
    async fn test_controls_locked_after_finalize() {
        let leaked: Arc<Mutex<Option<Controls>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&leaked);
        let engine = ReplayEngine::from_fn(move |controls| {
            let slot = Arc::clone(&slot);
            async move {
                *slot.lock() = Some(controls);
                Ok(Value::Null)
            }
        });
        let outcome = engine.play().await;
        assert!(matches!(outcome.status, RunStatus::Returned(_)));

        let controls = leaked.lock().take().unwrap();
        let err = controls
            .action("late", || async { Value::Null })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Locked { .. }));
        assert!(matches!(
            controls.checkpoint().unwrap_err(),
            EngineError::Locked { .. }
        ));
        assert!(matches!(
            controls.cancel(Value::Null).await,
            EngineError::Locked { .. }
        ));
    }

    #[tokio::test]
    async fn test_dropped_interrupt_branch_is_discarded() {
        let engine = ReplayEngine::from_fn(|controls| async move {
            // The "lost" interrupt loses the race against the action and its
            // branch is dropped; only "kept" may remain pending.
            tokio::select! {
                biased;
                result = controls.action("quick", || async { json!(1) }) => {
                    let _ = result?;
                }
                _ = controls.interrupt("lost") => {}
            }
            controls.interrupt("kept").await?;
            Ok(Value::Null)
        });

        let outcome = engine.play().await;
        let RunStatus::Interrupted(interrupts) = outcome.status else {
            panic!("expected interrupted outcome");
        };
        // Both ops are in the transcript but only "kept" is pending.
        assert_eq!(outcome.state.send_len(), 3);
        assert_eq!(interrupts.len(), 1);
        assert_eq!(outcome.state.payload(interrupts[0]), Some("kept"));
    }

    #[tokio::test]
    async fn test_supply_checkpoint_restores_presupply_state() {
        let engine = wait_once();
        let outcome = engine.play().await;
        let RunStatus::Interrupted(interrupts) = outcome.status else {
            panic!("expected interrupted outcome");
        };

        let mut state = outcome.state;
        let before = state.clone();
        let checkpoint = ReplayEngine::supply(&mut state, interrupts[0], json!("evt")).unwrap();
        assert_ne!(state, before);
        ReplayEngine::reset(&mut state, checkpoint).unwrap();
        assert_eq!(state, before);
    }

    #[tokio::test]
    async fn test_open_seeds_one_pending_interrupt() {
        let (state, index) = ReplayEngine::open("wait");
        assert_eq!(state.send_len(), 1);
        assert_eq!(state.receive_len(), 0);
        assert_eq!(state.pending_ops(), vec![index]);
    }

    #[tokio::test]
    async fn test_action_awaited_after_wait_picks_up_late() {
        // An action started before a wait but awaited only after it.
        let engine = ReplayEngine::from_fn(|controls| async move {
            let pending_action = controls.action("fetch", || async { json!("fetched") });
            let event = controls.interrupt("wait").await?;
            let fetched = pending_action.await?;
            Ok(json!([event, fetched]))
        });

        let outcome = engine.play().await;
        let RunStatus::Interrupted(interrupts) = outcome.status else {
            panic!("expected interrupted outcome");
        };
        let mut state = outcome.state;
        ReplayEngine::supply(&mut state, interrupts[0], json!("evt")).unwrap();
        let outcome = engine.replay(state).await;
        let RunStatus::Returned(value) = outcome.status else {
            panic!("expected returned outcome");
        };
        assert_eq!(value, json!(["evt", "fetched"]));
    }
}
