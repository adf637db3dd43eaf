// ABOUTME: Main entry point for colloquy-core providing the deterministic replay engine
// ABOUTME: Exports the transcript, cursor, resolver and engine types

//! # colloquy-core
//!
//! The deterministic replay engine behind colloquy conversations.
//!
//! A conversation is an ordinary async procedure that may suspend on
//! external events across arbitrarily long real time, including process
//! restarts. The engine makes that possible by logging every
//! non-deterministic observation (action results, supplied events) into an
//! append-only transcript and re-executing the procedure from the start on
//! every resumption, feeding the logged values back until it reaches the
//! exact state it had before.
//!
//! ## Example
//!
//! ```rust,no_run
//! use colloquy_core::{ReplayEngine, RunStatus};
//! use serde_json::json;
//!
//! # async fn demo() {
//! let engine = ReplayEngine::from_fn(|controls| async move {
//!     let event = controls.interrupt("wait").await?;
//!     Ok(event)
//! });
//!
//! let outcome = engine.play().await;
//! if let RunStatus::Interrupted(interrupts) = outcome.status {
//!     let mut state = outcome.state;
//!     ReplayEngine::supply(&mut state, interrupts[0], json!("hello")).unwrap();
//!     let outcome = engine.replay(state).await;
//!     assert!(matches!(outcome.status, RunStatus::Returned(_)));
//! }
//! # }
//! ```

pub mod cursor;
pub mod engine;
pub mod error;
pub mod resolver;
pub mod state;

pub use cursor::Cursor;
pub use engine::{BuilderFn, Controls, ReplayEngine, RunOutcome, RunStatus};
pub use error::{EngineError, Result};
pub use resolver::Resolver;
pub use state::{Checkpoint, ReceiveOp, ReplayState, SendOp};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
