//! ABOUTME: Single-assignment settleable value with an observable settled flag
//! ABOUTME: Turns external events into awaitable signals for the cursor and engine

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;

enum Slot<T> {
    Pending { default: Option<T> },
    Settled(T),
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

/// A one-shot settleable container.
///
/// `settle` is idempotent, `is_settled` flips exactly once, and any number
/// of callers can await `future()` to receive a clone of the settled value.
pub struct Resolver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Resolver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Resolver<T> {
    /// Create an unsettled resolver with no default value.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Pending { default: None }),
                notify: Notify::new(),
            }),
        }
    }

    /// Create an unsettled resolver carrying a default for `settle_default`.
    pub fn with_default(default: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Pending {
                    default: Some(default),
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Settle with `value`. Second and later calls are no-ops.
    pub fn settle(&self, value: T) {
        let mut slot = self.shared.slot.lock();
        if matches!(*slot, Slot::Settled(_)) {
            return;
        }
        *slot = Slot::Settled(value);
        drop(slot);
        self.shared.notify.notify_waiters();
    }

    /// Settle with the default supplied at construction. A no-op when
    /// already settled or when no default was given.
    pub fn settle_default(&self) {
        let mut slot = self.shared.slot.lock();
        let value = match &mut *slot {
            Slot::Pending { default } => match default.take() {
                Some(value) => value,
                None => return,
            },
            Slot::Settled(_) => return,
        };
        *slot = Slot::Settled(value);
        drop(slot);
        self.shared.notify.notify_waiters();
    }

    /// Whether the resolver has been settled.
    pub fn is_settled(&self) -> bool {
        matches!(*self.shared.slot.lock(), Slot::Settled(_))
    }
}

impl<T: Clone> Resolver<T> {
    /// Await settlement and return a clone of the settled value.
    pub async fn future(&self) -> T {
        loop {
            let notified = self.shared.notify.notified();
            {
                let slot = self.shared.slot.lock();
                if let Slot::Settled(value) = &*slot {
                    return value.clone();
                }
            }
            notified.await;
        }
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("settled", &self.is_settled())
            .finish()
    }
}
