use crate::error::UserOperationError;
use crate::transaction::TransactionMeta;
use crate::types::{UserOperationControllerState, UserOperationMetadata};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot};

const EVENT_CAPACITY: usize = 256;

/// Controller-wide lifecycle events.
#[derive(Clone, Debug)]
pub enum UserOperationEvent {
    Added(UserOperationMetadata),
    StateUpdated(UserOperationControllerState),
    Confirmed(UserOperationMetadata),
    Failed {
        metadata: UserOperationMetadata,
        error: UserOperationError,
    },
    TransactionUpdated(TransactionMeta),
}

/// Reports from a pending-operation tracker back to the controller.
#[derive(Clone, Debug)]
pub enum TrackerEvent {
    Confirmed(UserOperationMetadata),
    Failed {
        metadata: UserOperationMetadata,
        error: UserOperationError,
    },
    Updated(UserOperationMetadata),
}

pub type Outcome = Result<UserOperationMetadata, UserOperationError>;

type Waiters = HashMap<String, Vec<oneshot::Sender<Outcome>>>;

/// Broadcast fan-out plus one-shot waiters keyed by operation id.
pub struct EventHub {
    sender: broadcast::Sender<UserOperationEvent>,
    waiters: Mutex<Waiters>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Locks the waiter map after dropping waiters whose receiver is gone.
    fn lock_waiters(&self) -> MutexGuard<'_, Waiters> {
        let mut waiters = self
            .waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        waiters.retain(|_, pending| {
            pending.retain(|w| !w.is_closed());
            !pending.is_empty()
        });
        waiters
    }

    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sender,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserOperationEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: UserOperationEvent) {
        drop(self.lock_waiters());
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    /// Registers a waiter resolved by the next terminal outcome for `id`.
    pub fn wait_for(&self, id: &str) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.lock_waiters().entry(id.to_string()).or_default().push(tx);
        rx
    }

    /// Resolves and drops every waiter for `id`. Later calls are no-ops.
    pub fn resolve(&self, id: &str, outcome: Outcome) {
        let pending = self.lock_waiters().remove(id).unwrap_or_default();
        for waiter in pending {
            let _ = waiter.send(outcome.clone());
        }
    }
}
