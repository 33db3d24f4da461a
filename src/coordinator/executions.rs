//! Per-execution state on the coordinator.
//!
//! Each dispatched execution gets an [`ExecutionState`]: a bounded event
//! queue feeding at most one SSE subscriber, plus a terminal-event slot.
//!
//! Queue discipline:
//!
//! - Log events go through the bounded queue with a non-blocking send; a
//!   full queue drops the event (with a warning) rather than stall the
//!   broker event loop.
//! - The completion event never enters the queue. The first result message
//!   takes the queue's sender out of the state (making completion
//!   idempotent — a QoS 1 redelivery finds nothing to take), stores the
//!   terminal event in its own slot, and drops the sender to close the
//!   queue. The streamer emits buffered logs, then the terminal event, so
//!   completion is delivered even when the queue overflowed.
//! - Late logs arriving after completion find no sender and are dropped.
//!
//! States are reaped 60 seconds after completion; the registry itself is a
//! read-write-locked map keyed by execution id.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{Completion, LogEntry, ResultResponse, StreamEvent};

/// Maximum buffered events per execution.
pub const EVENT_QUEUE_CAPACITY: usize = 1000;

/// How long completed executions remain queryable.
pub const COMPLETED_TTL: Duration = Duration::from_secs(60);

/// Coordinator-local state for one outstanding execution.
#[derive(Debug)]
pub struct ExecutionState {
    pub execution_id: Uuid,
    pub action_name: String,
    /// Producer side of the event queue; taken (and dropped) on completion.
    events_tx: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    /// Consumer side; claimed by the first SSE subscriber.
    events_rx: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    /// Terminal event, set exactly once.
    terminal: Mutex<Option<StreamEvent>>,
}

impl ExecutionState {
    fn new(execution_id: Uuid, action_name: String) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            execution_id,
            action_name,
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            terminal: Mutex::new(None),
        }
    }

    /// Enqueue one log event, non-blocking.
    ///
    /// Drops the event when the queue is full (slow or absent SSE reader) or
    /// already closed (log raced past completion).
    pub fn push_log(&self, entry: LogEntry) {
        let guard = match self.events_tx.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        let Some(tx) = guard.as_ref() else {
            log::debug!("[coordinator] dropping late log for {}", self.execution_id);
            return;
        };
        match tx.try_send(StreamEvent::Log { data: entry }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "[coordinator] dropping log event for {}: buffer full",
                    self.execution_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Record the terminal result and close the event queue.
    ///
    /// Returns `true` on the first call; QoS 1 redeliveries return `false`
    /// and change nothing.
    pub fn complete(&self, result: ResultResponse) -> bool {
        let Ok(mut tx_guard) = self.events_tx.lock() else { return false };
        let Some(tx) = tx_guard.take() else {
            return false;
        };
        if let Ok(mut terminal) = self.terminal.lock() {
            *terminal = Some(StreamEvent::Complete { data: Completion::from(result) });
        }
        // Dropping the only sender closes the queue; the streamer sees
        // end-of-queue after the buffered logs.
        drop(tx);
        drop(tx_guard);
        true
    }

    /// Claim the queue's consumer; only the first subscriber gets it.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// The terminal event, if the execution has completed.
    pub fn terminal_event(&self) -> Option<StreamEvent> {
        self.terminal.lock().ok().and_then(|t| t.clone())
    }

    pub fn is_completed(&self) -> bool {
        self.terminal.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    /// Stable state label for the status endpoint.
    pub fn state_label(&self) -> &'static str {
        match self.terminal.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(StreamEvent::Complete { data }) => data.state.as_str(),
                _ => "PENDING",
            },
            Err(_) => "PENDING",
        }
    }
}

/// All outstanding executions, keyed by id.
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    executions: RwLock<HashMap<Uuid, Arc<ExecutionState>>>,
}

impl ExecutionRegistry {
    /// Create and track state for a new execution.
    pub fn insert(&self, execution_id: Uuid, action_name: &str) -> Arc<ExecutionState> {
        let state = Arc::new(ExecutionState::new(execution_id, action_name.to_string()));
        if let Ok(mut map) = self.executions.write() {
            map.insert(execution_id, Arc::clone(&state));
        }
        state
    }

    pub fn get(&self, execution_id: Uuid) -> Option<Arc<ExecutionState>> {
        self.executions
            .read()
            .ok()
            .and_then(|map| map.get(&execution_id).cloned())
    }

    pub fn remove(&self, execution_id: Uuid) {
        if let Ok(mut map) = self.executions.write() {
            map.remove(&execution_id);
        }
    }

    pub fn len(&self) -> usize {
        self.executions.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the state after [`COMPLETED_TTL`].
    pub fn schedule_cleanup(self: &Arc<Self>, execution_id: Uuid) {
        self.schedule_cleanup_after(execution_id, COMPLETED_TTL);
    }

    fn schedule_cleanup_after(self: &Arc<Self>, execution_id: Uuid, ttl: Duration) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            registry.remove(execution_id);
            log::debug!("[coordinator] reaped completed execution {execution_id}");
        });
    }
}
