//! Observer channel and abort flag for stage execution.
//!
//! Every stage node owns an [`EventChannel`]. Listeners are called
//! synchronously, in registration order, on the thread running the
//! execution. A listener that returns an error stops that execution.

use crate::core::error::{NodeId, PipelineError, PipelineResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Kind of event a listener subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Matches every event (registration filter only)
    Any,
    /// Execution of an output started
    Start,
    /// Fraction of the current execution completed
    Progress,
    /// A stage finished one internal iteration
    Iteration,
    /// Execution of an output finished
    End,
    /// Execution stopped on the abort flag
    Abort,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    /// Execution started
    Start,
    /// Fraction done, from 0.0 to 1.0
    Progress {
        /// Completed fraction
        fraction: f32,
    },
    /// Iteration `index` finished
    Iteration {
        /// Zero-based iteration number
        index: usize,
    },
    /// Execution finished and the output was produced
    End,
    /// Execution stopped on the abort flag
    Abort,
}

impl EventPayload {
    /// The kind this payload belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Start => EventKind::Start,
            EventPayload::Progress { .. } => EventKind::Progress,
            EventPayload::Iteration { .. } => EventKind::Iteration,
            EventPayload::End => EventKind::End,
            EventPayload::Abort => EventKind::Abort,
        }
    }
}

/// A delivered event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Node whose execution emitted the event.
    pub node_id: NodeId,
    /// Output being computed.
    pub output: String,
    /// Event data.
    pub payload: EventPayload,
}

impl Event {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Callback type for listeners.
pub type Listener = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by registration, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(u64);

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

struct Registration {
    id: ListenerId,
    kind: EventKind,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    // Removed entries leave a hole so removal stays O(1); holes are
    // compacted once they make up half the slots.
    slots: Vec<Option<Registration>>,
    positions: HashMap<ListenerId, usize>,
    live: usize,
}

impl Registry {
    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        self.positions.clear();
        for (pos, slot) in self.slots.iter().enumerate() {
            if let Some(reg) = slot {
                self.positions.insert(reg.id, pos);
            }
        }
    }
}

/// Registry of listeners keyed by event kind.
#[derive(Default)]
pub struct EventChannel {
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("listeners", &self.len())
            .finish()
    }
}

impl EventChannel {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events of `kind` (or every event for `EventKind::Any`).
    pub fn add_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.registry.lock();
        let pos = registry.slots.len();
        registry.slots.push(Some(Registration {
            id,
            kind,
            listener: Arc::new(listener),
        }));
        registry.positions.insert(id, pos);
        registry.live += 1;
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.lock();
        let Some(pos) = registry.positions.remove(&id) else {
            return false;
        };
        registry.slots[pos] = None;
        registry.live -= 1;
        if registry.live * 2 < registry.slots.len() {
            registry.compact();
        }
        true
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.registry.lock().live
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any listener would receive events of `kind`.
    pub fn has_listeners(&self, kind: EventKind) -> bool {
        self.registry
            .lock()
            .slots
            .iter()
            .flatten()
            .any(|reg| reg.kind == kind || reg.kind == EventKind::Any)
    }

    /// Deliver `event` to every matching listener in registration order.
    ///
    /// The first listener error stops delivery and is returned as
    /// `ListenerFailure`.
    pub fn notify(&self, event: &Event) -> PipelineResult<()> {
        let kind = event.kind();
        // Snapshot so listeners may register or deregister while being called.
        let listeners: Vec<Listener> = self
            .registry
            .lock()
            .slots
            .iter()
            .flatten()
            .filter(|reg| reg.kind == kind || reg.kind == EventKind::Any)
            .map(|reg| reg.listener.clone())
            .collect();

        for listener in listeners {
            listener(event).map_err(|e| PipelineError::ListenerFailure {
                node_id: event.node_id,
                kind,
                message: format!("{:#}", e),
            })?;
        }
        Ok(())
    }
}

/// Abort request shared between a stage node and whoever wants to stop it.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    /// Create a lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the running execution stop at its next check.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Lower the flag.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Whether an abort was requested.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
