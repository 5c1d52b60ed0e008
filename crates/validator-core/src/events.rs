//! Run event system.
//!
//! Two flavours: [`EventEmitter`] publishes [`RunEvent`]s on a
//! [`tokio::sync::broadcast`] channel for async observers, and [`Event`] keeps
//! plain callbacks that are invoked synchronously and removed when their
//! [`Subscription`] is dropped.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Events emitted while a single pipeline runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    RunStarted {
        pipeline: String,
        uuid: String,
        check_count: usize,
    },
    ContextReady {
        plugin: String,
        passed: bool,
        message: String,
    },
    CheckCompleted {
        check: String,
        passed: bool,
        message: String,
    },
    RunFinished {
        pipeline: String,
        passed: bool,
        duration_ms: u64,
    },
    RunErrored {
        pipeline: String,
        error: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers. Dropped when nobody listens.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

// ---------------------------------------------------------------------------
// Callback events
// ---------------------------------------------------------------------------

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Callbacks<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// A list of callbacks notified with `&T`.
pub struct Event<T> {
    inner: Arc<Mutex<Callbacks<T>>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Event<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Callbacks {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register `callback`. It stays registered until the returned
    /// subscription is dropped.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let id = guard.next_id;
            guard.next_id += 1;
            guard.entries.push((id, Arc::new(callback)));
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
                    guard.entries.retain(|(i, _)| *i != id);
                }
            })),
        }
    }

    /// Invoke every callback. Callbacks run outside the lock, so they may
    /// subscribe or unsubscribe.
    pub fn notify(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = {
            let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            guard.entries.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in callbacks {
            cb(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }
}

impl<T: 'static> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a callback registered; unsubscribes on drop.
#[must_use = "the callback is removed as soon as the subscription is dropped"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Keep the callback registered for the lifetime of the event source.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
