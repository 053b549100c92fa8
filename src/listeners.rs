//! Push-event fan-out.
//!
//! The backend's stream reader dispatches every decoded event into an
//! [`EventHub`]. Run-scoped handlers (progress/completed/failed) are armed and
//! torn down as a unit through a [`ListenerSet`]; session-scoped handlers
//! (connected/disconnected) live for as long as their [`SessionSubscription`].

use crate::model::{BackendEvent, CompletedEvent, FailedEvent, ProgressEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// The three run-scoped handlers, registered together.
pub struct RunHandlers {
    pub on_progress: Handler<ProgressEvent>,
    pub on_completed: Handler<CompletedEvent>,
    pub on_failed: Handler<FailedEvent>,
}

/// Session-level connection notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { connection_id: String },
    Disconnected,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    progress: HashMap<u64, Handler<ProgressEvent>>,
    completed: HashMap<u64, Handler<CompletedEvent>>,
    failed: HashMap<u64, Handler<FailedEvent>>,
    session: HashMap<u64, Handler<SessionEvent>>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct EventHub {
    registry: Mutex<Registry>,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // A handler never runs under this lock, so poisoning only follows a panic in
        // map bookkeeping; the maps are still usable.
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Deliver one event. Handlers run after the registry lock is released.
    pub fn dispatch(&self, event: BackendEvent) {
        match event {
            BackendEvent::Connected { connection_id } => {
                let handlers: Vec<_> = self.lock().session.values().cloned().collect();
                for h in handlers {
                    h(SessionEvent::Connected {
                        connection_id: connection_id.clone(),
                    });
                }
            }
            BackendEvent::Disconnected => {
                let handlers: Vec<_> = self.lock().session.values().cloned().collect();
                for h in handlers {
                    h(SessionEvent::Disconnected);
                }
            }
            BackendEvent::Progress(ev) => {
                let handlers: Vec<_> = self.lock().progress.values().cloned().collect();
                if handlers.is_empty() {
                    tracing::debug!(task_id = %ev.task_id, "progress event with no armed listener");
                }
                for h in handlers {
                    h(ev.clone());
                }
            }
            BackendEvent::TaskCompleted(ev) => {
                let handlers: Vec<_> = self.lock().completed.values().cloned().collect();
                if handlers.is_empty() {
                    tracing::debug!(task_id = %ev.task_id, "completion event with no armed listener");
                }
                for h in handlers {
                    h(ev.clone());
                }
            }
            BackendEvent::TaskFailed(ev) => {
                let handlers: Vec<_> = self.lock().failed.values().cloned().collect();
                if handlers.is_empty() {
                    tracing::debug!(task_id = %ev.task_id, "failure event with no armed listener");
                }
                for h in handlers {
                    h(ev.clone());
                }
            }
        }
    }

    /// Register all three run handlers under a single lock acquisition.
    fn register_run(&self, handlers: RunHandlers) -> u64 {
        let mut reg = self.lock();
        let id = reg.next_id();
        reg.progress.insert(id, handlers.on_progress);
        reg.completed.insert(id, handlers.on_completed);
        reg.failed.insert(id, handlers.on_failed);
        id
    }

    fn unregister_run(&self, id: u64) {
        let mut reg = self.lock();
        reg.progress.remove(&id);
        reg.completed.remove(&id);
        reg.failed.remove(&id);
    }

    pub fn subscribe_session(self: &Arc<Self>, handler: Handler<SessionEvent>) -> SessionSubscription {
        let id = {
            let mut reg = self.lock();
            let id = reg.next_id();
            reg.session.insert(id, handler);
            id
        };
        SessionSubscription {
            hub: Arc::downgrade(self),
            id,
        }
    }

    /// Number of armed run subscriptions.
    #[cfg(test)]
    pub fn armed_runs(&self) -> usize {
        self.lock().progress.len()
    }

    #[cfg(test)]
    pub fn session_listeners(&self) -> usize {
        self.lock().session.len()
    }
}

/// Unsubscribes one run's handlers. Safe to invoke any number of times.
#[derive(Clone)]
pub struct TeardownHandle {
    inner: Arc<TeardownInner>,
}

struct TeardownInner {
    hub: Weak<EventHub>,
    id: u64,
    done: AtomicBool,
}

impl TeardownHandle {
    pub fn teardown(&self) {
        if self.inner.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(hub) = self.inner.hub.upgrade() {
            hub.unregister_run(self.inner.id);
        }
        tracing::trace!(subscription = self.inner.id, "run listeners torn down");
    }

    #[cfg(test)]
    pub fn is_torn_down(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }
}

impl Drop for TeardownInner {
    fn drop(&mut self) {
        if !*self.done.get_mut() {
            if let Some(hub) = self.hub.upgrade() {
                hub.unregister_run(self.id);
            }
        }
    }
}

/// Run-scoped listener set owned by the coordinator.
pub struct ListenerSet {
    hub: Arc<EventHub>,
    current: Option<TeardownHandle>,
}

impl ListenerSet {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self { hub, current: None }
    }

    /// Tear down any previous subscription, then register `handlers`.
    pub fn arm(&mut self, handlers: RunHandlers) -> TeardownHandle {
        self.teardown();
        let id = self.hub.register_run(handlers);
        let handle = TeardownHandle {
            inner: Arc::new(TeardownInner {
                hub: Arc::downgrade(&self.hub),
                id,
                done: AtomicBool::new(false),
            }),
        };
        tracing::trace!(subscription = id, "run listeners armed");
        self.current = Some(handle.clone());
        handle
    }

    pub fn teardown(&mut self) {
        if let Some(handle) = self.current.take() {
            handle.teardown();
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.current.as_ref().is_some_and(|h| !h.is_torn_down())
    }
}

impl Drop for ListenerSet {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Keeps a session handler registered until dropped or cancelled.
pub struct SessionSubscription {
    hub: Weak<EventHub>,
    id: u64,
}

impl SessionSubscription {
    pub fn cancel(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.lock().session.remove(&self.id);
        }
        self.hub = Weak::new();
    }
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
