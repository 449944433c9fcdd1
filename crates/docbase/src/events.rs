//! Per-collection post-commit event bus (§4.7).
//!
//! The emitter is cheap to construct (a collection always holds one), but
//! payload construction is genuinely lazy: call sites check
//! [`EventEmitter::listener_count`] before building a [`CollectionEvent`]
//! so a collection with no listeners pays nothing beyond the check.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// The payload delivered to listeners for each mutating operation.
#[derive(Debug, Clone)]
pub enum CollectionEvent {
    Insert(Value),
    InsertMany(Vec<Value>),
    Update { before: Option<Value>, after: Value },
    UpdateMany(Vec<Value>),
    Replace { before: Value, after: Value },
    Delete(Value),
    DeleteMany(Vec<Value>),
    FindOneAndDelete(Option<Value>),
    FindOneAndUpdate { before: Option<Value>, after: Option<Value> },
    FindOneAndReplace { before: Option<Value>, after: Option<Value> },
    Drop,
}

type Listener = Arc<dyn Fn(&CollectionEvent) + Send + Sync>;

struct Registration {
    id: u64,
    listener: Listener,
    once: bool,
}

/// Opaque handle returned by [`EventEmitter::on`]/[`EventEmitter::once`],
/// used to unregister a specific listener via [`EventEmitter::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

/// A lazily-populated, chainable listener registry for one collection.
#[derive(Clone, Default)]
pub struct EventEmitter {
    registrations: Arc<Mutex<Vec<Registration>>>,
    next_id: Arc<AtomicU64>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, listener: impl Fn(&CollectionEvent) + Send + Sync + 'static) -> ListenerHandle {
        self.register(listener, false)
    }

    pub fn once(&self, listener: impl Fn(&CollectionEvent) + Send + Sync + 'static) -> ListenerHandle {
        self.register(listener, true)
    }

    fn register(&self, listener: impl Fn(&CollectionEvent) + Send + Sync + 'static, once: bool) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
        guard.push(Registration {
            id,
            listener: Arc::new(listener),
            once,
        });
        ListenerHandle(id)
    }

    pub fn off(&self, handle: ListenerHandle) {
        let mut guard = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
        guard.retain(|r| r.id != handle.0);
    }

    pub fn remove_all_listeners(&self) {
        let mut guard = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
        guard.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.registrations.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Delivers `event` to every registered listener, synchronously,
    /// removing any `once` listener after it fires. A listener that panics
    /// is caught so it cannot unwind into the caller's commit path; the
    /// panic is logged and otherwise swallowed.
    pub fn emit(&self, event: CollectionEvent) {
        let snapshot: Vec<Registration> = {
            let mut guard = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
            let snapshot = guard
                .iter()
                .map(|r| Registration {
                    id: r.id,
                    listener: r.listener.clone(),
                    once: r.once,
                })
                .collect();
            guard.retain(|r| !r.once);
            snapshot
        };

        for registration in snapshot {
            let listener = registration.listener.clone();
            let event_ref = &event;
            if catch_unwind(AssertUnwindSafe(|| listener(event_ref))).is_err() {
                tracing::warn!("collection event listener panicked; ignoring");
            }
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn lazy_listener_count_starts_at_zero() {
        let emitter = EventEmitter::new();
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn on_listener_fires_every_time() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        emitter.on(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(CollectionEvent::Drop);
        emitter.emit(CollectionEvent::Drop);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_listener_fires_only_once() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        emitter.once(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(CollectionEvent::Drop);
        emitter.emit(CollectionEvent::Drop);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn off_removes_a_specific_listener() {
        let emitter = EventEmitter::new();
        let handle = emitter.on(|_| {});
        assert_eq!(emitter.listener_count(), 1);
        emitter.off(handle);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn remove_all_listeners_clears_everything() {
        let emitter = EventEmitter::new();
        emitter.on(|_| {});
        emitter.on(|_| {});
        emitter.remove_all_listeners();
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn panicking_listener_does_not_abort_emit() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        emitter.on(|_| panic!("boom"));
        emitter.on(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(CollectionEvent::Drop);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
