//! Listener registry used to publish flag changes and status changes.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

/// Receiver of events of type `E`.
///
/// Implemented for any `Fn(&E)` closure that is `Send + Sync`.
pub trait Listener<E>: Send + Sync {
    fn on_event(&self, event: &E);
}

impl<E, T: Fn(&E) + Send + Sync> Listener<E> for T {
    fn on_event(&self, event: &E) {
        self(event);
    }
}

/// Handle returned by [`Broadcaster::register`], used to unregister the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fan-out of events to registered listeners.
///
/// Events are delivered synchronously on the broadcasting thread, after the registry lock has been
/// released, so a listener may register or unregister listeners.
pub struct Broadcaster<E> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn Listener<E>>)>>,
}

impl<E> Default for Broadcaster<E> {
    fn default() -> Self {
        Broadcaster {
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<E> Broadcaster<E> {
    pub fn new() -> Self {
        Broadcaster::default()
    }

    pub fn register(&self, listener: impl Listener<E> + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if no listener was registered under `id`.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn has_listeners(&self) -> bool {
        !self.lock().is_empty()
    }

    pub fn broadcast(&self, event: &E) {
        let listeners: Vec<Arc<dyn Listener<E>>> = self
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.on_event(event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Arc<dyn Listener<E>>)>> {
        self.listeners
            .lock()
            .expect("thread holding listeners lock should not panic")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::Broadcaster;

    #[test]
    fn delivers_to_registered_listeners_only() {
        let broadcaster = Broadcaster::<String>::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        assert!(!broadcaster.has_listeners());

        let first = {
            let received = received.clone();
            broadcaster.register(move |event: &String| {
                received.lock().unwrap().push(format!("first:{event}"))
            })
        };
        {
            let received = received.clone();
            broadcaster.register(move |event: &String| {
                received.lock().unwrap().push(format!("second:{event}"))
            });
        }

        broadcaster.broadcast(&"a".to_owned());
        assert!(broadcaster.unregister(first));
        assert!(!broadcaster.unregister(first));
        broadcaster.broadcast(&"b".to_owned());

        assert_eq!(
            *received.lock().unwrap(),
            vec!["first:a", "second:a", "second:b"]
        );
        assert!(broadcaster.has_listeners());
    }
}
