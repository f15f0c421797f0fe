//! Listener registry and fan-out

use crate::events::{EventKind, FsEvent, Notification};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tidewatch_core::Error;
use tokio::sync::mpsc;
use tracing::trace;

pub type EventListener = Arc<dyn Fn(&FsEvent) + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&Arc<Error>) + Send + Sync>;
pub type ReadyListener = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by listener registration, used to remove the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    by_kind: HashMap<EventKind, Vec<(ListenerId, EventListener)>>,
    all: Vec<(ListenerId, EventListener)>,
    errors: Vec<(ListenerId, ErrorListener)>,
    ready: Vec<(ListenerId, ReadyListener)>,
}

/// Fans events out to registered listeners and notification channels
#[derive(Default)]
pub struct Emitter {
    listeners: RwLock<Listeners>,
    channels: Mutex<Vec<mpsc::UnboundedSender<Notification>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        f.debug_struct("Emitter")
            .field("kind_listeners", &listeners.by_kind.values().map(Vec::len).sum::<usize>())
            .field("all_listeners", &listeners.all.len())
            .field("error_listeners", &listeners.errors.len())
            .field("ready_listeners", &listeners.ready.len())
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on(&self, kind: EventKind, listener: EventListener) -> ListenerId {
        let id = self.next_id();
        self.listeners
            .write()
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, listener));
        id
    }

    pub fn on_all(&self, listener: EventListener) -> ListenerId {
        let id = self.next_id();
        self.listeners.write().all.push((id, listener));
        id
    }

    pub fn on_error(&self, listener: ErrorListener) -> ListenerId {
        let id = self.next_id();
        self.listeners.write().errors.push((id, listener));
        id
    }

    pub fn on_ready(&self, listener: ReadyListener) -> ListenerId {
        let id = self.next_id();
        self.listeners.write().ready.push((id, listener));
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        for kind_listeners in listeners.by_kind.values_mut() {
            kind_listeners.retain(|(existing, _)| *existing != id);
        }
        listeners.all.retain(|(existing, _)| *existing != id);
        listeners.errors.retain(|(existing, _)| *existing != id);
        listeners.ready.retain(|(existing, _)| *existing != id);
        before != listeners.len()
    }

    /// Open a channel that receives every notification
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.lock().push(tx);
        rx
    }

    /// Deliver to kind listeners, then `all` listeners, then channels
    pub fn emit_event(&self, event: &FsEvent) {
        trace!("Emitting {} {:?}", event.kind, event.path);
        let (kind_listeners, all_listeners) = {
            let listeners = self.listeners.read();
            let kind_listeners: Vec<EventListener> = listeners
                .by_kind
                .get(&event.kind)
                .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default();
            let all_listeners: Vec<EventListener> =
                listeners.all.iter().map(|(_, l)| Arc::clone(l)).collect();
            (kind_listeners, all_listeners)
        };
        for listener in kind_listeners.iter().chain(all_listeners.iter()) {
            listener(event);
        }
        self.broadcast(Notification::Event(event.clone()));
    }

    /// Deliver to error listeners and channels, never to `all` listeners
    pub fn emit_error(&self, error: Arc<Error>) {
        let listeners: Vec<ErrorListener> = self
            .listeners
            .read()
            .errors
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in &listeners {
            listener(&error);
        }
        self.broadcast(Notification::Error(error));
    }

    pub fn emit_ready(&self) {
        let listeners: Vec<ReadyListener> = self
            .listeners
            .read()
            .ready
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in &listeners {
            listener();
        }
        self.broadcast(Notification::Ready);
    }

    fn broadcast(&self, notification: Notification) {
        self.channels
            .lock()
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Drop every listener and close every channel
    pub fn clear(&self) {
        *self.listeners.write() = Listeners::default();
        self.channels.lock().clear();
    }
}

impl Listeners {
    fn len(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum::<usize>()
            + self.all.len()
            + self.errors.len()
            + self.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn recorder() -> (EventListener, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: EventListener = Arc::new(move |event: &FsEvent| {
            sink.lock()
                .push(format!("{} {}", event.kind, event.path.display()));
        });
        (listener, seen)
    }

    #[test]
    fn test_kind_listeners_before_all_listeners() {
        let emitter = Emitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let all_order = Arc::clone(&order);
        emitter.on_all(Arc::new(move |_: &FsEvent| all_order.lock().push("all")));
        let kind_order = Arc::clone(&order);
        emitter.on(EventKind::Add, Arc::new(move |_: &FsEvent| kind_order.lock().push("add")));

        emitter.emit_event(&FsEvent::new(EventKind::Add, "a.txt", None));
        assert_eq!(*order.lock(), vec!["add", "all"]);
    }

    #[test]
    fn test_listeners_filter_by_kind() {
        let emitter = Emitter::new();
        let (listener, seen) = recorder();
        emitter.on(EventKind::Unlink, listener);

        emitter.emit_event(&FsEvent::new(EventKind::Add, "a.txt", None));
        emitter.emit_event(&FsEvent::new(EventKind::Unlink, "a.txt", None));
        assert_eq!(*seen.lock(), vec!["unlink a.txt".to_string()]);
    }

    #[test]
    fn test_errors_skip_all_listeners() {
        let emitter = Emitter::new();
        let (listener, seen) = recorder();
        emitter.on_all(listener);
        let errors = Arc::new(Mutex::new(0));
        let error_count = Arc::clone(&errors);
        emitter.on_error(Arc::new(move |_: &Arc<Error>| *error_count.lock() += 1));

        emitter.emit_error(Arc::new(Error::watcher("boom")));
        assert!(seen.lock().is_empty());
        assert_eq!(*errors.lock(), 1);
    }

    #[test]
    fn test_off_and_clear() {
        let emitter = Emitter::new();
        let (listener, seen) = recorder();
        let id = emitter.on_all(listener);
        assert!(emitter.off(id));
        assert!(!emitter.off(id));

        emitter.emit_event(&FsEvent::new(EventKind::Change, "a.txt", None));
        assert!(seen.lock().is_empty());

        let mut rx = emitter.subscribe();
        emitter.clear();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_receives_everything() {
        let emitter = Emitter::new();
        let mut rx = emitter.subscribe();

        emitter.emit_event(&FsEvent::new(EventKind::AddDir, "dir", None));
        emitter.emit_error(Arc::new(Error::watcher("boom")));
        emitter.emit_ready();

        assert!(matches!(rx.recv().await, Some(Notification::Event(e)) if e.kind == EventKind::AddDir));
        assert!(matches!(rx.recv().await, Some(Notification::Error(_))));
        assert!(matches!(rx.recv().await, Some(Notification::Ready)));
    }
}
