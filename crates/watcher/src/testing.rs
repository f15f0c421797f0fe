//! In-memory backend and helpers for unit tests

use crate::backend::{Backend, Closer, RawEvent, RawKind, RawNotice, RawSink, SubscribeOptions};
use crate::events::{FsEvent, Notification};
use crate::orchestrator::WatchState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tidewatch_core::{Error, Result};

#[derive(Default)]
struct Registry {
    sinks: HashMap<u64, (PathBuf, RawSink)>,
    failures: HashMap<PathBuf, io::ErrorKind>,
    options: HashMap<PathBuf, SubscribeOptions>,
}

/// Backend whose notifications are injected by the test
#[derive(Default, Clone)]
pub(crate) struct ManualBackend {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl ManualBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make subscriptions on `path` fail with `kind`
    pub(crate) fn fail_on(&self, path: &Path, kind: io::ErrorKind) {
        self.registry.lock().failures.insert(path.to_path_buf(), kind);
    }

    /// Deliver a notification as the native layer would
    pub(crate) fn inject(&self, kind: RawKind, path: &Path) {
        let registry = self.registry.lock();
        for (watched, sink) in registry.sinks.values() {
            if watched == path || path.parent() == Some(watched.as_path()) {
                let _ = sink.send(RawNotice::Event(RawEvent::new(kind, path)));
            }
        }
    }

    pub(crate) fn inject_error(&self, path: &Path, error: Error) {
        let error = Arc::new(error);
        let registry = self.registry.lock();
        for (watched, sink) in registry.sinks.values() {
            if watched == path {
                let _ = sink.send(RawNotice::Error(Arc::clone(&error)));
            }
        }
    }

    /// Number of live subscriptions on `path`
    pub(crate) fn subscriptions(&self, path: &Path) -> usize {
        self.registry
            .lock()
            .sinks
            .values()
            .filter(|(watched, _)| watched == path)
            .count()
    }

    /// Options passed with the latest subscription on `path`
    pub(crate) fn last_options(&self, path: &Path) -> Option<SubscribeOptions> {
        self.registry.lock().options.get(path).copied()
    }

    pub(crate) fn total_subscriptions(&self) -> usize {
        self.registry.lock().sinks.len()
    }
}

impl Backend for ManualBackend {
    fn subscribe(&self, path: &Path, options: &SubscribeOptions, sink: RawSink) -> Result<Closer> {
        let mut registry = self.registry.lock();
        if let Some(kind) = registry.failures.get(path) {
            return Err(Error::fs(path, io::Error::from(*kind)));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        registry.sinks.insert(id, (path.to_path_buf(), sink));
        registry.options.insert(path.to_path_buf(), *options);

        let handle = Arc::clone(&self.registry);
        Ok(Closer::new(move || {
            handle.lock().sinks.remove(&id);
        }))
    }
}

/// Record every event delivered to `all` listeners
pub(crate) fn collect_events(state: &Arc<WatchState>) -> Arc<Mutex<Vec<FsEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    state.emitter.on_all(Arc::new(move |event: &FsEvent| sink.lock().push(event.clone())));
    events
}

/// Record every notification, including errors and ready
pub(crate) fn collect_notifications(state: &Arc<WatchState>) -> Arc<Mutex<Vec<Notification>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let events = Arc::clone(&seen);
    state.emitter.on_all(Arc::new(move |event: &FsEvent| {
        events.lock().push(Notification::Event(event.clone()))
    }));
    let errors = Arc::clone(&seen);
    state.emitter.on_error(Arc::new(move |error: &Arc<Error>| {
        errors.lock().push(Notification::Error(Arc::clone(error)))
    }));
    let ready = Arc::clone(&seen);
    state.emitter.on_ready(Arc::new(move || ready.lock().push(Notification::Ready)));
    seen
}

/// Poll `condition` until it holds, failing the test after a few seconds
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
