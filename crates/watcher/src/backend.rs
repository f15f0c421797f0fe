//! Native notification backend
//!
//! The watch-state engine talks to the operating system through the
//! [`Backend`] trait. [`NotifyBackend`] implements it on top of the notify
//! crate, sharing one native watch per (mode, path) across every subscriber
//! in the process and reference counting it.

use notify::event::ModifyKind;
use notify::{
    Config as NotifyConfig, Event as NotifyEvent, EventKind as NotifyEventKind, PollWatcher,
    RecommendedWatcher, RecursiveMode, Watcher,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tidewatch_core::{Error, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Coarse classification of a native notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawKind {
    Create,
    Modify,
    Remove,
    Rename,
    Access,
    Other,
}

impl From<&NotifyEventKind> for RawKind {
    fn from(kind: &NotifyEventKind) -> Self {
        match kind {
            NotifyEventKind::Create(_) => Self::Create,
            NotifyEventKind::Modify(ModifyKind::Name(_)) => Self::Rename,
            NotifyEventKind::Modify(_) => Self::Modify,
            NotifyEventKind::Remove(_) => Self::Remove,
            NotifyEventKind::Access(_) => Self::Access,
            NotifyEventKind::Any | NotifyEventKind::Other => Self::Other,
        }
    }
}

/// A native notification about one path
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub kind: RawKind,
    pub path: PathBuf,
    /// The backend's own event, when it has one
    pub info: Option<Arc<NotifyEvent>>,
}

impl RawEvent {
    pub fn new(kind: RawKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            info: None,
        }
    }
}

/// What a subscription sink receives
#[derive(Debug, Clone)]
pub enum RawNotice {
    Event(RawEvent),
    Error(Arc<Error>),
}

pub type RawSink = mpsc::UnboundedSender<RawNotice>;

/// Options for a single subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Keep the subscription alive for the life of the process
    pub persistent: bool,
    /// Poll at this interval instead of using native notifications
    pub poll_interval: Option<Duration>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            poll_interval: None,
        }
    }
}

/// Releases one subscription; closing more than once is a no-op
#[derive(Clone)]
pub struct Closer {
    release: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl fmt::Debug for Closer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closer")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Closer {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Arc::new(Mutex::new(Some(Box::new(release)))),
        }
    }

    pub fn close(&self) {
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.release.lock().is_none()
    }
}

/// Source of native notifications for single, non-recursive paths
pub trait Backend: Send + Sync + 'static {
    /// Start delivering notices for `path` (and its direct children when it
    /// is a directory) to `sink`
    fn subscribe(&self, path: &Path, options: &SubscribeOptions, sink: RawSink) -> Result<Closer>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Mode {
    Native,
    Poll(Duration),
}

type SinkKey = (Mode, PathBuf);
type SinkMap = HashMap<SinkKey, HashMap<u64, RawSink>>;

struct Shared {
    /// Read by notify callbacks; never held while calling into notify
    sinks: Arc<Mutex<SinkMap>>,
    /// Serializes watch/unwatch against sink bookkeeping
    watchers: Mutex<HashMap<Mode, Box<dyn Watcher + Send>>>,
}

/// [`Backend`] over notify's recommended and polling watchers
pub struct NotifyBackend {
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl fmt::Debug for NotifyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyBackend")
            .field("watched_paths", &self.watched_count())
            .finish()
    }
}

static GLOBAL: LazyLock<Arc<NotifyBackend>> = LazyLock::new(|| Arc::new(NotifyBackend::new()));

impl Default for NotifyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyBackend {
    /// A private backend; native watchers are created on first use
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                sinks: Arc::new(Mutex::new(HashMap::new())),
                watchers: Mutex::new(HashMap::new()),
            }),
            next_id: AtomicU64::new(0),
        }
    }

    /// The process-wide backend shared by every watcher
    pub fn global() -> Arc<NotifyBackend> {
        Arc::clone(&GLOBAL)
    }

    /// Number of paths with a live native watch
    pub fn watched_count(&self) -> usize {
        self.shared.sinks.lock().len()
    }

    fn create_watcher(mode: Mode, sinks: Arc<Mutex<SinkMap>>) -> Result<Box<dyn Watcher + Send>> {
        let handler = move |res: notify::Result<NotifyEvent>| dispatch(&sinks, mode, res);
        match mode {
            Mode::Native => {
                let watcher = RecommendedWatcher::new(handler, NotifyConfig::default())
                    .map_err(|e| Error::watcher(format!("Failed to create watcher: {e}")))?;
                info!("Native file watcher initialized");
                Ok(Box::new(watcher))
            }
            Mode::Poll(interval) => {
                let config = NotifyConfig::default()
                    .with_poll_interval(interval)
                    .with_compare_contents(false);
                let watcher = PollWatcher::new(handler, config)
                    .map_err(|e| Error::watcher(format!("Failed to create poll watcher: {e}")))?;
                info!("Polling file watcher initialized ({:?})", interval);
                Ok(Box::new(watcher))
            }
        }
    }

    fn release(shared: &Shared, key: &SinkKey, id: u64) {
        let mut watchers = shared.watchers.lock();
        let now_unused = {
            let mut sinks = shared.sinks.lock();
            match sinks.get_mut(key) {
                Some(entry) => {
                    entry.remove(&id);
                    if entry.is_empty() {
                        sinks.remove(key);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if !now_unused {
            return;
        }
        if let Some(watcher) = watchers.get_mut(&key.0) {
            match watcher.unwatch(&key.1) {
                Ok(()) => debug!("Stopped watching {:?}", key.1),
                // The path may already be gone, which drops the native watch by itself
                Err(e) => trace!("Unwatch of {:?} failed: {}", key.1, e),
            }
        }
    }
}

impl Backend for NotifyBackend {
    fn subscribe(&self, path: &Path, options: &SubscribeOptions, sink: RawSink) -> Result<Closer> {
        let mode = match options.poll_interval {
            Some(interval) => Mode::Poll(interval),
            None => Mode::Native,
        };
        let key: SinkKey = (mode, path.to_path_buf());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut watchers = self.shared.watchers.lock();
        let first = {
            let mut sinks = self.shared.sinks.lock();
            let entry = sinks.entry(key.clone()).or_default();
            entry.insert(id, sink);
            entry.len() == 1
        };

        if first {
            let result = match watchers.get_mut(&mode) {
                Some(watcher) => watcher.watch(path, RecursiveMode::NonRecursive),
                None => {
                    let mut watcher = Self::create_watcher(mode, Arc::clone(&self.shared.sinks))
                        .inspect_err(|_| {
                            self.shared.sinks.lock().remove(&key);
                        })?;
                    let result = watcher.watch(path, RecursiveMode::NonRecursive);
                    watchers.insert(mode, watcher);
                    result
                }
            };
            if let Err(e) = result {
                self.shared.sinks.lock().remove(&key);
                return Err(map_notify_error(path, e));
            }
            debug!(
                "Watching {:?} ({}, persistent: {})",
                path,
                match mode {
                    Mode::Native => "native",
                    Mode::Poll(_) => "polling",
                },
                options.persistent
            );
        } else {
            trace!("Sharing existing watch on {:?}", path);
        }
        drop(watchers);

        let shared = Arc::clone(&self.shared);
        Ok(Closer::new(move || Self::release(&shared, &key, id)))
    }
}

fn map_notify_error(path: &Path, error: notify::Error) -> Error {
    match error.kind {
        notify::ErrorKind::Io(source) => Error::fs(path, source),
        notify::ErrorKind::PathNotFound | notify::ErrorKind::WatchNotFound => {
            Error::fs(path, io::Error::from(io::ErrorKind::NotFound))
        }
        other => Error::backend(path, format!("{other:?}")),
    }
}

/// Deliver a notify result to sinks registered on the path or its parent
fn dispatch(sinks: &Mutex<SinkMap>, mode: Mode, res: notify::Result<NotifyEvent>) {
    match res {
        Ok(event) => {
            trace!("Received notify event: {:?}", event);
            let kind = RawKind::from(&event.kind);
            let paths = event.paths.clone();
            let info = Arc::new(event);
            let sinks = sinks.lock();
            for path in paths {
                let notice = RawNotice::Event(RawEvent {
                    kind,
                    path: path.clone(),
                    info: Some(Arc::clone(&info)),
                });
                let parent = path.parent().map(Path::to_path_buf);
                let keys = std::iter::once(path).chain(parent);
                for key in keys {
                    if let Some(entry) = sinks.get(&(mode, key)) {
                        for sink in entry.values() {
                            let _ = sink.send(notice.clone());
                        }
                    }
                }
            }
        }
        Err(e) => {
            warn!("Notify error: {}", e);
            let sinks = sinks.lock();
            let targets: Vec<&RawSink> = if e.paths.is_empty() {
                sinks
                    .iter()
                    .filter(|((m, _), _)| *m == mode)
                    .flat_map(|(_, entry)| entry.values())
                    .collect()
            } else {
                e.paths
                    .iter()
                    .filter_map(|p| sinks.get(&(mode, p.clone())))
                    .flat_map(|entry| entry.values())
                    .collect()
            };
            let path = e.paths.first().cloned().unwrap_or_default();
            let error = Arc::new(map_notify_error(&path, e));
            for sink in targets {
                let _ = sink.send(RawNotice::Error(Arc::clone(&error)));
            }
        }
    }
}
