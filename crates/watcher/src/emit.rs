//! Event emission pipeline
//!
//! Every public event passes through [`WatchState::emit`], which decides
//! whether to drop, defer or deliver it.

use crate::events::{EventKind, FileStats, FsEvent};
use crate::orchestrator::WatchState;
use crate::paths;
use crate::throttle::ThrottleAction;
use crate::write_stability::Settled;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tidewatch_core::Error;
use tracing::{debug, trace};

impl WatchState {
    /// The form of `path` handed to listeners
    pub(crate) fn display_path(&self, path: &Path) -> PathBuf {
        match &self.cwd {
            Some(cwd) => {
                let relative = paths::relative_to(cwd, path);
                if relative.as_os_str().is_empty() {
                    PathBuf::from(".")
                } else {
                    relative
                }
            }
            None => path.to_path_buf(),
        }
    }

    /// Emit `kind` for the absolute `path`
    pub(crate) fn emit(self: &Arc<Self>, kind: EventKind, path: &Path, stats: Option<FileStats>) {
        if self.is_closed() {
            return;
        }
        let emitted = self.display_path(path);

        if let Some(writes) = &self.writes {
            if writes.touch(&emitted) {
                return;
            }
        }

        let mut kind = kind;
        if let Some(delay) = self.atomic_delay {
            if kind == EventKind::Unlink {
                self.buffer_unlink(FsEvent::new(kind, emitted, stats), delay);
                return;
            }
            let mut pending = self.pending_unlinks.lock();
            if kind == EventKind::Add && pending.remove(&emitted).is_some() {
                debug!("Collapsed unlink+add of {:?} into change", emitted);
                kind = EventKind::Change;
            } else if pending.contains_key(&emitted) {
                // A buffered unlink owns the path until it flushes or an add replaces it
                trace!("Dropping {} for {:?} behind a buffered unlink", kind, emitted);
                return;
            }
        }

        if let Some(writes) = &self.writes {
            if matches!(kind, EventKind::Add | EventKind::Change) && self.ready.is_emitted() {
                let weak = Arc::downgrade(self);
                let settled_path = emitted.clone();
                let stat_path = path.to_path_buf();
                writes.begin(&emitted, path.to_path_buf(), kind, move |settled| async move {
                    if let Some(state) = weak.upgrade() {
                        state.settle_write(settled_path, &stat_path, settled);
                    }
                });
                return;
            }
        }

        if kind == EventKind::Change
            && self
                .throttler
                .throttle(ThrottleAction::Change, &emitted, ThrottleAction::Change.window())
                .is_none()
        {
            return;
        }

        let mut stats = stats;
        if self.config.always_stat && stats.is_none() && kind.carries_stats() {
            // Stat inline so events keep their emit order
            match std::fs::metadata(path) {
                Ok(metadata) => stats = Some(FileStats::from(&metadata)),
                Err(e) => {
                    trace!("Dropping {} for unstattable {:?}: {}", kind, path, e);
                    return;
                }
            }
        }

        self.deliver(FsEvent::new(kind, emitted, stats));
    }

    /// Hold an unlink for `delay`; an add in the meantime turns it into a change
    fn buffer_unlink(self: &Arc<Self>, event: FsEvent, delay: Duration) {
        let key = event.path.clone();
        {
            let mut pending = self.pending_unlinks.lock();
            if pending.contains_key(&key) {
                return;
            }
            pending.insert(key.clone(), event);
        }

        let state = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::select! {
                _ = state.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let event = state.pending_unlinks.lock().remove(&key);
                    if let Some(event) = event {
                        state.deliver(event);
                    }
                }
            }
        });
    }

    fn settle_write(&self, path: PathBuf, stat_path: &Path, settled: Settled) {
        if self.is_closed() {
            return;
        }
        match settled {
            Settled::Stable { kind, stats } => self.deliver(FsEvent::new(kind, path, Some(stats))),
            Settled::Failed(e) => self.emit_error(Error::fs(stat_path, e)),
        }
    }

    /// Fan an event out to listeners
    fn deliver(&self, event: FsEvent) {
        if self.is_closed() {
            return;
        }
        self.emitter.emit_event(&event);
    }

    /// Whether an error should reach `error` listeners
    pub(crate) fn should_surface(&self, error: &Error) -> bool {
        if self.is_closed() || error.is_benign_absence() {
            return false;
        }
        !(error.is_permission() && self.config.ignore_permission_errors)
    }

    pub(crate) fn emit_error(&self, error: Error) {
        if self.should_surface(&error) {
            self.emitter.emit_error(Arc::new(error));
        } else {
            trace!("Suppressed error: {}", error);
        }
    }

    pub(crate) fn emit_error_arc(&self, error: Arc<Error>) {
        if self.should_surface(&error) {
            self.emitter.emit_error(error);
        } else {
            trace!("Suppressed error: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::WatcherConfig;
    use crate::events::{EventKind, FileStats, FsEvent};
    use crate::orchestrator::WatchState;
    use crate::testing::{collect_events, ManualBackend};
    use pretty_assertions::assert_eq;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tidewatch_core::Error;

    fn state(config: WatcherConfig) -> Arc<WatchState> {
        WatchState::new(config, Arc::new(ManualBackend::new())).expect("state builds")
    }

    #[tokio::test(start_paused = true)]
    async fn test_paths_are_relative_to_cwd() {
        let state = state(WatcherConfig::builder().cwd("/base").atomic(false).build());
        let events = collect_events(&state);

        state.emit(EventKind::Add, Path::new("/base/dir/a.txt"), None);
        state.emit(EventKind::AddDir, Path::new("/base"), None);

        assert_eq!(
            *events.lock(),
            vec![
                FsEvent::new(EventKind::Add, "dir/a.txt", None),
                FsEvent::new(EventKind::AddDir, ".", None),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_changes_within_window_collapse() {
        let state = state(WatcherConfig::builder().atomic(false).build());
        let events = collect_events(&state);

        state.emit(EventKind::Change, Path::new("/r/a.txt"), None);
        state.emit(EventKind::Change, Path::new("/r/a.txt"), None);
        state.emit(EventKind::Change, Path::new("/r/b.txt"), None);
        assert_eq!(events.lock().len(), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        state.emit(EventKind::Change, Path::new("/r/a.txt"), None);
        assert_eq!(events.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_atomic_unlink_then_add_becomes_change() {
        let state = state(WatcherConfig::builder().atomic(true).build());
        let events = collect_events(&state);

        state.emit(EventKind::Unlink, Path::new("/r/a.txt"), None);
        state.emit(EventKind::Unlink, Path::new("/r/a.txt"), None);
        assert!(events.lock().is_empty());
        state.emit(EventKind::Add, Path::new("/r/a.txt"), None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            *events.lock(),
            vec![FsEvent::new(EventKind::Change, PathBuf::from("/r/a.txt"), None)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_atomic_change_behind_buffered_unlink_is_dropped() {
        let state = state(WatcherConfig::builder().atomic(true).build());
        let events = collect_events(&state);

        state.emit(EventKind::Unlink, Path::new("/r/a.txt"), None);
        state.emit(EventKind::Change, Path::new("/r/a.txt"), None);
        state.emit(EventKind::Change, Path::new("/r/b.txt"), None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            *events.lock(),
            vec![
                FsEvent::new(EventKind::Change, PathBuf::from("/r/b.txt"), None),
                FsEvent::new(EventKind::Unlink, PathBuf::from("/r/a.txt"), None),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_atomic_unlink_flushes_after_delay() {
        let state = state(WatcherConfig::builder().atomic_delay_ms(200).build());
        let events = collect_events(&state);

        state.emit(EventKind::Unlink, Path::new("/r/a.txt"), None);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(events.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            *events.lock(),
            vec![FsEvent::new(EventKind::Unlink, PathBuf::from("/r/a.txt"), None)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_after_close() {
        let state = state(WatcherConfig::builder().atomic(true).build());
        let events = collect_events(&state);

        state.emit(EventKind::Unlink, Path::new("/r/a.txt"), None);
        state.shutdown();
        state.emit(EventKind::Add, Path::new("/r/b.txt"), None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_always_stat_attaches_stats() {
        let dir = tempfile::tempdir().expect("test setup failed");
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").expect("test setup failed");

        let state = state(WatcherConfig::builder().always_stat(true).atomic(false).build());
        let events = collect_events(&state);

        state.emit(EventKind::Add, &file, None);
        state.emit(EventKind::Add, &dir.path().join("missing.txt"), None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stats.as_ref().map(|s| s.size), Some(5));
    }

    #[tokio::test]
    async fn test_always_stat_preserves_emit_order() {
        let dir = tempfile::tempdir().expect("test setup failed");
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").expect("test setup failed");
        let known = FileStats::from(&std::fs::metadata(&file).expect("test setup failed"));

        let state = state(WatcherConfig::builder().always_stat(true).atomic(false).build());
        let events = collect_events(&state);

        state.emit(EventKind::Add, &file, None);
        state.emit(EventKind::Change, &file, Some(known));

        let events = events.lock();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Add, EventKind::Change]);
        assert!(events.iter().all(|e| e.stats.is_some()));
    }

    #[tokio::test]
    async fn test_error_surfacing_policy() {
        let strict = state(WatcherConfig::default());
        let not_found = Error::fs("/r/a", std::io::Error::from(std::io::ErrorKind::NotFound));
        let denied = Error::fs("/r/a", std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!strict.should_surface(&not_found));
        assert!(strict.should_surface(&denied));
        assert!(strict.should_surface(&Error::watcher("boom")));

        let lenient = state(WatcherConfig::builder().ignore_permission_errors(true).build());
        assert!(!lenient.should_surface(&denied));
    }
}
