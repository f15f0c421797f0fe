//! Public watcher handle
//!
//! [`FsWatcher`] wraps the shared watch state. Listeners are plain closures;
//! [`FsWatcher::notifications`] offers the same feed as a stream.

use crate::backend::{Backend, NotifyBackend};
use crate::config::WatcherConfig;
use crate::emitter::ListenerId;
use crate::events::{EventKind, FsEvent, Notification};
use crate::orchestrator::WatchState;
use futures::stream::{self, Stream};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidewatch_core::{Error, Result};
use tracing::debug;

/// Watches files and directories and reports normalized events
pub struct FsWatcher {
    state: Arc<WatchState>,
}

impl std::fmt::Debug for FsWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsWatcher").field("state", &self.state).finish()
    }
}

impl FsWatcher {
    /// Create a watcher on the process-wide notify backend
    ///
    /// `TIDEWATCH_USE_POLLING` and `TIDEWATCH_INTERVAL` override the
    /// configuration. Must be called inside a tokio runtime.
    pub fn new(config: WatcherConfig) -> Result<Self> {
        let mut config = config;
        config.apply_env_overrides()?;
        Self::with_backend(config, NotifyBackend::global())
    }

    /// Create a watcher on a caller-supplied backend
    pub fn with_backend(config: WatcherConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        let state = WatchState::new(config, backend)?;
        Ok(Self { state })
    }

    /// Start watching `paths`
    ///
    /// Paths may be files, directories, globs or paths that do not exist
    /// yet. Relative paths resolve against `cwd`. Fails only on invalid input
    /// or a closed watcher; everything else is reported through `error`.
    pub fn add<I, P>(&self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let roots = self.resolve_all(paths)?;
        debug!("add {:?}", roots);
        self.state.add_paths(roots)
    }

    /// Stop watching `paths` and everything below them
    pub fn unwatch<I, P>(&self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let roots = self.resolve_all(paths)?;
        debug!("unwatch {:?}", roots);
        self.state.unwatch_paths(roots)
    }

    fn resolve_all<I, P>(&self, paths: I) -> Result<Vec<PathBuf>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        paths
            .into_iter()
            .map(|path| {
                let path = path.as_ref();
                validate_input(path)?;
                Ok(self.state.resolve_input(path))
            })
            .collect()
    }

    /// Release every subscription; no event is emitted afterwards
    pub async fn close(&self) -> Result<()> {
        self.state.shutdown();
        tokio::task::yield_now().await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Watched directories mapped to their sorted child names
    pub fn get_watched(&self) -> BTreeMap<PathBuf, Vec<String>> {
        self.state.watched()
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.state.config
    }

    /// Listen for one kind of event
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&FsEvent) + Send + Sync + 'static,
    {
        self.state.emitter.on(kind, Arc::new(listener))
    }

    /// Listen for every event
    pub fn on_all<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&FsEvent) + Send + Sync + 'static,
    {
        self.state.emitter.on_all(Arc::new(listener))
    }

    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Arc<Error>) + Send + Sync + 'static,
    {
        self.state.emitter.on_error(Arc::new(listener))
    }

    pub fn on_ready<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state.emitter.on_ready(Arc::new(listener))
    }

    /// Remove a listener; false if it was not registered
    pub fn off(&self, id: ListenerId) -> bool {
        self.state.emitter.off(id)
    }

    /// Every event, error and ready signal from now on, in emission order
    ///
    /// The stream ends when the watcher is closed.
    pub fn notifications(&self) -> impl Stream<Item = Notification> + Send + 'static {
        let mut rx = self.state.emitter.subscribe();
        stream::poll_fn(move |cx| rx.poll_recv(cx))
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        self.state.shutdown();
    }
}

fn validate_input(path: &Path) -> Result<()> {
    let raw = path.as_os_str();
    if raw.is_empty() {
        return Err(Error::invalid_input("Empty path"));
    }
    if raw.as_encoded_bytes().contains(&0) {
        return Err(Error::invalid_input(format!(
            "Path contains a NUL byte: {}",
            path.display()
        )));
    }
    Ok(())
}
