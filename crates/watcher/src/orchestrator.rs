//! Add/remove orchestration
//!
//! This module owns the per-watcher state and the traversal state machine:
//! resolving the paths handed to `add`, walking directories, subscribing to
//! the backend, keeping the registries in step with the disk, and tearing
//! everything down again on removal, `unwatch` and close.

use crate::backend::{Backend, Closer, RawKind, RawNotice, SubscribeOptions};
use crate::config::WatcherConfig;
use crate::emitter::Emitter;
use crate::enumerate::{read_entries, DirEntryInfo, EntryFilter};
use crate::events::{EventKind, FileStats, FsEvent};
use crate::ignore::IgnoreEngine;
use crate::paths;
use crate::ready::{ReadyCoordinator, ReadyToken};
use crate::symlinks::{SymlinkTarget, SymlinkTracker};
use crate::throttle::{ThrottleAction, Throttler};
use crate::tree::WatchedTree;
use crate::write_stability::WriteStability;
use futures::StreamExt;
use glob::{MatchOptions, Pattern};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tidewatch_core::{Error, Result};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Where one `add` root is watched from and, for glob roots, what its
/// entries must match
#[derive(Debug)]
pub(crate) struct WatchScope {
    watch_path: PathBuf,
    glob: Option<Pattern>,
    /// Glob components below `watch_path`
    glob_parts: Vec<String>,
}

impl WatchScope {
    pub(crate) fn new(path: &Path) -> Result<Self> {
        if !paths::is_glob(path) {
            return Ok(Self::plain(path));
        }
        let text = path.to_string_lossy();
        let glob = Pattern::new(&text).map_err(|e| Error::pattern(text.to_string(), e.to_string()))?;
        let watch_path = paths::glob_parent(path);
        let glob_parts = path
            .strip_prefix(&watch_path)
            .map(|rest| {
                rest.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            watch_path,
            glob: Some(glob),
            glob_parts,
        })
    }

    pub(crate) fn plain(path: &Path) -> Self {
        Self {
            watch_path: path.to_path_buf(),
            glob: None,
            glob_parts: Vec::new(),
        }
    }

    fn has_glob(&self) -> bool {
        self.glob.is_some()
    }

    /// Whether `path` matches the glob (always true without one)
    fn matches(&self, path: &Path) -> bool {
        self.glob
            .as_ref()
            .is_none_or(|glob| glob.matches_path_with(path, GLOB_OPTIONS))
    }

    /// Whether matches could exist at or below `dir`
    fn may_contain(&self, dir: &Path) -> bool {
        if !self.has_glob() {
            return true;
        }
        let Ok(relative) = dir.strip_prefix(&self.watch_path) else {
            return false;
        };
        for (i, component) in relative.components().enumerate() {
            let Some(part) = self.glob_parts.get(i) else {
                return false;
            };
            if part == "**" {
                return true;
            }
            let component = component.as_os_str().to_string_lossy();
            let matched = Pattern::new(part)
                .map(|p| p.matches_with(&component, GLOB_OPTIONS))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        true
    }

    /// Listing filter: directories and links pass while they may lead to a match
    fn entry_filter(self: &Arc<Self>) -> EntryFilter {
        let dirs = Arc::clone(self);
        let files = Arc::clone(self);
        EntryFilter::all()
            .with_directory_filter(move |entry| {
                dirs.may_contain(&entry.full_path) || dirs.matches(&entry.full_path)
            })
            .with_file_filter(move |entry| {
                files.matches(&entry.full_path)
                    || (entry.stats.is_symlink() && files.may_contain(&entry.full_path))
            })
    }
}

/// One unit of traversal work
struct AddRequest {
    path: PathBuf,
    /// Part of the initial scan of an `add` call
    initial: bool,
    depth: u32,
    scope: Arc<WatchScope>,
    /// Only this child of the directory is of interest
    target: Option<OsString>,
    token: ReadyToken,
}

/// Everything one watcher instance knows
pub(crate) struct WatchState {
    pub(crate) config: WatcherConfig,
    pub(crate) cwd: Option<PathBuf>,
    follow: bool,
    backend: Arc<dyn Backend>,
    pub(crate) runtime: Handle,
    pub(crate) cancel: CancellationToken,
    pub(crate) emitter: Emitter,
    pub(crate) ignore: IgnoreEngine,
    pub(crate) tree: WatchedTree,
    pub(crate) throttler: Throttler,
    pub(crate) symlinks: SymlinkTracker,
    pub(crate) writes: Option<WriteStability>,
    pub(crate) atomic_delay: Option<Duration>,
    pub(crate) pending_unlinks: Mutex<HashMap<PathBuf, FsEvent>>,
    pub(crate) ready: ReadyCoordinator,
    closers: Mutex<HashMap<PathBuf, Vec<Closer>>>,
}

impl fmt::Debug for WatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchState")
            .field("cwd", &self.cwd)
            .field("closed", &self.is_closed())
            .field("watched_dirs", &self.tree.dir_count())
            .field("subscriptions", &self.closers.lock().len())
            .finish()
    }
}

impl WatchState {
    /// Build the state for one watcher; requires a tokio runtime
    pub(crate) fn new(config: WatcherConfig, backend: Arc<dyn Backend>) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::watcher(format!("A tokio runtime is required: {e}")))?;
        config.validate()?;

        let cwd = config.cwd.as_deref().map(paths::resolve);
        let atomic_delay = config.atomic_delay();
        let ignore = IgnoreEngine::builder()
            .patterns(config.ignored.clone())
            .matchers(config.ignore_matchers.clone())
            .cwd(cwd.clone())
            .atomic(atomic_delay.is_some())
            .ignore_permission_errors(config.ignore_permission_errors)
            .build()?;
        let writes = config.await_write_finish().map(WriteStability::new);
        let follow = config.follow_symlinks;

        Ok(Arc::new_cyclic(|weak: &Weak<WatchState>| {
            let hook_state = weak.clone();
            let ready = ReadyCoordinator::new(Arc::new(move |epoch| {
                if let Some(state) = hook_state.upgrade() {
                    state.schedule_ready(epoch);
                }
            }));
            WatchState {
                config,
                cwd,
                follow,
                backend,
                runtime,
                cancel: CancellationToken::new(),
                emitter: Emitter::new(),
                ignore,
                tree: WatchedTree::new(),
                throttler: Throttler::new(),
                symlinks: SymlinkTracker::new(),
                writes,
                atomic_delay,
                pending_unlinks: Mutex::new(HashMap::new()),
                ready,
                closers: Mutex::new(HashMap::new()),
            }
        }))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Absolute, normalized form of a caller-supplied path
    pub(crate) fn resolve_input(&self, path: &Path) -> PathBuf {
        paths::resolve(&paths::absolutize(path, self.cwd.as_deref()))
    }

    /// Emit `ready` on a later scheduler turn
    fn schedule_ready(self: &Arc<Self>, epoch: u64) {
        let state = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::task::yield_now().await;
            if !state.is_closed() {
                info!("Watcher ready (epoch {})", epoch);
                state.emitter.emit_ready();
            }
        });
    }

    fn subscribe_options(&self, path: &Path) -> SubscribeOptions {
        let poll_interval = self.config.use_polling.then(|| {
            if self.config.binary_interval_enabled() && paths::is_binary_path(path) {
                self.config.binary_interval()
            } else {
                self.config.interval()
            }
        });
        SubscribeOptions {
            persistent: self.config.persistent,
            poll_interval,
        }
    }

    fn add_closer(&self, path: &Path, closer: Closer) {
        if self.is_closed() {
            closer.close();
            return;
        }
        self.closers
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .push(closer);
    }

    fn close_path_closers(&self, path: &Path) {
        let closers = self.closers.lock().remove(path);
        for closer in closers.into_iter().flatten() {
            closer.close();
        }
    }

    fn close_subtree_closers(&self, root: &Path) {
        let closers: Vec<Closer> = {
            let mut map = self.closers.lock();
            let keys: Vec<PathBuf> = map.keys().filter(|p| p.starts_with(root)).cloned().collect();
            keys.iter().filter_map(|k| map.remove(k)).flatten().collect()
        };
        for closer in closers {
            closer.close();
        }
    }

    /// Start watching `roots`, arming one ready unit per root
    pub(crate) fn add_paths(self: &Arc<Self>, roots: Vec<PathBuf>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::watcher("Watcher is closed"));
        }
        let scopes = roots
            .iter()
            .map(|root| WatchScope::new(root).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let tokens = self.ready.arm(roots.len());
        for ((root, scope), token) in roots.into_iter().zip(scopes).zip(tokens) {
            self.ignore.remove_unwatched(&root);
            debug!("Adding watch root {:?}", root);
            let state = Arc::clone(self);
            self.runtime.spawn(async move { state.add_root(scope, token).await });
        }
        Ok(())
    }

    async fn add_root(self: Arc<Self>, scope: Arc<WatchScope>, token: ReadyToken) {
        let request = AddRequest {
            path: scope.watch_path.clone(),
            initial: true,
            depth: 0,
            scope: Arc::clone(&scope),
            target: None,
            token,
        };
        if let Some(missing) = self.add_path(request).await {
            self.watch_missing(missing).await;
        }
    }

    /// Watch the nearest existing ancestor of `missing`, narrowed to the
    /// child leading back to it
    async fn watch_missing(self: &Arc<Self>, missing: PathBuf) {
        let mut missing = missing;
        loop {
            if self.is_closed() {
                return;
            }
            let (parent, name) = paths::split(&missing);
            if parent == missing {
                return;
            }
            debug!("Waiting for {:?} to appear in {:?}", name, parent);
            let request = AddRequest {
                path: parent.clone(),
                initial: false,
                depth: 0,
                scope: Arc::new(WatchScope::plain(&parent)),
                target: Some(name),
                token: ReadyToken::detached(),
            };
            match self.add_path(request).await {
                Some(_) if parent.parent().is_some() => missing = parent,
                _ => return,
            }
        }
    }

    fn spawn_add(self: &Arc<Self>, request: AddRequest) {
        let state = Arc::clone(self);
        self.runtime.spawn(async move {
            state.add_path(request).await;
        });
    }

    /// Resolve one path and hand it to the matching handler
    ///
    /// Returns the path when it does not exist, so a root can be watched
    /// for its appearance.
    async fn add_path(self: &Arc<Self>, request: AddRequest) -> Option<PathBuf> {
        let path = request.path.clone();
        if self.is_closed() || self.ignore.is_ignored(&path, None) {
            return None;
        }

        let follow = self.follow && !request.scope.has_glob();
        let metadata = if follow {
            tokio::fs::metadata(&path).await
        } else {
            tokio::fs::symlink_metadata(&path).await
        };
        if self.is_closed() {
            return None;
        }
        let stats = match metadata {
            Ok(metadata) => FileStats::from(&metadata),
            Err(e) => {
                let error = Error::fs(&path, e);
                let missing = error.is_benign_absence();
                self.emit_error(error);
                return missing.then_some(path);
            }
        };
        if self.ignore.is_ignored(&path, Some(&stats)) {
            trace!("Ignoring {:?}", path);
            return None;
        }

        if stats.is_dir() {
            let real = if follow {
                tokio::fs::canonicalize(&path).await.unwrap_or_else(|_| path.clone())
            } else {
                path.clone()
            };
            if self.is_closed() {
                return None;
            }
            let closer = self.handle_dir(&request, &stats, &real, follow).await;
            if real != path {
                self.symlinks.set(&path, SymlinkTarget::Path(real));
            }
            if let Some(closer) = closer {
                self.add_closer(&path, closer);
            }
        } else if stats.is_symlink() {
            self.handle_link_root(&request, &stats).await;
        } else if let Some(closer) = self.handle_file(&path, &stats, request.initial) {
            self.add_closer(&path, closer);
        }
        None
    }

    async fn handle_dir(
        self: &Arc<Self>,
        request: &AddRequest,
        stats: &FileStats,
        real: &Path,
        follow: bool,
    ) -> Option<Closer> {
        let dir = &request.path;
        let (parent, name) = paths::split(dir);
        let newly_tracked = self.tree.add(&parent, &name);
        let quiet = request.initial && self.config.ignore_initial;
        if newly_tracked && !quiet && request.target.is_none() && request.scope.matches(dir) {
            self.emit(EventKind::AddDir, dir, Some(stats.clone()));
        }
        self.tree.ensure(dir);

        if !self.config.allows_depth(request.depth) {
            trace!("Depth limit reached at {:?}", dir);
            return None;
        }
        if follow && !self.symlinks.claim_descent(real, dir) {
            debug!("Not descending {:?}: {:?} is already an ancestor", dir, real);
            return None;
        }

        if request.target.is_none() {
            self.handle_read(
                dir,
                request.initial,
                &request.scope,
                None,
                request.depth,
                &request.token,
            )
            .await;
            if self.is_closed() {
                return None;
            }
        }
        self.subscribe_dir(dir, &request.scope, request.target.clone(), request.depth)
    }

    /// Re-enumerate `dir`, adding new children and removing vanished ones
    async fn handle_read(
        self: &Arc<Self>,
        dir: &Path,
        initial: bool,
        scope: &Arc<WatchScope>,
        target: Option<&OsStr>,
        depth: u32,
        token: &ReadyToken,
    ) {
        let mut initial = initial;
        loop {
            let throttle = if scope.has_glob() {
                None
            } else {
                match self
                    .throttler
                    .throttle(ThrottleAction::ReadDir, dir, ThrottleAction::ReadDir.window())
                {
                    Some(guard) => Some(guard),
                    None => return,
                }
            };

            let previous: BTreeSet<OsString> = self.tree.children(dir).into_iter().collect();
            let mut current: HashSet<OsString> = HashSet::new();
            let mut entries = Box::pin(read_entries(dir, scope.entry_filter()));
            while let Some(entry) = entries.next().await {
                if self.is_closed() {
                    return;
                }
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let error = Error::fs(dir, e);
                        let gone = error.is_benign_absence();
                        self.emit_error(error);
                        if !gone {
                            return;
                        }
                        break;
                    }
                };
                if self.ignore.is_ignored(&entry.full_path, Some(&entry.stats)) {
                    continue;
                }
                current.insert(entry.name.clone());

                if entry.stats.is_symlink() && self.handle_link_entry(dir, &entry, initial).await {
                    continue;
                }
                if self.is_closed() {
                    return;
                }

                let wanted = match target {
                    Some(target) => entry.name.as_os_str() == target,
                    None => true,
                } && !previous.contains(&entry.name);
                if wanted {
                    self.spawn_add(AddRequest {
                        path: entry.full_path,
                        initial,
                        depth: depth + 1,
                        scope: Arc::clone(scope),
                        target: None,
                        token: token.fork(),
                    });
                }
            }
            if self.is_closed() {
                return;
            }

            let suppressed = throttle.map_or(0, |guard| guard.clear());
            for name in previous {
                if current.contains(&name) {
                    continue;
                }
                if scope.has_glob() && !scope.matches(&dir.join(&name)) {
                    continue;
                }
                self.remove(dir, &name);
            }

            if suppressed == 0 {
                return;
            }
            trace!("Re-reading {:?} after {} suppressed notifications", dir, suppressed);
            initial = false;
        }
    }

    /// A symlink met while reading a directory; returns true when handled
    async fn handle_link_entry(self: &Arc<Self>, dir: &Path, entry: &DirEntryInfo, initial: bool) -> bool {
        let full = &entry.full_path;
        if !self.follow {
            let link_target = match tokio::fs::read_link(full).await {
                Ok(link_target) => link_target,
                Err(e) => {
                    self.emit_error(Error::fs(full, e));
                    return true;
                }
            };
            if self.is_closed() {
                return true;
            }
            let recorded = SymlinkTarget::Path(link_target);
            if self.tree.has(dir, &entry.name) {
                if self.symlinks.get(full).as_ref() != Some(&recorded) {
                    self.symlinks.set(full, recorded);
                    self.emit(EventKind::Change, full, Some(entry.stats.clone()));
                }
            } else {
                self.tree.add(dir, &entry.name);
                self.symlinks.set(full, recorded);
                if !(initial && self.config.ignore_initial) {
                    self.emit(EventKind::Add, full, Some(entry.stats.clone()));
                }
            }
            return true;
        }

        if self.symlinks.contains(full) {
            return true;
        }
        self.symlinks.set(full, SymlinkTarget::Followed);
        false
    }

    /// A root that is itself a symlink and is not followed
    async fn handle_link_root(self: &Arc<Self>, request: &AddRequest, stats: &FileStats) {
        let path = &request.path;
        let link_target = tokio::fs::read_link(path).await.unwrap_or_else(|_| path.clone());
        if self.is_closed() {
            return;
        }
        let (parent, name) = paths::split(path);
        if self.tree.add(&parent, &name) && !(request.initial && self.config.ignore_initial) {
            self.emit(EventKind::Add, path, Some(stats.clone()));
        }
        self.symlinks.set(path, SymlinkTarget::Path(link_target));

        let scope = Arc::new(WatchScope::plain(&parent));
        if let Some(closer) = self.subscribe_dir(&parent, &scope, Some(name), request.depth) {
            self.add_closer(path, closer);
        }
    }

    fn handle_file(self: &Arc<Self>, file: &Path, stats: &FileStats, initial: bool) -> Option<Closer> {
        let (parent, name) = paths::split(file);
        if !self.tree.add(&parent, &name) {
            return None;
        }
        let closer = self.subscribe_file(file, stats.clone());

        if !(initial && self.config.ignore_initial) && !self.ignore.is_ignored(file, None) {
            if self
                .throttler
                .throttle(ThrottleAction::Add, file, ThrottleAction::Add.window())
                .is_none()
            {
                return closer;
            }
            self.emit(EventKind::Add, file, Some(stats.clone()));
        }
        closer
    }

    fn subscribe_file(self: &Arc<Self>, file: &Path, stats: FileStats) -> Option<Closer> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.backend.subscribe(file, &self.subscribe_options(file), tx) {
            Ok(closer) => {
                let state = Arc::clone(self);
                let file = file.to_path_buf();
                self.runtime.spawn(async move { state.file_listener(file, stats, rx).await });
                Some(closer)
            }
            Err(e) => {
                self.emit_error(e);
                None
            }
        }
    }

    async fn file_listener(
        self: Arc<Self>,
        file: PathBuf,
        stats: FileStats,
        rx: mpsc::UnboundedReceiver<RawNotice>,
    ) {
        let mut rx = rx;
        let mut previous = stats;
        loop {
            let notice = tokio::select! {
                _ = self.cancel.cancelled() => return,
                notice = rx.recv() => notice,
            };
            let Some(notice) = notice else {
                return;
            };
            let event = match notice {
                RawNotice::Error(error) => {
                    self.handle_backend_error(&file, error).await;
                    continue;
                }
                RawNotice::Event(event) => event,
            };
            if event.kind == RawKind::Access {
                continue;
            }

            let metadata = tokio::fs::metadata(&file).await;
            if self.is_closed() {
                return;
            }
            let current = match metadata {
                Ok(metadata) => FileStats::from(&metadata),
                Err(_) => {
                    let (parent, name) = paths::split(&file);
                    self.remove(&parent, &name);
                    continue;
                }
            };

            if current.differs_from(&previous) {
                self.emit(EventKind::Change, &file, Some(current.clone()));
            }
            if current.ino != 0 && previous.ino != 0 && current.ino != previous.ino {
                debug!("{:?} was replaced; rebinding its watch", file);
                self.close_path_closers(&file);
                let (tx, next_rx) = mpsc::unbounded_channel();
                match self.backend.subscribe(&file, &self.subscribe_options(&file), tx) {
                    Ok(closer) => {
                        self.add_closer(&file, closer);
                        rx = next_rx;
                    }
                    Err(e) => self.emit_error(e),
                }
            }
            previous = current;
        }
    }

    fn subscribe_dir(
        self: &Arc<Self>,
        dir: &Path,
        scope: &Arc<WatchScope>,
        target: Option<OsString>,
        depth: u32,
    ) -> Option<Closer> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.backend.subscribe(dir, &self.subscribe_options(dir), tx) {
            Ok(closer) => {
                let state = Arc::clone(self);
                let dir = dir.to_path_buf();
                let scope = Arc::clone(scope);
                self.runtime
                    .spawn(async move { state.dir_listener(dir, scope, target, depth, rx).await });
                Some(closer)
            }
            Err(e) => {
                self.emit_error(e);
                None
            }
        }
    }

    async fn dir_listener(
        self: Arc<Self>,
        dir: PathBuf,
        scope: Arc<WatchScope>,
        target: Option<OsString>,
        depth: u32,
        rx: mpsc::UnboundedReceiver<RawNotice>,
    ) {
        let mut rx = rx;
        loop {
            let notice = tokio::select! {
                _ = self.cancel.cancelled() => return,
                notice = rx.recv() => notice,
            };
            match notice {
                None => return,
                Some(RawNotice::Error(error)) => self.handle_backend_error(&dir, error).await,
                Some(RawNotice::Event(event)) if event.kind == RawKind::Access => {}
                Some(RawNotice::Event(event)) => {
                    trace!("{:?} notified about {:?}", dir, event.path);
                    let state = Arc::clone(&self);
                    let dir = dir.clone();
                    let scope = Arc::clone(&scope);
                    let target = target.clone();
                    self.runtime.spawn(async move {
                        let token = ReadyToken::detached();
                        state
                            .handle_read(&dir, false, &scope, target.as_deref(), depth, &token)
                            .await;
                    });
                }
            }
        }
    }

    /// Backend errors about a path; permission errors only count while the
    /// path can still be opened
    async fn handle_backend_error(&self, path: &Path, error: Arc<Error>) {
        if error.is_permission() && tokio::fs::File::open(path).await.is_err() {
            trace!("Dropping permission error for inaccessible {:?}", path);
            return;
        }
        self.emit_error_arc(error);
    }

    /// Removal cascade for `name` in `dir`
    pub(crate) fn remove(self: &Arc<Self>, dir: &Path, name: &OsStr) {
        let path = dir.join(name);
        let is_dir = self.tree.contains_dir(&path);

        if self
            .throttler
            .throttle(ThrottleAction::Remove, &path, ThrottleAction::Remove.window())
            .is_none()
        {
            return;
        }

        // The only watched directory lost its file; wait for it to come back
        if !is_dir && self.tree.dir_count() == 1 {
            self.rearm_parent(dir, name);
        }

        for child in self.tree.children(&path) {
            self.remove(&path, &child);
        }

        let removal = self.tree.remove(dir, name);
        if removal.now_empty {
            self.schedule_vanish_check(dir);
        }
        self.symlinks.remove(&path);
        self.symlinks.release_descent(&path);

        let emitted = self.display_path(&path);
        let cancelled_add = self
            .writes
            .as_ref()
            .and_then(|writes| writes.cancel(&emitted))
            .is_some_and(|kind| kind == EventKind::Add);

        self.tree.drop_dir(&path);
        if removal.was_present && !cancelled_add && !self.ignore.is_ignored(&path, None) {
            let kind = if is_dir {
                EventKind::UnlinkDir
            } else {
                EventKind::Unlink
            };
            self.emit(kind, &path, None);
        }
        self.close_path_closers(&path);
    }

    fn rearm_parent(self: &Arc<Self>, dir: &Path, name: &OsStr) {
        let request = AddRequest {
            path: dir.to_path_buf(),
            initial: false,
            depth: 0,
            scope: Arc::new(WatchScope::plain(dir)),
            target: Some(name.to_os_string()),
            token: ReadyToken::detached(),
        };
        self.spawn_add(request);
    }

    /// Once a directory has no tracked children, drop it if it is gone
    fn schedule_vanish_check(self: &Arc<Self>, dir: &Path) {
        let state = Arc::clone(self);
        let dir = dir.to_path_buf();
        self.runtime.spawn(async move {
            if tokio::fs::read_dir(&dir).await.is_ok() || state.is_closed() {
                return;
            }
            let (parent, name) = paths::split(&dir);
            if state.tree.has(&parent, &name) {
                state.remove(&parent, &name);
            }
        });
    }

    /// Stop watching `paths` and exclude them from future reads
    pub(crate) fn unwatch_paths(&self, targets: Vec<PathBuf>) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        for path in targets {
            if paths::is_glob(&path) {
                self.ignore.add_unwatched_glob(&path)?;
                let glob = WatchScope::new(&path)?;
                let matching: Vec<PathBuf> = self
                    .closers
                    .lock()
                    .keys()
                    .filter(|p| glob.matches(p))
                    .cloned()
                    .collect();
                for p in matching {
                    self.close_path_closers(&p);
                }
                continue;
            }

            debug!("Unwatching {:?}", path);
            let was_dir = self.tree.contains_dir(&path);
            self.close_subtree_closers(&path);
            let (parent, name) = paths::split(&path);
            self.tree.remove(&parent, &name);
            self.tree.drop_subtree(&path);
            self.symlinks.remove_subtree(&path);

            self.ignore.add_unwatched(&path, false);
            if was_dir {
                self.ignore.add_unwatched(&path, true);
            }
        }
        Ok(())
    }

    /// Watched directories and their children, keyed as listeners see paths
    pub(crate) fn watched(&self) -> BTreeMap<PathBuf, Vec<String>> {
        self.tree
            .snapshot()
            .into_iter()
            .map(|(dir, children)| {
                let children = children
                    .into_iter()
                    .map(|name| name.to_string_lossy().into_owned())
                    .collect();
                (self.display_path(&dir), children)
            })
            .collect()
    }

    /// Release everything; later notifications are dropped
    pub(crate) fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        info!("Closing watcher");

        self.emitter.clear();
        let closers = std::mem::take(&mut *self.closers.lock());
        for closer in closers.into_values().flatten() {
            closer.close();
        }
        self.throttler.clear();
        if let Some(writes) = &self.writes {
            writes.clear();
        }
        self.pending_unlinks.lock().clear();
        self.tree.clear();
        self.symlinks.clear();
        self.ready.reset();
    }
}
