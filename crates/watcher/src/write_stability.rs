//! Holding add/change events until a file stops growing
//!
//! A pending write polls the file size every `poll_interval`. Once the size
//! has not moved for `stability_threshold`, the buffered event is released
//! with the final stats.

use crate::config::AwaitWriteFinish;
use crate::events::{EventKind, FileStats};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// How a pending write ended
#[derive(Debug)]
pub enum Settled {
    /// Size stayed put for the threshold
    Stable { kind: EventKind, stats: FileStats },
    /// The file could not be stated; the record is gone
    Failed(io::Error),
}

#[derive(Debug)]
struct PendingWrite {
    id: u64,
    last_change: Instant,
    kind: EventKind,
    task: Option<AbortHandle>,
}

/// Per-path pending write records
#[derive(Debug)]
pub struct WriteStability {
    settings: AwaitWriteFinish,
    pending: Arc<DashMap<PathBuf, PendingWrite>>,
    next_id: AtomicU64,
}

impl WriteStability {
    pub fn new(settings: AwaitWriteFinish) -> Self {
        Self {
            settings,
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Refresh `last_change` for an existing record
    pub fn touch(&self, path: &Path) -> bool {
        match self.pending.get_mut(path) {
            Some(mut record) => {
                record.last_change = Instant::now();
                trace!("Write still in progress: {:?}", path);
                true
            }
            None => false,
        }
    }

    /// Start tracking `path`, polling `stat_path` until stable
    ///
    /// When a record already exists it is only touched and `false` is
    /// returned. `on_settled` runs once, from the poll task.
    pub fn begin<F, Fut>(&self, path: &Path, stat_path: PathBuf, kind: EventKind, on_settled: F) -> bool
    where
        F: FnOnce(Settled) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.pending.entry(path.to_path_buf()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().last_change = Instant::now();
                return false;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingWrite {
                    id,
                    last_change: Instant::now(),
                    kind,
                    task: None,
                });
            }
        }
        debug!("Awaiting write finish for {:?} ({})", path, kind);

        let pending = Arc::clone(&self.pending);
        let key = path.to_path_buf();
        let settings = self.settings;
        let task = tokio::spawn(async move {
            let mut previous_size: Option<u64> = None;
            loop {
                tokio::time::sleep(settings.poll_interval()).await;

                let stats = match tokio::fs::metadata(&stat_path).await {
                    Ok(metadata) => FileStats::from(&metadata),
                    Err(e) => {
                        if pending.remove_if(&key, |_, record| record.id == id).is_some() {
                            on_settled(Settled::Failed(e)).await;
                        }
                        return;
                    }
                };

                let now = Instant::now();
                let stable = {
                    let Some(mut record) = pending.get_mut(&key) else {
                        return;
                    };
                    if record.id != id {
                        return;
                    }
                    if previous_size.is_some_and(|size| size != stats.size) {
                        record.last_change = now;
                    }
                    now.duration_since(record.last_change) >= settings.stability_threshold()
                };

                if stable {
                    if pending.remove_if(&key, |_, record| record.id == id).is_some() {
                        trace!("Write finished: {:?} ({} bytes)", key, stats.size);
                        on_settled(Settled::Stable { kind, stats }).await;
                    }
                    return;
                }
                previous_size = Some(stats.size);
            }
        });

        if let Some(mut record) = self.pending.get_mut(path) {
            if record.id == id {
                record.task = Some(task.abort_handle());
            }
        }
        true
    }

    /// Abandon the record for `path`, returning the event it was holding
    pub fn cancel(&self, path: &Path) -> Option<EventKind> {
        let (_, record) = self.pending.remove(path)?;
        if let Some(task) = record.task {
            task.abort();
        }
        debug!("Cancelled pending write for {:?}", path);
        Some(record.kind)
    }

    #[cfg(test)]
    pub fn is_pending(&self, path: &Path) -> bool {
        self.pending.contains_key(path)
    }

    pub fn clear(&self) {
        for entry in self.pending.iter() {
            if let Some(task) = &entry.value().task {
                task.abort();
            }
        }
        self.pending.clear();
    }
}
